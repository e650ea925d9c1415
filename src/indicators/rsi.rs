use rust_decimal::Decimal;

/// Wilder smoothing state after folding a close-price series
#[derive(Debug, Clone, PartialEq)]
pub struct RsiState {
    pub avg_gain: Decimal,
    pub avg_loss: Decimal,
    pub length: usize,
    pub initialized: bool,
}

impl RsiState {
    pub fn new(length: usize) -> Self {
        Self {
            avg_gain: Decimal::ZERO,
            avg_loss: Decimal::ZERO,
            length,
            initialized: false,
        }
    }

    /// Fold a whole close history into smoothing state
    ///
    /// The first averages are the simple mean of the first `length` changes,
    /// every later change goes through one Wilder step. The state is rebuilt
    /// from scratch on every call, so the result depends only on `prices`.
    pub fn from_history(prices: &[Decimal], length: usize) -> Option<Self> {
        if length == 0 || prices.len() < length + 1 {
            return None;
        }

        let mut state = Self::new(length);
        let changes: Vec<Decimal> = prices.windows(2).map(|w| w[1] - w[0]).collect();
        let (seed, rest) = changes.split_at(length);

        let period = Decimal::from(length);
        let gain_sum: Decimal = seed.iter().map(|c| (*c).max(Decimal::ZERO)).sum();
        let loss_sum: Decimal = seed.iter().map(|c| (-*c).max(Decimal::ZERO)).sum();
        state.avg_gain = gain_sum / period;
        state.avg_loss = loss_sum / period;
        state.initialized = true;

        for change in rest {
            state.step(*change);
        }

        Some(state)
    }

    /// Apply one Wilder smoothing step for a new close-to-close change
    pub fn step(&mut self, change: Decimal) {
        let period = Decimal::from(self.length);
        let prior = Decimal::from(self.length - 1);
        let gain = change.max(Decimal::ZERO);
        let loss = (-change).max(Decimal::ZERO);

        self.avg_gain = (self.avg_gain * prior + gain) / period;
        self.avg_loss = (self.avg_loss * prior + loss) / period;
    }

    /// RSI for the current averages, 100 when there were no losses
    pub fn value(&self) -> Option<Decimal> {
        if !self.initialized {
            return None;
        }
        if self.avg_loss.is_zero() {
            return Some(Decimal::ONE_HUNDRED);
        }

        let rs = self.avg_gain / self.avg_loss;
        Some(Decimal::ONE_HUNDRED - Decimal::ONE_HUNDRED / (Decimal::ONE + rs))
    }
}

/// Calculate Relative Strength Index (RSI) with Wilder smoothing
///
/// Needs at least `period + 1` prices, otherwise returns `None`.
///
/// Values:
/// - RSI > 70: Overbought
/// - RSI < 30: Oversold
///
pub fn calculate_rsi(prices: &[Decimal], period: usize) -> Option<Decimal> {
    RsiState::from_history(prices, period)?.value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn reference_history() -> Vec<Decimal> {
        vec![
            dec!(44),
            dec!(44.25),
            dec!(44.5),
            dec!(43.75),
            dec!(44.5),
            dec!(44.3),
            dec!(45.1),
            dec!(45.2),
            dec!(44.9),
            dec!(45.5),
        ]
    }

    #[test]
    fn test_rsi_matches_wilder_reference() {
        let rsi = calculate_rsi(&reference_history(), 6).unwrap();

        // seed averages over the first 6 changes, then three smoothing steps
        let expected = dec!(69.88319386331939);
        assert!((rsi - expected).abs() < dec!(0.000001), "rsi = {}", rsi);
    }

    #[test]
    fn test_rsi_seed_value_only() {
        let history = &reference_history()[..7];
        let rsi = calculate_rsi(history, 6).unwrap();
        assert!((rsi - dec!(68.333333)).abs() < dec!(0.000001));
    }

    #[test]
    fn test_rsi_insufficient_data() {
        let prices = vec![dec!(100), dec!(102), dec!(101)];
        assert!(calculate_rsi(&prices, 6).is_none());
        assert!(calculate_rsi(&prices[..0], 6).is_none());
        assert!(calculate_rsi(&prices, 0).is_none());
    }

    #[test]
    fn test_rsi_all_gains() {
        let prices = vec![dec!(100), dec!(101), dec!(102), dec!(103), dec!(104), dec!(105)];
        assert_eq!(calculate_rsi(&prices, 5), Some(dec!(100)));
    }

    #[test]
    fn test_rsi_all_losses() {
        let prices = vec![dec!(105), dec!(104), dec!(103), dec!(102)];
        assert_eq!(calculate_rsi(&prices, 3), Some(Decimal::ZERO));
    }

    #[test]
    fn test_rsi_is_function_of_history() {
        let history = reference_history();
        let first = calculate_rsi(&history, 6);
        let second = calculate_rsi(&history, 6);
        assert_eq!(first, second);
    }

    #[test]
    fn test_step_matches_full_recompute() {
        let history = reference_history();
        let mut state = RsiState::from_history(&history[..9], 6).unwrap();
        state.step(history[9] - history[8]);

        let recomputed = RsiState::from_history(&history, 6).unwrap();
        assert_eq!(state.value(), recomputed.value());
    }
}
