use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

/// Global risk limits, all PnL thresholds in quote currency (USDT)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Cap on symbols holding a reservation, position or pending exit
    pub max_open_positions: usize,
    /// Force a close once unrealized PnL reaches this profit
    pub take_profit_usd: Decimal,
    /// Force a close once unrealized PnL falls to this loss (negative)
    pub stop_loss_usd: Decimal,
    /// Arm the trailing stop once PnL reaches this profit
    pub trailing_activation_usd: Option<Decimal>,
    /// Give-back from peak PnL that fires an armed trailing stop
    pub trailing_giveback_usd: Decimal,
    /// Seconds a symbol stays blocked after its position closes
    pub reentry_cooldown_secs: u64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_open_positions: 2,
            take_profit_usd: dec!(0.15),
            stop_loss_usd: dec!(-0.15),
            trailing_activation_usd: None,
            trailing_giveback_usd: dec!(0.05),
            reentry_cooldown_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PnlTrigger {
    TakeProfit,
    StopLoss,
    TrailingStop,
}

impl RiskLimits {
    /// Fixed take-profit / stop-loss check on a rounded PnL
    pub fn check_pnl(&self, pnl: Decimal) -> Option<PnlTrigger> {
        if pnl > Decimal::ZERO && pnl >= self.take_profit_usd {
            return Some(PnlTrigger::TakeProfit);
        }
        if pnl < Decimal::ZERO && pnl <= self.stop_loss_usd {
            return Some(PnlTrigger::StopLoss);
        }
        None
    }

    /// Whether a trailing stop should arm at this PnL
    pub fn trailing_arms_at(&self, pnl: Decimal) -> bool {
        self.trailing_activation_usd
            .is_some_and(|activation| pnl >= activation)
    }
}

/// Win/loss classification of a closed (or closing) trade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeOutcome {
    Win,
    Loss,
    Flat,
}

impl TradeOutcome {
    pub fn classify(pnl: Decimal) -> Self {
        if pnl > Decimal::ZERO {
            TradeOutcome::Win
        } else if pnl < Decimal::ZERO {
            TradeOutcome::Loss
        } else {
            TradeOutcome::Flat
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_profit_threshold() {
        let limits = RiskLimits::default();
        assert_eq!(limits.check_pnl(dec!(0.15)), Some(PnlTrigger::TakeProfit));
        assert_eq!(limits.check_pnl(dec!(0.14)), None);
    }

    #[test]
    fn test_stop_loss_threshold() {
        let limits = RiskLimits::default();
        assert_eq!(limits.check_pnl(dec!(-0.15)), Some(PnlTrigger::StopLoss));
        assert_eq!(limits.check_pnl(dec!(-0.1)), None);
        assert_eq!(limits.check_pnl(Decimal::ZERO), None);
    }

    #[test]
    fn test_trailing_disabled_by_default() {
        let limits = RiskLimits::default();
        assert!(!limits.trailing_arms_at(dec!(100)));

        let limits = RiskLimits {
            trailing_activation_usd: Some(dec!(0.1)),
            ..Default::default()
        };
        assert!(limits.trailing_arms_at(dec!(0.1)));
        assert!(!limits.trailing_arms_at(dec!(0.09)));
    }

    #[test]
    fn test_trade_outcome() {
        assert_eq!(TradeOutcome::classify(dec!(0.2)), TradeOutcome::Win);
        assert_eq!(TradeOutcome::classify(dec!(-0.2)), TradeOutcome::Loss);
        assert_eq!(TradeOutcome::classify(Decimal::ZERO), TradeOutcome::Flat);
    }
}
