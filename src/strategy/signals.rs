use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::execution::candle_window::PatternContext;
use crate::models::{Candle, Side};

/// Half-open ratio band `(lower, upper]`
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Band {
    pub lower: Decimal,
    pub upper: Decimal,
}

impl Band {
    pub fn new(lower: Decimal, upper: Decimal) -> Self {
        Self { lower, upper }
    }

    pub fn contains(&self, value: Decimal) -> bool {
        value > self.lower && value <= self.upper
    }
}

/// Configuration for signal generation
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub rsi_length: usize,
    pub candle_history_depth: usize,
    /// Minimum |body| move in percent before any tier is considered
    pub min_body_pct: Decimal,
    /// Ratio band for same-direction (exhaustion) entries
    pub trend_band: Band,
    /// Ratio band for counter-direction (fade) entries
    pub counter_band: Band,
    pub oversold_rsi: Decimal,
    pub overbought_rsi: Decimal,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            rsi_length: 6,
            candle_history_depth: 50,
            min_body_pct: dec!(3),
            trend_band: Band::new(dec!(99), dec!(100)),
            counter_band: Band::new(dec!(80), dec!(90)),
            oversold_rsi: dec!(20),
            overbought_rsi: dec!(55),
        }
    }
}

/// Outcome of evaluating one candle update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    NoSignal,
    /// Entry in the direction of the move
    TrendEntry(Side),
    /// Entry against the move
    CounterEntry(Side),
    /// Close the open position on this symbol
    Exit,
}

impl Signal {
    pub fn entry_side(&self) -> Option<Side> {
        match self {
            Signal::TrendEntry(side) | Signal::CounterEntry(side) => Some(*side),
            Signal::NoSignal | Signal::Exit => None,
        }
    }
}

/// Percentage metrics of a single (possibly still open) candle
#[derive(Debug, Clone, PartialEq)]
pub struct TierMetrics {
    /// Body move in percent of open, 2 dp
    pub pct_change: Decimal,
    pub pct_from_high: Decimal,
    pub pct_from_low: Decimal,
    /// Share of the open→high range kept at close, up-moves only
    pub sell_ratio: Decimal,
    /// Share of the open→low range kept at close, down-moves only
    pub buy_ratio: Decimal,
}

impl TierMetrics {
    /// Compute metrics, `None` when a reference price is not positive
    pub fn from_candle(candle: &Candle) -> Option<Self> {
        let Candle {
            open,
            high,
            low,
            close,
            ..
        } = *candle;
        if open <= Decimal::ZERO || high <= Decimal::ZERO || low <= Decimal::ZERO {
            return None;
        }

        let hundred = Decimal::ONE_HUNDRED;
        let pct_change = ((close - open) / open * hundred).round_dp(2);
        let pct_from_high = ((high - close) / high * hundred).round_dp(2);
        let pct_from_low = ((close - low) / low * hundred).round_dp(2);

        let sell_ratio = if pct_change > Decimal::ZERO {
            range_ratio(close - open, high - open)
        } else {
            Decimal::ZERO
        };
        let buy_ratio = if pct_change < Decimal::ZERO {
            range_ratio(open - close, open - low)
        } else {
            Decimal::ZERO
        };

        Some(Self {
            pct_change,
            pct_from_high,
            pct_from_low,
            sell_ratio,
            buy_ratio,
        })
    }

    fn either_ratio_in(&self, band: &Band) -> bool {
        band.contains(self.sell_ratio) || band.contains(self.buy_ratio)
    }
}

fn range_ratio(part: Decimal, range: Decimal) -> Decimal {
    if range <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (part / range * Decimal::ONE_HUNDRED)
        .round()
        .clamp(Decimal::ZERO, Decimal::ONE_HUNDRED)
}

/// Everything the detector looks at for one kline update
#[derive(Debug, Clone, Copy)]
pub struct SignalInput<'a> {
    pub current: &'a Candle,
    pub pattern: Option<&'a PatternContext>,
    pub rsi: Option<Decimal>,
    pub position_open: bool,
}

/// Rule table mapping candle state to a [`Signal`]
///
/// Evaluation order, first match wins:
/// 1. exit on bucket close while a position is open
/// 2. trend tier
/// 3. counter tier
/// 4. three-candle pattern
#[derive(Debug, Clone, Default)]
pub struct SignalDetector {
    config: SignalConfig,
}

impl SignalDetector {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    pub fn evaluate(&self, input: &SignalInput<'_>) -> Signal {
        let exit = self.detect_exit(input.current, input.position_open);
        if exit != Signal::NoSignal {
            return exit;
        }

        let tier = TierMetrics::from_candle(input.current)
            .map(|metrics| self.detect_tier(&metrics))
            .unwrap_or(Signal::NoSignal);
        if tier != Signal::NoSignal {
            return tier;
        }

        match input.pattern {
            Some(ctx) => self.detect_pattern(ctx, input.rsi),
            None => Signal::NoSignal,
        }
    }

    /// Percentage-change tiers on the current candle
    pub fn detect_tier(&self, metrics: &TierMetrics) -> Signal {
        if metrics.pct_change.abs() < self.config.min_body_pct {
            return Signal::NoSignal;
        }

        let move_side = if metrics.pct_change > Decimal::ZERO {
            Side::Buy
        } else {
            Side::Sell
        };

        if metrics.either_ratio_in(&self.config.trend_band) {
            tracing::debug!(
                pct_change = %metrics.pct_change,
                sell_ratio = %metrics.sell_ratio,
                buy_ratio = %metrics.buy_ratio,
                "Trend tier matched"
            );
            return Signal::TrendEntry(move_side);
        }

        if metrics.either_ratio_in(&self.config.counter_band) {
            tracing::debug!(
                pct_change = %metrics.pct_change,
                sell_ratio = %metrics.sell_ratio,
                buy_ratio = %metrics.buy_ratio,
                "Counter tier matched"
            );
            return Signal::CounterEntry(move_side.opposite());
        }

        Signal::NoSignal
    }

    /// Three-candle colour pattern confirmed by RSI
    ///
    /// Three reds with RSI below the oversold level buy; green, green, red
    /// with RSI above the overbought level sells. No RSI, no signal.
    pub fn detect_pattern(&self, ctx: &PatternContext, rsi: Option<Decimal>) -> Signal {
        let Some(rsi) = rsi else {
            return Signal::NoSignal;
        };

        let all_red = ctx.oldest.is_red() && ctx.middle.is_red() && ctx.newest.is_red();
        if all_red && rsi < self.config.oversold_rsi {
            tracing::debug!(rsi = %rsi.round_dp(1), "Oversold three-red pattern");
            return Signal::CounterEntry(Side::Buy);
        }

        let rolled_over = ctx.oldest.is_green() && ctx.middle.is_green() && ctx.newest.is_red();
        if rolled_over && rsi > self.config.overbought_rsi {
            tracing::debug!(rsi = %rsi.round_dp(1), "Overbought roll-over pattern");
            return Signal::CounterEntry(Side::Sell);
        }

        Signal::NoSignal
    }

    /// Close on bucket close, whatever the PnL
    pub fn detect_exit(&self, current: &Candle, position_open: bool) -> Signal {
        if current.is_closed && position_open {
            Signal::Exit
        } else {
            Signal::NoSignal
        }
    }
}
