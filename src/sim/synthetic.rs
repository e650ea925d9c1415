use crate::models::{KlineUpdate, MarkPriceUpdate};
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

/// Market scenario types for synthetic data generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Steady climb with small noise
    Uptrend,
    /// Steady decline with small noise
    Downtrend,
    /// Mean-reverting chop around the start price
    Sideways,
    /// Large swings; regularly produces candles moving several percent
    Volatile,
}

impl MarketScenario {
    /// Per-tick drift and noise as fractions of price
    fn tick_shape(self) -> (f64, f64) {
        match self {
            MarketScenario::Uptrend => (0.0004, 0.002),
            MarketScenario::Downtrend => (-0.0004, 0.002),
            MarketScenario::Sideways => (0.0, 0.002),
            MarketScenario::Volatile => (0.0, 0.012),
        }
    }
}

/// Generates kline stream updates, several per candle
///
/// Each bucket starts at the previous close and walks through
/// `updates_per_candle` ticks; only the last update of a bucket is closed.
pub struct SyntheticKlineGenerator {
    rng: StdRng,
    base_price: f64,
    updates_per_candle: usize,
}

impl SyntheticKlineGenerator {
    /// Create a new generator with a seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            base_price: 150.0,
            updates_per_candle: 4,
        }
    }

    pub fn with_base_price(mut self, base_price: f64) -> Self {
        self.base_price = base_price;
        self
    }

    pub fn with_updates_per_candle(mut self, updates: usize) -> Self {
        self.updates_per_candle = updates.max(1);
        self
    }

    pub fn generate(
        &mut self,
        symbol: &str,
        scenario: MarketScenario,
        num_candles: usize,
        interval_minutes: i64,
        start_time: DateTime<Utc>,
    ) -> Vec<KlineUpdate> {
        let base = self.base_price;
        self.walk(symbol, scenario, num_candles, interval_minutes, start_time, base).0
    }

    /// Warm-up history followed by a live stream that picks up at its last close
    ///
    /// The warm-up buckets end right where `start_time` begins. Returns the
    /// warm-up closes (one per bucket) and the live updates.
    pub fn generate_session(
        &mut self,
        symbol: &str,
        scenario: MarketScenario,
        warmup_candles: usize,
        num_candles: usize,
        interval_minutes: i64,
        start_time: DateTime<Utc>,
    ) -> (Vec<Decimal>, Vec<KlineUpdate>) {
        let warmup_start = start_time - Duration::minutes(warmup_candles as i64 * interval_minutes);
        let base = self.base_price;
        let (warmup, last) =
            self.walk(symbol, scenario, warmup_candles, interval_minutes, warmup_start, base);
        let closes = warmup.iter().filter(|u| u.is_closed).map(|u| u.close).collect();

        let (live, _) = self.walk(symbol, scenario, num_candles, interval_minutes, start_time, last);
        (closes, live)
    }

    fn walk(
        &mut self,
        symbol: &str,
        scenario: MarketScenario,
        num_candles: usize,
        interval_minutes: i64,
        start_time: DateTime<Utc>,
        start_price: f64,
    ) -> (Vec<KlineUpdate>, f64) {
        let (drift, noise) = scenario.tick_shape();
        let mut updates = Vec::with_capacity(num_candles * self.updates_per_candle);
        let mut price = start_price;
        let tick = Duration::minutes(interval_minutes) / self.updates_per_candle as i32;

        for i in 0..num_candles {
            let open_time = start_time + Duration::minutes(i as i64 * interval_minutes);
            let open = price;
            let mut high = open;
            let mut low = open;

            for k in 0..self.updates_per_candle {
                let mut step = drift + self.rng.gen_range(-noise..noise);
                if scenario == MarketScenario::Sideways {
                    // pull back toward the base price
                    step += (self.base_price - price) / self.base_price * 0.05;
                }
                price = (price * (1.0 + step)).max(0.0001);
                high = high.max(price);
                low = low.min(price);

                updates.push(KlineUpdate {
                    symbol: symbol.to_string(),
                    open: to_decimal(open),
                    high: to_decimal(high),
                    low: to_decimal(low),
                    close: to_decimal(price),
                    is_closed: k + 1 == self.updates_per_candle,
                    open_time,
                    event_time: open_time + tick * (k as i32 + 1),
                });
            }
        }

        (updates, price)
    }
}

/// Mark-price snapshot matching a kline update's close
pub fn mark_from_kline(update: &KlineUpdate) -> MarkPriceUpdate {
    MarkPriceUpdate {
        symbol: update.symbol.clone(),
        mark_price: update.close,
        event_time: update.event_time,
    }
}

fn to_decimal(price: f64) -> Decimal {
    Decimal::from_f64_retain(price)
        .unwrap_or_default()
        .round_dp(4)
}
