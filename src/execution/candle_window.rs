use crate::indicators::calculate_rsi;
use crate::models::Candle;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};

/// Number of candles the pattern rule looks at
pub const PATTERN_DEPTH: usize = 3;

/// The three most recent candles of a symbol, oldest first
#[derive(Debug, Clone, PartialEq)]
pub struct PatternContext {
    pub oldest: Candle,
    pub middle: Candle,
    pub newest: Candle,
}

/// Counters reported by [`CandleWindow::symbol_info`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SymbolInfo {
    pub candle_count: usize,
    pub total_count: u64,
}

#[derive(Debug, Default)]
struct SymbolWindow {
    candles: VecDeque<Candle>,
    closes: VecDeque<Decimal>,
    updates: u64,
}

/// Per-symbol rolling candle state
///
/// Keeps the last [`PATTERN_DEPTH`] candles for pattern detection and a
/// capped close-price history for RSI. An update for the bucket already at
/// the back of the window replaces it instead of being appended, so both
/// buffers hold one entry per time bucket.
///
/// Owned by the single event consumer, so no interior locking.
pub struct CandleWindow {
    data: HashMap<String, SymbolWindow>,
    history_depth: usize,
    rsi_length: usize,
}

impl CandleWindow {
    /// Create a new candle window store
    ///
    /// # Arguments
    /// * `history_depth` - Maximum number of closes kept per symbol
    /// * `rsi_length` - RSI period used by [`CandleWindow::rsi`]
    pub fn new(history_depth: usize, rsi_length: usize) -> Self {
        Self {
            data: HashMap::new(),
            history_depth,
            rsi_length,
        }
    }

    /// Record a candle update and return the pattern context once ready
    ///
    /// Returns `None` until three distinct buckets have been seen.
    pub fn ingest(&mut self, symbol: &str, candle: Candle) -> Option<PatternContext> {
        let history_depth = self.history_depth;
        let window = self.data.entry(symbol.to_string()).or_default();
        window.updates += 1;

        let same_bucket = window
            .candles
            .back()
            .is_some_and(|last| last.open_time == candle.open_time);

        if same_bucket {
            if let Some(last_close) = window.closes.back_mut() {
                *last_close = candle.close;
            } else {
                window.closes.push_back(candle.close);
            }
            if let Some(last) = window.candles.back_mut() {
                *last = candle;
            }
        } else {
            window.closes.push_back(candle.close);
            while window.closes.len() > history_depth {
                window.closes.pop_front();
            }

            window.candles.push_back(candle);
            while window.candles.len() > PATTERN_DEPTH {
                window.candles.pop_front();
            }
        }

        if window.candles.len() < PATTERN_DEPTH {
            return None;
        }

        Some(PatternContext {
            oldest: window.candles[0].clone(),
            middle: window.candles[1].clone(),
            newest: window.candles[2].clone(),
        })
    }

    /// Current RSI for a symbol, `None` until `rsi_length + 1` closes exist
    pub fn rsi(&self, symbol: &str) -> Option<Decimal> {
        let window = self.data.get(symbol)?;
        let closes: Vec<Decimal> = window.closes.iter().copied().collect();
        calculate_rsi(&closes, self.rsi_length)
    }

    /// Replace a symbol's close history, keeping only the newest entries
    ///
    /// Used at startup to warm RSI from historical klines. The pattern
    /// buffer is left untouched.
    pub fn seed_history(&mut self, symbol: &str, closes: &[Decimal]) {
        let skip = closes.len().saturating_sub(self.history_depth);
        let window = self.data.entry(symbol.to_string()).or_default();
        window.closes = closes[skip..].iter().copied().collect();
    }

    /// Close history for a symbol, oldest first
    pub fn close_history(&self, symbol: &str) -> Vec<Decimal> {
        self.data
            .get(symbol)
            .map(|w| w.closes.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn symbol_info(&self, symbol: &str) -> SymbolInfo {
        self.data
            .get(symbol)
            .map(|w| SymbolInfo {
                candle_count: w.candles.len(),
                total_count: w.updates,
            })
            .unwrap_or_default()
    }

    /// Get all tracked symbols
    pub fn symbols(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }
}
