// Synthetic market data for paper trading
pub mod synthetic;

pub use synthetic::{mark_from_kline, MarketScenario, SyntheticKlineGenerator};
