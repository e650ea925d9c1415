// Technical indicators module
// Wilder RSI over a capped close history

pub mod rsi;

pub use rsi::{calculate_rsi, RsiState};
