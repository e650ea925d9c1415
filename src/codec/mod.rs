// Wire decoding of exchange stream messages
pub mod binance;

pub use binance::decode;
