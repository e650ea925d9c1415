// Trading signal module
pub mod signals;

pub use signals::{Band, Signal, SignalConfig, SignalDetector, SignalInput, TierMetrics};
