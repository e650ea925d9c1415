// Risk management module
pub mod limits;

pub use limits::{PnlTrigger, RiskLimits, TradeOutcome};
