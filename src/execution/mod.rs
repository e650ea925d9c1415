// Order execution and per-symbol state
pub mod candle_window;
pub mod dispatcher;
pub mod gateway;
pub mod position_ledger;
pub mod sizing;

pub use candle_window::{CandleWindow, PatternContext, SymbolInfo};
pub use dispatcher::Dispatcher;
pub use gateway::{ExecutionGateway, GatewayError, PaperGateway};
pub use position_ledger::{
    AdmissionRejection, ClosedPosition, ExitReason, LifecycleState, Position, PositionLedger,
    TradingStats,
};
pub use sizing::{FixedNotionalSizer, PositionSizer};
