// Core modules
pub mod codec;
pub mod engine;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod risk;
pub mod settings;
pub mod sim;
pub mod strategy;

// Re-export commonly used types
pub use engine::{DecisionEngine, EngineEvent};
pub use error::{ConfigError, EngineError};
pub use models::*;
pub use settings::EngineConfig;
