use thiserror::Error;

use crate::execution::gateway::GatewayError;

/// Invalid or unreadable configuration; fatal at startup
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to load config: {0}")]
    Load(#[from] config::ConfigError),
}

/// Failure while handling a single event
///
/// Everything except [`EngineError::Config`] is recoverable: the consumer
/// logs it and moves on to the next event.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("invalid {kind} event: {reason}")]
    Validation { kind: &'static str, reason: String },

    #[error("state inconsistency for {symbol}: {reason}")]
    StateInconsistency { symbol: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("event queue closed")]
    QueueClosed,
}

impl EngineError {
    pub fn validation(kind: &'static str, reason: impl Into<String>) -> Self {
        EngineError::Validation {
            kind,
            reason: reason.into(),
        }
    }

    pub fn inconsistency(symbol: &str, reason: impl Into<String>) -> Self {
        EngineError::StateInconsistency {
            symbol: symbol.to_string(),
            reason: reason.into(),
        }
    }
}
