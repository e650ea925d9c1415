//! Engine configuration: defaults, optional TOML file, `KLINEBOT__*` env.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;

use crate::error::ConfigError;
use crate::models::EntryOrderType;
use crate::risk::RiskLimits;
use crate::strategy::SignalConfig;

/// Upper bound for second-based intervals, keeps timestamp math in range
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

/// Entry sizing and protective order pricing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// Margin committed per position, in quote currency
    pub capital: Decimal,
    pub leverage: Decimal,
    /// Profit the take-profit order aims for, in quote currency
    pub expected_profit_usd: Decimal,
    pub entry_order_type: EntryOrderType,
    /// Fractional offset applied to the close when pricing an entry
    pub entry_offset_pct: Decimal,
    /// Fractional gap between a take-profit's stop and limit price
    pub tp_limit_offset_pct: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            capital: dec!(0.5),
            leverage: dec!(20),
            expected_profit_usd: dec!(0.15),
            entry_order_type: EntryOrderType::Limit,
            entry_offset_pct: dec!(0.0005),
            tp_limit_offset_pct: dec!(0.002),
        }
    }
}

impl SizingConfig {
    /// Leveraged notional of one position
    pub fn notional(&self) -> Decimal {
        self.capital * self.leverage
    }

    /// Price move that yields `expected_profit_usd` on the notional
    pub fn target_pct(&self) -> Decimal {
        self.expected_profit_usd / self.notional()
    }
}

/// Queue and worker sizing for the event loop
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub queue_capacity: usize,
    pub dispatcher_workers: usize,
    /// Commands buffered per worker lane
    pub dispatcher_capacity: usize,
    pub gateway_rate_per_sec: u32,
    pub liveness_log_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 5000,
            dispatcher_workers: 4,
            dispatcher_capacity: 256,
            gateway_rate_per_sec: 10,
            liveness_log_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub risk: RiskLimits,
    pub signal: SignalConfig,
    pub sizing: SizingConfig,
    pub runtime: RuntimeConfig,
}

impl EngineConfig {
    /// Load configuration and validate it
    ///
    /// Sources, later wins: built-in defaults, `path` (if given), then
    /// environment variables such as `KLINEBOT__RISK__MAX_OPEN_POSITIONS`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("KLINEBOT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject risk parameters the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let risk = &self.risk;
        if risk.max_open_positions == 0 {
            return Err(invalid("risk.max_open_positions", "must be at least 1"));
        }
        if risk.take_profit_usd <= Decimal::ZERO {
            return Err(invalid("risk.take_profit_usd", "must be positive"));
        }
        if risk.stop_loss_usd >= Decimal::ZERO {
            return Err(invalid("risk.stop_loss_usd", "must be negative"));
        }
        if risk.reentry_cooldown_secs > MAX_INTERVAL_SECS {
            return Err(invalid("risk.reentry_cooldown_secs", "must be at most one year"));
        }
        if risk.trailing_activation_usd.is_some()
            && risk.trailing_giveback_usd <= Decimal::ZERO
        {
            return Err(invalid("risk.trailing_giveback_usd", "must be positive"));
        }

        let sizing = &self.sizing;
        if sizing.capital <= Decimal::ZERO {
            return Err(invalid("sizing.capital", "must be positive"));
        }
        if sizing.leverage <= Decimal::ZERO {
            return Err(invalid("sizing.leverage", "must be positive"));
        }
        if sizing.expected_profit_usd <= Decimal::ZERO {
            return Err(invalid("sizing.expected_profit_usd", "must be positive"));
        }
        if sizing.entry_offset_pct < Decimal::ZERO || sizing.entry_offset_pct >= Decimal::ONE {
            return Err(invalid("sizing.entry_offset_pct", "must be in [0, 1)"));
        }
        if sizing.tp_limit_offset_pct < Decimal::ZERO || sizing.tp_limit_offset_pct >= Decimal::ONE
        {
            return Err(invalid("sizing.tp_limit_offset_pct", "must be in [0, 1)"));
        }

        let signal = &self.signal;
        if signal.rsi_length == 0 {
            return Err(invalid("signal.rsi_length", "must be at least 1"));
        }
        if signal.candle_history_depth < signal.rsi_length + 1 {
            return Err(invalid(
                "signal.candle_history_depth",
                format!("must hold at least rsi_length + 1 = {}", signal.rsi_length + 1),
            ));
        }
        if signal.min_body_pct <= Decimal::ZERO {
            return Err(invalid("signal.min_body_pct", "must be positive"));
        }
        for (field, band) in [
            ("signal.trend_band", &signal.trend_band),
            ("signal.counter_band", &signal.counter_band),
        ] {
            if band.lower >= band.upper || band.lower < Decimal::ZERO {
                return Err(invalid(field, "needs 0 <= lower < upper"));
            }
        }

        let runtime = &self.runtime;
        if runtime.queue_capacity == 0 {
            return Err(invalid("runtime.queue_capacity", "must be at least 1"));
        }
        if runtime.dispatcher_workers == 0 || runtime.dispatcher_capacity == 0 {
            return Err(invalid("runtime.dispatcher_workers", "workers and lanes must be non-empty"));
        }
        if runtime.gateway_rate_per_sec == 0 {
            return Err(invalid("runtime.gateway_rate_per_sec", "must be at least 1"));
        }
        if runtime.liveness_log_secs == 0 || runtime.liveness_log_secs > MAX_INTERVAL_SECS {
            return Err(invalid("runtime.liveness_log_secs", "must be between 1 s and one year"));
        }

        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}
