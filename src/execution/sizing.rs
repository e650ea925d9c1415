use rust_decimal::Decimal;

use crate::settings::SizingConfig;

/// Decides how much to buy or sell for a new entry
pub trait PositionSizer: Send {
    fn quantity(&self, symbol: &str, price: Decimal) -> Decimal;
}

/// Same leveraged notional for every entry
#[derive(Debug, Clone)]
pub struct FixedNotionalSizer {
    notional: Decimal,
}

impl FixedNotionalSizer {
    pub fn new(capital: Decimal, leverage: Decimal) -> Self {
        Self {
            notional: capital * leverage,
        }
    }

    pub fn from_config(config: &SizingConfig) -> Self {
        Self::new(config.capital, config.leverage)
    }
}

impl PositionSizer for FixedNotionalSizer {
    fn quantity(&self, _symbol: &str, price: Decimal) -> Decimal {
        if price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.notional / price).round_dp(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fixed_notional() {
        let sizer = FixedNotionalSizer::new(dec!(0.5), dec!(20));
        assert_eq!(sizer.quantity("SOLUSDT", dec!(100)), dec!(0.1));
        assert_eq!(sizer.quantity("SOLUSDT", dec!(3)), dec!(3.33333333));
    }

    #[test]
    fn test_zero_price_sizes_nothing() {
        let sizer = FixedNotionalSizer::from_config(&SizingConfig::default());
        assert_eq!(sizer.quantity("SOLUSDT", Decimal::ZERO), Decimal::ZERO);
    }
}
