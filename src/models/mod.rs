use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// OHLC summary for one time bucket of an instrument
///
/// A candle is superseded by the next update for the same bucket; the last
/// update of a bucket arrives with `is_closed == true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub is_closed: bool,
    pub open_time: DateTime<Utc>,
}

impl Candle {
    /// Close below open
    pub fn is_red(&self) -> bool {
        self.close < self.open
    }

    /// Close above open
    pub fn is_green(&self) -> bool {
        self.close > self.open
    }
}

/// Order side as the exchange understands it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buys, -1 for sells
    pub fn sign(self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Direction of an open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Side of the order that opens this position
    pub fn entry_side(self) -> Side {
        match self {
            PositionSide::Long => Side::Buy,
            PositionSide::Short => Side::Sell,
        }
    }

    /// Side of the order that reduces this position
    pub fn closing_side(self) -> Side {
        self.entry_side().opposite()
    }
}

impl From<Side> for PositionSide {
    fn from(side: Side) -> Self {
        match side {
            Side::Buy => PositionSide::Long,
            Side::Sell => PositionSide::Short,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// The order will never fill any further
    pub fn is_terminal_without_fill(self) -> bool {
        matches!(
            self,
            OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    TakeProfit,
    TakeProfitMarket,
    Stop,
    StopMarket,
    #[serde(other)]
    Other,
}

impl OrderType {
    /// Which protective slot an order of this type occupies, if any
    pub fn protective_kind(&self) -> Option<ProtectiveKind> {
        match self {
            OrderType::TakeProfit | OrderType::TakeProfitMarket => Some(ProtectiveKind::TakeProfit),
            OrderType::Stop | OrderType::StopMarket => Some(ProtectiveKind::StopLoss),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtectiveKind {
    TakeProfit,
    StopLoss,
}

/// Order type used for entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryOrderType {
    Market,
    Limit,
}

/// Candle update pushed by a kline stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlineUpdate {
    pub symbol: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub is_closed: bool,
    pub open_time: DateTime<Utc>,
    pub event_time: DateTime<Utc>,
}

impl KlineUpdate {
    pub fn candle(&self) -> Candle {
        Candle {
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            is_closed: self.is_closed,
            open_time: self.open_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkPriceUpdate {
    pub symbol: String,
    pub mark_price: Decimal,
    pub event_time: DateTime<Utc>,
}

/// Order lifecycle report from the user-data stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub symbol: String,
    pub order_id: u64,
    pub status: OrderStatus,
    pub side: Side,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub reduce_only: bool,
    pub order_type: OrderType,
    pub event_time: DateTime<Utc>,
}

/// Typed event produced by the exchange-connectivity layer
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Kline(KlineUpdate),
    /// One `!markPrice@arr` snapshot covering many symbols
    MarkPrice(Vec<MarkPriceUpdate>),
    Order(OrderUpdate),
}

impl MarketEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            MarketEvent::Kline(_) => "kline",
            MarketEvent::MarkPrice(_) => "mark_price",
            MarketEvent::Order(_) => "order",
        }
    }
}

/// Instruction sent to the execution collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionCommand {
    SubmitEntry {
        symbol: String,
        side: Side,
        price: Decimal,
        qty: Decimal,
        order_type: EntryOrderType,
    },
    SubmitProtective {
        symbol: String,
        kind: ProtectiveKind,
        side: Side,
        stop_price: Decimal,
        limit_price: Decimal,
        qty: Decimal,
    },
    CancelAll {
        symbol: String,
    },
    ClosePosition {
        symbol: String,
    },
}

impl ExecutionCommand {
    pub fn symbol(&self) -> &str {
        match self {
            ExecutionCommand::SubmitEntry { symbol, .. }
            | ExecutionCommand::SubmitProtective { symbol, .. }
            | ExecutionCommand::CancelAll { symbol }
            | ExecutionCommand::ClosePosition { symbol } => symbol,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExecutionCommand::SubmitEntry { .. } => "submit_entry",
            ExecutionCommand::SubmitProtective { .. } => "submit_protective",
            ExecutionCommand::CancelAll { .. } => "cancel_all",
            ExecutionCommand::ClosePosition { .. } => "close_position",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(open: Decimal, close: Decimal) -> Candle {
        Candle {
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            is_closed: true,
            open_time: Utc::now(),
        }
    }

    #[test]
    fn test_candle_colour() {
        assert!(candle(dec!(10), dec!(9)).is_red());
        assert!(candle(dec!(10), dec!(11)).is_green());

        let doji = candle(dec!(10), dec!(10));
        assert!(!doji.is_red());
        assert!(!doji.is_green());
    }

    #[test]
    fn test_position_side_mapping() {
        assert_eq!(PositionSide::from(Side::Buy), PositionSide::Long);
        assert_eq!(PositionSide::Long.closing_side(), Side::Sell);
        assert_eq!(PositionSide::Short.closing_side(), Side::Buy);
        assert_eq!(Side::Sell.sign(), dec!(-1));
    }

    #[test]
    fn test_protective_kind_from_order_type() {
        assert_eq!(
            OrderType::TakeProfitMarket.protective_kind(),
            Some(ProtectiveKind::TakeProfit)
        );
        assert_eq!(OrderType::Stop.protective_kind(), Some(ProtectiveKind::StopLoss));
        assert_eq!(OrderType::Limit.protective_kind(), None);
    }
}
