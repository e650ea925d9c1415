use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::engine::{EngineEvent, EventSender};
use crate::models::{
    EntryOrderType, ExecutionCommand, MarketEvent, OrderStatus, OrderType, OrderUpdate,
    ProtectiveKind, Side,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Timeouts, throttling, full queues; the single action is dropped
    #[error("transient gateway failure: {0}")]
    Transient(String),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("no position held for {symbol}")]
    NoPosition { symbol: String },

    #[error("gateway closed")]
    Closed,
}

/// Exchange-facing side of the engine
///
/// `execute` only acknowledges submission. Fills, cancels and rejections
/// come back later as order updates through the event queue.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn execute(&self, command: &ExecutionCommand) -> Result<(), GatewayError>;

    /// Gateway name for logging
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
struct RestingOrder {
    order_id: u64,
    kind: ProtectiveKind,
    side: Side,
    stop_price: Decimal,
    limit_price: Decimal,
    qty: Decimal,
}

impl RestingOrder {
    fn order_type(&self) -> OrderType {
        match self.kind {
            ProtectiveKind::TakeProfit => OrderType::TakeProfit,
            ProtectiveKind::StopLoss => OrderType::Stop,
        }
    }

    fn triggers_at(&self, price: Decimal) -> bool {
        match (self.kind, self.side) {
            (ProtectiveKind::TakeProfit, Side::Sell) | (ProtectiveKind::StopLoss, Side::Buy) => {
                price >= self.stop_price
            }
            (ProtectiveKind::TakeProfit, Side::Buy) | (ProtectiveKind::StopLoss, Side::Sell) => {
                price <= self.stop_price
            }
        }
    }
}

#[derive(Debug, Default)]
struct PaperBook {
    /// Signed position amount per symbol
    positions: HashMap<String, Decimal>,
    last_prices: HashMap<String, Decimal>,
    clocks: HashMap<String, DateTime<Utc>>,
    resting: HashMap<String, Vec<RestingOrder>>,
}

impl PaperBook {
    fn now(&self, symbol: &str) -> DateTime<Utc> {
        self.clocks.get(symbol).copied().unwrap_or_else(Utc::now)
    }
}

/// Simulated exchange for replay and paper trading
///
/// Entries fill immediately at their requested price, closes fill at the
/// last observed price and protective orders rest until their stop price
/// is crossed or they are cancelled. Every state change is reported back
/// through the event queue as an order update.
pub struct PaperGateway {
    events: EventSender,
    next_order_id: AtomicU64,
    book: Mutex<PaperBook>,
}

impl PaperGateway {
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            next_order_id: AtomicU64::new(1),
            book: Mutex::new(PaperBook::default()),
        }
    }

    fn book(&self) -> Result<MutexGuard<'_, PaperBook>, GatewayError> {
        self.book
            .lock()
            .map_err(|_| GatewayError::Transient("paper book lock poisoned".to_string()))
    }

    fn order_id(&self) -> u64 {
        self.next_order_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Signed amount the simulated account holds
    pub fn position_amount(&self, symbol: &str) -> Decimal {
        self.book()
            .ok()
            .and_then(|book| book.positions.get(symbol).copied())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn resting_orders(&self, symbol: &str) -> usize {
        self.book()
            .map(|book| book.resting.get(symbol).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Feed a traded price; fills any resting protective order it crosses
    pub async fn observe_price(
        &self,
        symbol: &str,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let reports = {
            let mut book = self.book()?;
            book.last_prices.insert(symbol.to_string(), price);
            book.clocks.insert(symbol.to_string(), at);

            let held = book.positions.get(symbol).copied().unwrap_or(Decimal::ZERO);
            if held.is_zero() {
                Vec::new()
            } else {
                let triggered = book.resting.get_mut(symbol).and_then(|orders| {
                    orders
                        .iter()
                        .position(|order| order.triggers_at(price))
                        .map(|index| orders.remove(index))
                });

                match triggered {
                    Some(order) => {
                        let qty = order.qty.min(held.abs());
                        let remaining = held + order.side.sign() * qty;
                        if remaining.is_zero() {
                            book.positions.remove(symbol);
                        } else {
                            book.positions.insert(symbol.to_string(), remaining);
                        }
                        tracing::info!(
                            symbol,
                            order_id = order.order_id,
                            kind = ?order.kind,
                            price = %order.limit_price,
                            "Paper protective order filled"
                        );
                        vec![report(
                            symbol,
                            order.order_id,
                            OrderStatus::Filled,
                            order.side,
                            qty,
                            order.limit_price,
                            true,
                            order.order_type(),
                            at,
                        )]
                    }
                    None => Vec::new(),
                }
            }
        };

        self.publish(reports).await
    }

    async fn publish(&self, reports: Vec<OrderUpdate>) -> Result<(), GatewayError> {
        for update in reports {
            self.events
                .publish(EngineEvent::Market(MarketEvent::Order(update)))
                .await
                .map_err(|_| GatewayError::Closed)?;
        }
        Ok(())
    }

    fn submit_entry(
        &self,
        symbol: &str,
        side: Side,
        price: Decimal,
        qty: Decimal,
        order_type: EntryOrderType,
    ) -> Result<Vec<OrderUpdate>, GatewayError> {
        if qty <= Decimal::ZERO || price <= Decimal::ZERO {
            return Err(GatewayError::Rejected(format!(
                "{} {} {} @ {}",
                symbol, side, qty, price
            )));
        }

        let order_id = self.order_id();
        let mut book = self.book()?;
        let fill_price = match order_type {
            EntryOrderType::Limit => price,
            EntryOrderType::Market => book.last_prices.get(symbol).copied().unwrap_or(price),
        };
        let wire_type = match order_type {
            EntryOrderType::Limit => OrderType::Limit,
            EntryOrderType::Market => OrderType::Market,
        };

        let held = book.positions.entry(symbol.to_string()).or_default();
        *held += side.sign() * qty;
        let now = book.now(symbol);

        let accepted = report(
            symbol,
            order_id,
            OrderStatus::New,
            side,
            Decimal::ZERO,
            Decimal::ZERO,
            false,
            wire_type.clone(),
            now,
        );
        let filled = report(
            symbol,
            order_id,
            OrderStatus::Filled,
            side,
            qty,
            fill_price,
            false,
            wire_type,
            now,
        );
        Ok(vec![accepted, filled])
    }

    fn submit_protective(
        &self,
        symbol: &str,
        kind: ProtectiveKind,
        side: Side,
        stop_price: Decimal,
        limit_price: Decimal,
        qty: Decimal,
    ) -> Result<Vec<OrderUpdate>, GatewayError> {
        let mut book = self.book()?;
        if book.positions.get(symbol).map_or(true, |held| held.is_zero()) {
            return Err(GatewayError::Rejected(format!(
                "reduce-only {:?} for {} without a position",
                kind, symbol
            )));
        }

        let order = RestingOrder {
            order_id: self.order_id(),
            kind,
            side,
            stop_price,
            limit_price,
            qty,
        };
        let now = book.now(symbol);
        let update = report(
            symbol,
            order.order_id,
            OrderStatus::New,
            side,
            Decimal::ZERO,
            Decimal::ZERO,
            true,
            order.order_type(),
            now,
        );
        book.resting.entry(symbol.to_string()).or_default().push(order);
        Ok(vec![update])
    }

    fn cancel_all(&self, symbol: &str) -> Result<Vec<OrderUpdate>, GatewayError> {
        let mut book = self.book()?;
        let now = book.now(symbol);
        let cancelled = book.resting.remove(symbol).unwrap_or_default();

        Ok(cancelled
            .into_iter()
            .map(|order| {
                report(
                    symbol,
                    order.order_id,
                    OrderStatus::Canceled,
                    order.side,
                    Decimal::ZERO,
                    Decimal::ZERO,
                    true,
                    order.order_type(),
                    now,
                )
            })
            .collect())
    }

    fn close_position(&self, symbol: &str) -> Result<Vec<OrderUpdate>, GatewayError> {
        let mut book = self.book()?;
        let held = match book.positions.get(symbol) {
            Some(held) if !held.is_zero() => *held,
            _ => {
                return Err(GatewayError::NoPosition {
                    symbol: symbol.to_string(),
                })
            }
        };
        let price = book
            .last_prices
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::Transient(format!("no price seen for {}", symbol)))?;

        book.positions.remove(symbol);
        let side = if held > Decimal::ZERO { Side::Sell } else { Side::Buy };
        let now = book.now(symbol);

        Ok(vec![report(
            symbol,
            self.order_id(),
            OrderStatus::Filled,
            side,
            held.abs(),
            price,
            true,
            OrderType::Market,
            now,
        )])
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    async fn execute(&self, command: &ExecutionCommand) -> Result<(), GatewayError> {
        let reports = match command {
            ExecutionCommand::SubmitEntry {
                symbol,
                side,
                price,
                qty,
                order_type,
            } => self.submit_entry(symbol, *side, *price, *qty, *order_type)?,
            ExecutionCommand::SubmitProtective {
                symbol,
                kind,
                side,
                stop_price,
                limit_price,
                qty,
            } => self.submit_protective(symbol, *kind, *side, *stop_price, *limit_price, *qty)?,
            ExecutionCommand::CancelAll { symbol } => self.cancel_all(symbol)?,
            ExecutionCommand::ClosePosition { symbol } => self.close_position(symbol)?,
        };

        self.publish(reports).await
    }

    fn name(&self) -> &'static str {
        "paper"
    }
}

#[allow(clippy::too_many_arguments)]
fn report(
    symbol: &str,
    order_id: u64,
    status: OrderStatus,
    side: Side,
    filled_qty: Decimal,
    avg_price: Decimal,
    reduce_only: bool,
    order_type: OrderType,
    event_time: DateTime<Utc>,
) -> OrderUpdate {
    OrderUpdate {
        symbol: symbol.to_string(),
        order_id,
        status,
        side,
        filled_qty,
        avg_price,
        reduce_only,
        order_type,
        event_time,
    }
}
