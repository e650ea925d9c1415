use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{PositionSide, ProtectiveKind, Side};
use crate::risk::{PnlTrigger, RiskLimits, TradeOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    TrailingStop,
    CandleClose,
    /// A resting protective order filled on the exchange
    ProtectiveFill,
    /// The exchange reported no position left
    ExchangeFlat,
}

impl From<PnlTrigger> for ExitReason {
    fn from(trigger: PnlTrigger) -> Self {
        match trigger {
            PnlTrigger::TakeProfit => ExitReason::TakeProfit,
            PnlTrigger::StopLoss => ExitReason::StopLoss,
            PnlTrigger::TrailingStop => ExitReason::TrailingStop,
        }
    }
}

/// Lifecycle of a symbol: Flat → PendingEntry → Open → PendingExit → Flat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Flat,
    PendingEntry,
    Open,
    PendingExit,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtectiveOrders {
    pub take_profit: Option<u64>,
    pub stop_loss: Option<u64>,
}

impl ProtectiveOrders {
    fn slot_mut(&mut self, kind: ProtectiveKind) -> &mut Option<u64> {
        match kind {
            ProtectiveKind::TakeProfit => &mut self.take_profit,
            ProtectiveKind::StopLoss => &mut self.stop_loss,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrailingState {
    pub active: bool,
    pub peak_pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub side: PositionSide,
    /// Absolute size
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub opened_at: DateTime<Utc>,
    pub protective_orders: ProtectiveOrders,
    pub trailing: TrailingState,
}

impl Position {
    /// Quantity signed by direction, negative for shorts
    pub fn signed_qty(&self) -> Decimal {
        self.side.entry_side().sign() * self.quantity
    }

    /// Unrealized PnL at `price`, rounded to cents
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        ((price - self.entry_price) * self.signed_qty()).round_dp(2)
    }
}

/// Entry order submitted but not yet filled or rejected
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub symbol: String,
    pub side: Side,
    pub requested_price: Decimal,
    pub requested_qty: Decimal,
    pub submitted_at: DateTime<Utc>,
    pub order_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingExit {
    pub position: Position,
    pub reason: ExitReason,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
enum SymbolState {
    PendingEntry(PendingEntry),
    Open(Position),
    PendingExit(PendingExit),
}

/// Why `try_reserve` refused a symbol
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdmissionRejection {
    #[error("entry already pending")]
    EntryPending,

    #[error("exit in flight")]
    ExitPending,

    #[error("position already open")]
    AlreadyOpen,

    #[error("order would add to the open {0:?} position")]
    SameDirection(PositionSide),

    #[error("cooling down until {0}")]
    CoolingDown(DateTime<Utc>),

    #[error("capacity reached: {active} >= {limit}")]
    CapacityReached { active: usize, limit: usize },
}

/// Unrealized PnL crossed a configured threshold
#[derive(Debug, Clone, PartialEq)]
pub struct ForcedClose {
    pub symbol: String,
    pub trigger: PnlTrigger,
    pub pnl: Decimal,
    pub mark_price: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPosition {
    pub position: Position,
    pub reason: ExitReason,
    pub exit_price: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradingStats {
    pub realized_pnl: Decimal,
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
}

/// Authoritative record of reservations, positions and pending exits
///
/// Every non-flat symbol counts against `max_open_positions`, so the cap
/// also bounds the number of open positions.
pub struct PositionLedger {
    records: HashMap<String, SymbolState>,
    cooldowns: HashMap<String, DateTime<Utc>>,
    limits: RiskLimits,
    stats: TradingStats,
}

impl PositionLedger {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            records: HashMap::new(),
            cooldowns: HashMap::new(),
            limits,
            stats: TradingStats::default(),
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn stats(&self) -> &TradingStats {
        &self.stats
    }

    pub fn state(&self, symbol: &str) -> LifecycleState {
        match self.records.get(symbol) {
            None => LifecycleState::Flat,
            Some(SymbolState::PendingEntry(_)) => LifecycleState::PendingEntry,
            Some(SymbolState::Open(_)) => LifecycleState::Open,
            Some(SymbolState::PendingExit(_)) => LifecycleState::PendingExit,
        }
    }

    /// Open or exiting position for a symbol
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        match self.records.get(symbol)? {
            SymbolState::Open(position) => Some(position),
            SymbolState::PendingExit(exit) => Some(&exit.position),
            SymbolState::PendingEntry(_) => None,
        }
    }

    pub fn pending_entry(&self, symbol: &str) -> Option<&PendingEntry> {
        match self.records.get(symbol)? {
            SymbolState::PendingEntry(pending) => Some(pending),
            _ => None,
        }
    }

    pub fn pending_exit(&self, symbol: &str) -> Option<&PendingExit> {
        match self.records.get(symbol)? {
            SymbolState::PendingExit(exit) => Some(exit),
            _ => None,
        }
    }

    pub fn has_open_position(&self, symbol: &str) -> bool {
        self.state(symbol) == LifecycleState::Open
    }

    /// Symbols in the `Open` state
    pub fn open_symbols(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|(_, state)| matches!(state, SymbolState::Open(_)))
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    /// Positions that exist on the exchange (open or exiting)
    pub fn open_positions(&self) -> Vec<&Position> {
        self.records
            .keys()
            .filter_map(|symbol| self.position(symbol))
            .collect()
    }

    /// Number of non-flat symbols
    pub fn active_count(&self) -> usize {
        self.records.len()
    }

    /// Admission control for a new entry
    pub fn check_admission(
        &self,
        symbol: &str,
        side: Side,
        now: DateTime<Utc>,
    ) -> Result<(), AdmissionRejection> {
        match self.records.get(symbol) {
            Some(SymbolState::PendingEntry(_)) => return Err(AdmissionRejection::EntryPending),
            Some(SymbolState::PendingExit(_)) => return Err(AdmissionRejection::ExitPending),
            Some(SymbolState::Open(position)) => {
                // only an order that flips the sign of the position is a new entry
                if position.side.entry_side() == side {
                    return Err(AdmissionRejection::SameDirection(position.side));
                }
                return Err(AdmissionRejection::AlreadyOpen);
            }
            None => {}
        }

        if let Some(until) = self.cooldowns.get(symbol) {
            if now < *until {
                return Err(AdmissionRejection::CoolingDown(*until));
            }
        }

        let active = self.active_count();
        if active >= self.limits.max_open_positions {
            return Err(AdmissionRejection::CapacityReached {
                active,
                limit: self.limits.max_open_positions,
            });
        }

        Ok(())
    }

    /// Reserve a symbol for an entry: Flat → PendingEntry
    ///
    /// Returns false when admission control refuses the entry.
    pub fn try_reserve(
        &mut self,
        symbol: &str,
        side: Side,
        price: Decimal,
        qty: Decimal,
        now: DateTime<Utc>,
    ) -> bool {
        if let Err(rejection) = self.check_admission(symbol, side, now) {
            tracing::debug!(symbol, %side, %rejection, "Entry not admitted");
            return false;
        }

        self.cooldowns.remove(symbol);
        self.records.insert(
            symbol.to_string(),
            SymbolState::PendingEntry(PendingEntry {
                symbol: symbol.to_string(),
                side,
                requested_price: price,
                requested_qty: qty,
                submitted_at: now,
                order_id: None,
            }),
        );
        true
    }

    /// Remember the exchange id of a pending entry order
    pub fn record_entry_order(&mut self, symbol: &str, order_id: u64) -> bool {
        match self.records.get_mut(symbol) {
            Some(SymbolState::PendingEntry(pending)) => {
                pending.order_id = Some(order_id);
                true
            }
            _ => false,
        }
    }

    /// Drop a reservation after rejection or cancel: PendingEntry → Flat
    pub fn release_reservation(&mut self, symbol: &str) -> Option<PendingEntry> {
        match self.records.remove(symbol) {
            Some(SymbolState::PendingEntry(pending)) => Some(pending),
            Some(other) => {
                self.records.insert(symbol.to_string(), other);
                None
            }
            None => None,
        }
    }

    /// Entry fill confirmed: PendingEntry → Open
    pub fn open_position(
        &mut self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<&Position, EngineError> {
        if qty <= Decimal::ZERO || price <= Decimal::ZERO {
            return Err(EngineError::validation(
                "order",
                format!("fill for {} with qty {} at {}", symbol, qty, price),
            ));
        }

        match self.records.get(symbol) {
            Some(SymbolState::PendingEntry(pending)) if pending.side == side => {}
            Some(SymbolState::PendingEntry(pending)) => {
                return Err(EngineError::inconsistency(
                    symbol,
                    format!("{} fill while a {} entry is pending", side, pending.side),
                ));
            }
            Some(_) => {
                return Err(EngineError::inconsistency(
                    symbol,
                    "entry fill for a symbol that already holds a position",
                ));
            }
            None => {
                return Err(EngineError::inconsistency(
                    symbol,
                    "entry fill without a reservation",
                ));
            }
        }

        let position = Position {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side: PositionSide::from(side),
            quantity: qty,
            entry_price: price,
            opened_at: now,
            protective_orders: ProtectiveOrders::default(),
            trailing: TrailingState::default(),
        };
        self.records
            .insert(symbol.to_string(), SymbolState::Open(position));

        match self.records.get(symbol) {
            Some(SymbolState::Open(position)) => Ok(position),
            _ => Err(EngineError::inconsistency(symbol, "position vanished after insert")),
        }
    }

    /// Load a position the exchange already holds at startup
    pub fn restore_position(
        &mut self,
        symbol: &str,
        signed_amount: Decimal,
        entry_price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if signed_amount.is_zero() {
            return Ok(());
        }
        if self.records.contains_key(symbol) {
            return Err(EngineError::inconsistency(symbol, "already tracked"));
        }
        if self.active_count() >= self.limits.max_open_positions {
            return Err(EngineError::inconsistency(
                symbol,
                format!(
                    "restoring would exceed max_open_positions ({})",
                    self.limits.max_open_positions
                ),
            ));
        }

        let side = if signed_amount > Decimal::ZERO {
            PositionSide::Long
        } else {
            PositionSide::Short
        };
        self.records.insert(
            symbol.to_string(),
            SymbolState::Open(Position {
                id: Uuid::new_v4(),
                symbol: symbol.to_string(),
                side,
                quantity: signed_amount.abs(),
                entry_price,
                opened_at: now,
                protective_orders: ProtectiveOrders::default(),
                trailing: TrailingState::default(),
            }),
        );
        tracing::info!(symbol, ?side, amount = %signed_amount, entry = %entry_price, "Restored position");
        Ok(())
    }

    /// Explicitly add to an open position at a new fill price
    ///
    /// The only path that grows a position in its own direction; the entry
    /// price becomes the size-weighted average.
    pub fn increase_position(
        &mut self,
        symbol: &str,
        add_qty: Decimal,
        price: Decimal,
    ) -> Result<&Position, EngineError> {
        if add_qty <= Decimal::ZERO {
            return Err(EngineError::validation(
                "order",
                format!("increase of {} by {}", symbol, add_qty),
            ));
        }

        match self.records.get_mut(symbol) {
            Some(SymbolState::Open(position)) => {
                let cost = position.entry_price * position.quantity + price * add_qty;
                position.quantity += add_qty;
                position.entry_price = cost / position.quantity;

                tracing::info!(
                    symbol,
                    avg_entry = %position.entry_price,
                    quantity = %position.quantity,
                    "Increased position"
                );
                Ok(&*position)
            }
            _ => Err(EngineError::inconsistency(symbol, "no open position to increase")),
        }
    }

    pub fn attach_protective_order(
        &mut self,
        symbol: &str,
        kind: ProtectiveKind,
        order_id: u64,
    ) -> Result<(), EngineError> {
        let position = match self.records.get_mut(symbol) {
            Some(SymbolState::Open(position)) => position,
            Some(SymbolState::PendingExit(exit)) => &mut exit.position,
            _ => {
                return Err(EngineError::inconsistency(
                    symbol,
                    format!("{:?} order {} without a position", kind, order_id),
                ))
            }
        };
        *position.protective_orders.slot_mut(kind) = Some(order_id);
        Ok(())
    }

    /// Forget a protective order that was cancelled or expired
    pub fn detach_protective_order(&mut self, symbol: &str, order_id: u64) -> bool {
        let position = match self.records.get_mut(symbol) {
            Some(SymbolState::Open(position)) => position,
            Some(SymbolState::PendingExit(exit)) => &mut exit.position,
            _ => return false,
        };

        let orders = &mut position.protective_orders;
        for slot in [&mut orders.take_profit, &mut orders.stop_loss] {
            if *slot == Some(order_id) {
                *slot = None;
                return true;
            }
        }
        false
    }

    /// Exit triggered: Open → PendingExit
    ///
    /// Returns the position only on the transition, so a second trigger
    /// while the close is in flight yields `None`.
    pub fn begin_exit(
        &mut self,
        symbol: &str,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Option<Position> {
        match self.records.remove(symbol) {
            Some(SymbolState::Open(position)) => {
                self.records.insert(
                    symbol.to_string(),
                    SymbolState::PendingExit(PendingExit {
                        position: position.clone(),
                        reason,
                        requested_at: now,
                    }),
                );
                Some(position)
            }
            Some(other) => {
                self.records.insert(symbol.to_string(), other);
                None
            }
            None => None,
        }
    }

    /// Close submission failed: PendingExit → Open so later triggers retry
    pub fn abort_exit(&mut self, symbol: &str) -> bool {
        match self.records.remove(symbol) {
            Some(SymbolState::PendingExit(exit)) => {
                self.records
                    .insert(symbol.to_string(), SymbolState::Open(exit.position));
                true
            }
            Some(other) => {
                self.records.insert(symbol.to_string(), other);
                false
            }
            None => false,
        }
    }

    /// Close confirmed by the exchange: any state → Flat
    ///
    /// A confirmation for a symbol without a position still leaves it flat
    /// and reports a `StateInconsistency`.
    pub fn close_position(
        &mut self,
        symbol: &str,
        exit_price: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<ClosedPosition, EngineError> {
        let (position, reason) = match self.records.remove(symbol) {
            Some(SymbolState::Open(position)) => (position, ExitReason::ProtectiveFill),
            Some(SymbolState::PendingExit(exit)) => (exit.position, exit.reason),
            Some(SymbolState::PendingEntry(_)) => {
                return Err(EngineError::inconsistency(
                    symbol,
                    "close confirmed while only an entry was pending; reservation dropped",
                ));
            }
            None => {
                return Err(EngineError::inconsistency(
                    symbol,
                    "close confirmed with no ledger record",
                ));
            }
        };

        let realized_pnl = exit_price.map(|price| position.pnl_at(price));
        if let Some(pnl) = realized_pnl {
            self.stats.realized_pnl += pnl;
            match TradeOutcome::classify(pnl) {
                TradeOutcome::Win => self.stats.wins += 1,
                TradeOutcome::Loss => self.stats.losses += 1,
                TradeOutcome::Flat => {}
            }
        }
        self.stats.trades += 1;

        if self.limits.reentry_cooldown_secs > 0 {
            let until = i64::try_from(self.limits.reentry_cooldown_secs)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|cooldown| now.checked_add_signed(cooldown))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            self.cooldowns.insert(symbol.to_string(), until);
        }

        Ok(ClosedPosition {
            position,
            reason,
            exit_price,
            realized_pnl,
        })
    }

    /// The exchange reports nothing held for `symbol`: drop the local record
    pub fn force_flat(&mut self, symbol: &str, now: DateTime<Utc>) -> Option<ClosedPosition> {
        match self.close_position(symbol, None, now) {
            Ok(mut closed) => {
                closed.reason = ExitReason::ExchangeFlat;
                Some(closed)
            }
            Err(_) => None,
        }
    }

    /// Re-evaluate an open position against a new mark price
    ///
    /// On a trigger the symbol moves to PendingExit and the forced close is
    /// returned; positions already exiting are left alone.
    pub fn apply_mark_price(
        &mut self,
        symbol: &str,
        mark_price: Decimal,
        now: DateTime<Utc>,
    ) -> Option<ForcedClose> {
        let position = match self.records.get_mut(symbol) {
            Some(SymbolState::Open(position)) => position,
            _ => return None,
        };

        let pnl = position.pnl_at(mark_price);
        tracing::trace!(symbol, %pnl, %mark_price, "Mark price PnL");

        let mut trigger = self.limits.check_pnl(pnl);

        if trigger.is_none() {
            let trailing = &mut position.trailing;
            if !trailing.active && self.limits.trailing_arms_at(pnl) {
                trailing.active = true;
                trailing.peak_pnl = pnl;
                tracing::info!(symbol, %pnl, "Trailing stop armed");
            } else if trailing.active {
                trailing.peak_pnl = trailing.peak_pnl.max(pnl);
                if pnl <= trailing.peak_pnl - self.limits.trailing_giveback_usd {
                    trigger = Some(PnlTrigger::TrailingStop);
                }
            }
        }

        let trigger = trigger?;
        self.begin_exit(symbol, ExitReason::from(trigger), now)?;

        Some(ForcedClose {
            symbol: symbol.to_string(),
            trigger,
            pnl,
            mark_price,
        })
    }
}
