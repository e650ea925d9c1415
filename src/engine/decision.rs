use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::engine::EngineEvent;
use crate::error::EngineError;
use crate::execution::candle_window::CandleWindow;
use crate::execution::gateway::GatewayError;
use crate::execution::position_ledger::{ClosedPosition, ExitReason, LifecycleState, Position, PositionLedger};
use crate::execution::sizing::{FixedNotionalSizer, PositionSizer};
use crate::models::{
    ExecutionCommand, KlineUpdate, MarkPriceUpdate, MarketEvent, OrderStatus, OrderUpdate,
    ProtectiveKind, Side,
};
use crate::risk::TradeOutcome;
use crate::settings::{EngineConfig, SizingConfig};
use crate::strategy::{Signal, SignalDetector, SignalInput};

/// Turns one event into the commands it calls for
///
/// Synchronous and free of I/O: the event loop owns an instance and feeds
/// it one event at a time, then hands the returned commands to the
/// dispatcher.
pub struct DecisionEngine {
    windows: CandleWindow,
    detector: SignalDetector,
    ledger: PositionLedger,
    sizer: Box<dyn PositionSizer>,
    sizing: SizingConfig,
    /// Latest mark price per symbol
    mark_prices: HashMap<String, Decimal>,
    entries_enabled: bool,
    last_event_time: Option<DateTime<Utc>>,
}

impl DecisionEngine {
    pub fn new(config: &EngineConfig) -> Self {
        let sizer = FixedNotionalSizer::from_config(&config.sizing);
        Self::with_sizer(config, Box::new(sizer))
    }

    pub fn with_sizer(config: &EngineConfig, sizer: Box<dyn PositionSizer>) -> Self {
        Self {
            windows: CandleWindow::new(
                config.signal.candle_history_depth,
                config.signal.rsi_length,
            ),
            detector: SignalDetector::new(config.signal.clone()),
            ledger: PositionLedger::new(config.risk.clone()),
            sizer,
            sizing: config.sizing.clone(),
            mark_prices: HashMap::new(),
            entries_enabled: true,
            last_event_time: None,
        }
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn windows(&self) -> &CandleWindow {
        &self.windows
    }

    pub fn mark_price(&self, symbol: &str) -> Option<Decimal> {
        self.mark_prices.get(symbol).copied()
    }

    pub fn last_event_time(&self) -> Option<DateTime<Utc>> {
        self.last_event_time
    }

    pub fn entries_enabled(&self) -> bool {
        self.entries_enabled
    }

    /// Stop opening positions; exits keep working
    pub fn stop_entries(&mut self) {
        if self.entries_enabled {
            tracing::info!("New entries disabled");
        }
        self.entries_enabled = false;
    }

    /// Seed a symbol's close history before live data arrives
    pub fn seed_history(&mut self, symbol: &str, closes: &[Decimal]) {
        self.windows.seed_history(symbol, closes);
    }

    /// Adopt a position the exchange already holds
    pub fn restore_position(
        &mut self,
        symbol: &str,
        signed_amount: Decimal,
        entry_price: Decimal,
    ) -> Result<(), EngineError> {
        let now = self.now();
        self.ledger
            .restore_position(symbol, signed_amount, entry_price, now)
    }

    pub fn handle_event(&mut self, event: EngineEvent) -> Result<Vec<ExecutionCommand>, EngineError> {
        match event {
            EngineEvent::Market(MarketEvent::Kline(kline)) => {
                self.observe_time(kline.event_time);
                self.on_kline(kline)
            }
            EngineEvent::Market(MarketEvent::MarkPrice(updates)) => {
                if let Some(latest) = updates.iter().map(|u| u.event_time).max() {
                    self.observe_time(latest);
                }
                Ok(self.on_mark_prices(updates))
            }
            EngineEvent::Market(MarketEvent::Order(update)) => {
                self.observe_time(update.event_time);
                self.on_order(update)
            }
            EngineEvent::CommandFailed { command, error } => {
                Ok(self.on_command_failed(command, error))
            }
        }
    }

    fn observe_time(&mut self, at: DateTime<Utc>) {
        self.last_event_time = Some(self.last_event_time.map_or(at, |last| last.max(at)));
    }

    fn now(&self) -> DateTime<Utc> {
        self.last_event_time.unwrap_or_else(Utc::now)
    }

    fn on_kline(&mut self, kline: KlineUpdate) -> Result<Vec<ExecutionCommand>, EngineError> {
        validate_kline(&kline)?;

        let symbol = kline.symbol.as_str();
        let candle = kline.candle();
        let pattern = self.windows.ingest(symbol, candle.clone());
        let rsi = match pattern {
            Some(_) => self.windows.rsi(symbol),
            None => None,
        };

        let signal = self.detector.evaluate(&SignalInput {
            current: &candle,
            pattern: pattern.as_ref(),
            rsi,
            position_open: self.ledger.has_open_position(symbol),
        });

        match signal {
            Signal::NoSignal => Ok(Vec::new()),
            Signal::Exit => Ok(self.exit_on_close(symbol, candle.close, kline.event_time)),
            Signal::TrendEntry(side) | Signal::CounterEntry(side) => {
                Ok(self.enter(symbol, signal, side, candle.close, kline.event_time))
            }
        }
    }

    fn exit_on_close(
        &mut self,
        symbol: &str,
        close: Decimal,
        now: DateTime<Utc>,
    ) -> Vec<ExecutionCommand> {
        let Some(position) = self.ledger.begin_exit(symbol, ExitReason::CandleClose, now) else {
            return Vec::new();
        };

        let pnl = position.pnl_at(close);
        tracing::info!(
            symbol,
            side = ?position.side,
            entry = %position.entry_price,
            close = %close,
            pnl = %pnl,
            outcome = ?TradeOutcome::classify(pnl),
            "Closing position on candle close"
        );
        close_commands(symbol)
    }

    fn enter(
        &mut self,
        symbol: &str,
        signal: Signal,
        side: Side,
        close: Decimal,
        now: DateTime<Utc>,
    ) -> Vec<ExecutionCommand> {
        if !self.entries_enabled {
            tracing::debug!(symbol, ?signal, "Entries disabled, signal ignored");
            return Vec::new();
        }

        let price = self.entry_price(signal, side, close);
        let qty = self.sizer.quantity(symbol, price);
        if qty <= Decimal::ZERO {
            tracing::warn!(symbol, %price, "Sizer returned no quantity, skipping entry");
            return Vec::new();
        }

        if !self.ledger.try_reserve(symbol, side, price, qty, now) {
            return Vec::new();
        }

        tracing::info!(
            symbol,
            ?signal,
            %side,
            %price,
            %qty,
            order_type = ?self.sizing.entry_order_type,
            "Submitting entry"
        );

        vec![ExecutionCommand::SubmitEntry {
            symbol: symbol.to_string(),
            side,
            price,
            qty,
            order_type: self.sizing.entry_order_type,
        }]
    }

    /// Trend entries chase the move, counter entries wait for a better price
    fn entry_price(&self, signal: Signal, side: Side, close: Decimal) -> Decimal {
        let offset = self.sizing.entry_offset_pct;
        let chase = matches!(signal, Signal::TrendEntry(_));
        let above = match side {
            Side::Buy => chase,
            Side::Sell => !chase,
        };
        if above {
            close * (Decimal::ONE + offset)
        } else {
            close * (Decimal::ONE - offset)
        }
    }

    fn on_mark_prices(&mut self, updates: Vec<MarkPriceUpdate>) -> Vec<ExecutionCommand> {
        let mut commands = Vec::new();

        for update in updates {
            if update.mark_price <= Decimal::ZERO {
                tracing::warn!(symbol = %update.symbol, mark = %update.mark_price, "Ignoring non-positive mark price");
                continue;
            }
            self.mark_prices.insert(update.symbol.clone(), update.mark_price);

            if !self.ledger.has_open_position(&update.symbol) {
                continue;
            }
            let Some(forced) =
                self.ledger
                    .apply_mark_price(&update.symbol, update.mark_price, update.event_time)
            else {
                continue;
            };

            tracing::info!(
                symbol = %forced.symbol,
                trigger = ?forced.trigger,
                pnl = %forced.pnl,
                mark = %forced.mark_price,
                outcome = ?TradeOutcome::classify(forced.pnl),
                "Forced close"
            );
            commands.extend(close_commands(&forced.symbol));
        }

        commands
    }

    fn on_order(&mut self, update: OrderUpdate) -> Result<Vec<ExecutionCommand>, EngineError> {
        match update.status {
            OrderStatus::New => {
                self.on_order_accepted(&update);
                Ok(Vec::new())
            }
            OrderStatus::PartiallyFilled => {
                tracing::debug!(
                    symbol = %update.symbol,
                    order_id = update.order_id,
                    filled = %update.filled_qty,
                    "Partial fill"
                );
                Ok(Vec::new())
            }
            OrderStatus::Filled => self.on_fill(update),
            status if status.is_terminal_without_fill() => {
                if self.is_partial_entry(&update) {
                    // the filled part stays on the exchange, track it as the position
                    tracing::info!(
                        symbol = %update.symbol,
                        status = ?status,
                        filled = %update.filled_qty,
                        "Entry order ended partially filled"
                    );
                    return self.on_fill(update);
                }
                self.on_order_dead(&update);
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }

    fn on_order_accepted(&mut self, update: &OrderUpdate) {
        let symbol = update.symbol.as_str();

        if update.reduce_only {
            let Some(kind) = update.order_type.protective_kind() else {
                return;
            };
            if let Err(e) = self.ledger.attach_protective_order(symbol, kind, update.order_id) {
                tracing::debug!(symbol, order_id = update.order_id, error = %e, "Protective order not attached");
            }
            return;
        }

        let pending_side = self.ledger.pending_entry(symbol).map(|p| p.side);
        if pending_side == Some(update.side) {
            self.ledger.record_entry_order(symbol, update.order_id);
        }
    }

    fn is_partial_entry(&self, update: &OrderUpdate) -> bool {
        !update.reduce_only
            && update.filled_qty > Decimal::ZERO
            && self.ledger.pending_entry(&update.symbol).map(|p| p.side) == Some(update.side)
    }

    fn on_order_dead(&mut self, update: &OrderUpdate) {
        let symbol = update.symbol.as_str();

        let pending_side = self.ledger.pending_entry(symbol).map(|p| p.side);
        if !update.reduce_only && pending_side == Some(update.side) {
            if let Some(pending) = self.ledger.release_reservation(symbol) {
                tracing::info!(
                    symbol,
                    status = ?update.status,
                    side = %pending.side,
                    price = %pending.requested_price,
                    "Entry order ended without fill, reservation released"
                );
            }
            return;
        }

        if self.ledger.detach_protective_order(symbol, update.order_id) {
            tracing::debug!(symbol, order_id = update.order_id, status = ?update.status, "Protective order removed");
        }
    }

    fn on_fill(&mut self, update: OrderUpdate) -> Result<Vec<ExecutionCommand>, EngineError> {
        let symbol = update.symbol.as_str();

        match self.ledger.state(symbol) {
            LifecycleState::PendingEntry => {
                if update.reduce_only {
                    return Err(EngineError::inconsistency(
                        symbol,
                        format!("reduce-only fill of order {} while an entry is pending", update.order_id),
                    ));
                }
                let position = self
                    .ledger
                    .open_position(
                        symbol,
                        update.side,
                        update.filled_qty,
                        update.avg_price,
                        update.event_time,
                    )?
                    .clone();

                tracing::info!(
                    symbol,
                    side = ?position.side,
                    qty = %position.quantity,
                    entry = %position.entry_price,
                    "Entry filled"
                );
                Ok(vec![self.take_profit_order(&position)])
            }
            state @ (LifecycleState::Open | LifecycleState::PendingExit) => {
                let closing_side = self
                    .ledger
                    .position(symbol)
                    .map(|p| p.side.closing_side());
                if !update.reduce_only && closing_side != Some(update.side) {
                    return Err(EngineError::inconsistency(
                        symbol,
                        format!("{} fill adds to an open position", update.side),
                    ));
                }

                let exit_price = (update.avg_price > Decimal::ZERO).then_some(update.avg_price);
                let closed = self.ledger.close_position(symbol, exit_price, update.event_time)?;
                log_closed(&closed);

                // a protective fill leaves the other protective order resting
                if state == LifecycleState::Open {
                    Ok(vec![ExecutionCommand::CancelAll {
                        symbol: symbol.to_string(),
                    }])
                } else {
                    Ok(Vec::new())
                }
            }
            LifecycleState::Flat => {
                if update.reduce_only {
                    return Err(EngineError::inconsistency(
                        symbol,
                        format!("reduce-only fill of order {} with no position", update.order_id),
                    ));
                }
                tracing::warn!(
                    symbol,
                    order_id = update.order_id,
                    side = %update.side,
                    qty = %update.filled_qty,
                    "Untracked entry fill, flattening"
                );
                Ok(vec![ExecutionCommand::ClosePosition {
                    symbol: symbol.to_string(),
                }])
            }
        }
    }

    fn on_command_failed(
        &mut self,
        command: ExecutionCommand,
        error: GatewayError,
    ) -> Vec<ExecutionCommand> {
        let now = self.now();

        match command {
            ExecutionCommand::SubmitEntry { symbol, .. } => {
                if self.ledger.release_reservation(&symbol).is_some() {
                    tracing::warn!(symbol = %symbol, %error, "Entry submission failed, reservation released");
                }
                Vec::new()
            }
            ExecutionCommand::ClosePosition { symbol } => match error {
                GatewayError::NoPosition { .. } => match self.ledger.force_flat(&symbol, now) {
                    Some(closed) => {
                        log_closed(&closed);
                        vec![ExecutionCommand::CancelAll { symbol }]
                    }
                    None => Vec::new(),
                },
                _ => {
                    if self.ledger.abort_exit(&symbol) {
                        tracing::error!(symbol = %symbol, %error, "Close failed, position stays open");
                    }
                    Vec::new()
                }
            },
            ExecutionCommand::SubmitProtective { symbol, kind, .. } => {
                tracing::warn!(symbol = %symbol, ?kind, %error, "Protective order not placed");
                Vec::new()
            }
            ExecutionCommand::CancelAll { symbol } => {
                tracing::warn!(symbol = %symbol, %error, "Cancel-all failed");
                Vec::new()
            }
        }
    }

    /// Take-profit sized to the whole position
    ///
    /// The stop sits `target_pct` beyond the more conservative of entry and
    /// last mark price, the limit a further `tp_limit_offset_pct` inside it.
    pub fn take_profit_order(&self, position: &Position) -> ExecutionCommand {
        let target = self.sizing.target_pct();
        let offset = self.sizing.tp_limit_offset_pct;
        let mark = self
            .mark_price(&position.symbol)
            .unwrap_or(position.entry_price);
        let side = position.side.closing_side();

        let (stop_price, limit_price) = match side {
            Side::Sell => {
                let stop = position.entry_price.max(mark) * (Decimal::ONE + target);
                (stop, stop * (Decimal::ONE - offset))
            }
            Side::Buy => {
                let stop = position.entry_price.min(mark) * (Decimal::ONE - target);
                (stop, stop * (Decimal::ONE + offset))
            }
        };

        tracing::info!(
            symbol = %position.symbol,
            %side,
            stop = %stop_price,
            limit = %limit_price,
            qty = %position.quantity,
            "Placing take-profit"
        );

        ExecutionCommand::SubmitProtective {
            symbol: position.symbol.clone(),
            kind: ProtectiveKind::TakeProfit,
            side,
            stop_price,
            limit_price,
            qty: position.quantity,
        }
    }
}

fn validate_kline(kline: &KlineUpdate) -> Result<(), EngineError> {
    let prices = [kline.open, kline.high, kline.low, kline.close];
    if prices.iter().any(|p| *p <= Decimal::ZERO) {
        return Err(EngineError::validation(
            "kline",
            format!("{} has a non-positive price", kline.symbol),
        ));
    }
    if kline.high < kline.low {
        return Err(EngineError::validation(
            "kline",
            format!("{} high {} below low {}", kline.symbol, kline.high, kline.low),
        ));
    }
    Ok(())
}

fn close_commands(symbol: &str) -> Vec<ExecutionCommand> {
    vec![
        ExecutionCommand::ClosePosition {
            symbol: symbol.to_string(),
        },
        ExecutionCommand::CancelAll {
            symbol: symbol.to_string(),
        },
    ]
}

fn log_closed(closed: &ClosedPosition) {
    let position = &closed.position;
    match closed.realized_pnl {
        Some(pnl) => match TradeOutcome::classify(pnl) {
            TradeOutcome::Win => tracing::info!(
                symbol = %position.symbol,
                reason = ?closed.reason,
                pnl = %pnl,
                "WIN"
            ),
            TradeOutcome::Loss => tracing::info!(
                symbol = %position.symbol,
                reason = ?closed.reason,
                pnl = %pnl,
                "LOSS"
            ),
            TradeOutcome::Flat => tracing::info!(
                symbol = %position.symbol,
                reason = ?closed.reason,
                "Closed flat"
            ),
        },
        None => tracing::info!(
            symbol = %position.symbol,
            reason = ?closed.reason,
            "Position closed, exit price unknown"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryOrderType, OrderType};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    const SYMBOL: &str = "SOLUSDT";

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn kline(minute: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal, closed: bool) -> EngineEvent {
        EngineEvent::Market(MarketEvent::Kline(KlineUpdate {
            symbol: SYMBOL.to_string(),
            open,
            high,
            low,
            close,
            is_closed: closed,
            open_time: t(minute),
            event_time: t(minute),
        }))
    }

    fn fill(order_id: u64, side: Side, qty: Decimal, price: Decimal, reduce_only: bool) -> EngineEvent {
        EngineEvent::Market(MarketEvent::Order(OrderUpdate {
            symbol: SYMBOL.to_string(),
            order_id,
            status: OrderStatus::Filled,
            side,
            filled_qty: qty,
            avg_price: price,
            reduce_only,
            order_type: if reduce_only { OrderType::Market } else { OrderType::Limit },
            event_time: t(1),
        }))
    }

    fn mark(price: Decimal) -> EngineEvent {
        EngineEvent::Market(MarketEvent::MarkPrice(vec![MarkPriceUpdate {
            symbol: SYMBOL.to_string(),
            mark_price: price,
            event_time: t(1),
        }]))
    }

    fn counter_buy_kline() -> EngineEvent {
        // -3.2%, close kept 3.2 of the 3.9 drop: buy_ratio 82, fade the drop
        kline(0, dec!(100), dec!(100), dec!(96.1), dec!(96.8), false)
    }

    fn engine() -> DecisionEngine {
        DecisionEngine::new(&EngineConfig::default())
    }

    fn open_long(engine: &mut DecisionEngine) {
        let commands = engine.handle_event(counter_buy_kline()).unwrap();
        assert_eq!(commands.len(), 1);
        let ExecutionCommand::SubmitEntry { qty, price, .. } = commands[0].clone() else {
            panic!("expected entry, got {:?}", commands);
        };
        engine.handle_event(fill(1, Side::Buy, qty, price, false)).unwrap();
    }

    #[test]
    fn test_counter_tier_submits_improved_entry() {
        let mut engine = engine();
        let commands = engine.handle_event(counter_buy_kline()).unwrap();

        assert_eq!(
            commands,
            vec![ExecutionCommand::SubmitEntry {
                symbol: SYMBOL.to_string(),
                side: Side::Buy,
                price: dec!(96.7516),
                qty: (dec!(10) / dec!(96.7516)).round_dp(8),
                order_type: EntryOrderType::Limit,
            }]
        );
        assert_eq!(engine.ledger().state(SYMBOL), LifecycleState::PendingEntry);
    }

    #[test]
    fn test_reservation_blocks_duplicate_entry() {
        let mut engine = engine();
        engine.handle_event(counter_buy_kline()).unwrap();
        let again = engine.handle_event(counter_buy_kline()).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_trend_entry_chases() {
        let mut engine = engine();
        // +4%, close at the high: sell_ratio 100 -> trend band
        let commands = engine
            .handle_event(kline(0, dec!(100), dec!(104), dec!(100), dec!(104), false))
            .unwrap();
        match &commands[..] {
            [ExecutionCommand::SubmitEntry { side, price, .. }] => {
                assert_eq!(*side, Side::Buy);
                assert_eq!(*price, dec!(104.052));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_entry_fill_places_take_profit() {
        let mut engine = engine();
        let commands = engine.handle_event(counter_buy_kline()).unwrap();
        let ExecutionCommand::SubmitEntry { qty, .. } = commands[0].clone() else {
            panic!("expected entry");
        };

        let commands = engine
            .handle_event(fill(7, Side::Buy, qty, dec!(100), false))
            .unwrap();
        assert_eq!(engine.ledger().state(SYMBOL), LifecycleState::Open);

        // target 0.15 / (0.5 * 20) = 1.5%
        assert_eq!(
            commands,
            vec![ExecutionCommand::SubmitProtective {
                symbol: SYMBOL.to_string(),
                kind: ProtectiveKind::TakeProfit,
                side: Side::Sell,
                stop_price: dec!(101.5),
                limit_price: dec!(101.297),
                qty,
            }]
        );
    }

    #[test]
    fn test_take_profit_anchors_on_mark() {
        let mut engine = engine();
        engine.handle_event(mark(dec!(102))).unwrap();
        let commands = engine.handle_event(counter_buy_kline()).unwrap();
        let ExecutionCommand::SubmitEntry { qty, .. } = commands[0].clone() else {
            panic!("expected entry");
        };

        let commands = engine
            .handle_event(fill(7, Side::Buy, qty, dec!(100), false))
            .unwrap();
        match &commands[..] {
            [ExecutionCommand::SubmitProtective { stop_price, .. }] => {
                assert_eq!(*stop_price, dec!(103.53));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_short_take_profit_below_entry() {
        let mut engine = engine();
        engine.handle_event(mark(dec!(99))).unwrap();
        engine.ledger.try_reserve(SYMBOL, Side::Sell, dec!(100), dec!(1), t(0));
        let commands = engine
            .handle_event(fill(3, Side::Sell, dec!(1), dec!(100), false))
            .unwrap();
        match &commands[..] {
            [ExecutionCommand::SubmitProtective { side, stop_price, limit_price, .. }] => {
                assert_eq!(*side, Side::Buy);
                assert_eq!(*stop_price, dec!(97.515));
                assert_eq!(*limit_price, dec!(97.71003));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_candle_close_exits() {
        let mut engine = engine();
        open_long(&mut engine);

        let commands = engine
            .handle_event(kline(1, dec!(97), dec!(97.5), dec!(96.9), dec!(97.2), true))
            .unwrap();
        assert_eq!(commands, close_commands(SYMBOL));
        assert_eq!(engine.ledger().state(SYMBOL), LifecycleState::PendingExit);

        // second trigger while the close is in flight does nothing
        let again = engine.handle_event(mark(dec!(50))).unwrap();
        assert!(again.is_empty());

        let commands = engine
            .handle_event(fill(9, Side::Sell, dec!(0.1), dec!(97.2), true))
            .unwrap();
        assert!(commands.is_empty());
        assert_eq!(engine.ledger().state(SYMBOL), LifecycleState::Flat);
        assert_eq!(engine.ledger().stats().trades, 1);
    }

    #[test]
    fn test_mark_price_stop_loss() {
        let mut engine = engine();
        engine.ledger.try_reserve(SYMBOL, Side::Buy, dec!(100), dec!(1), t(0));
        engine
            .handle_event(fill(1, Side::Buy, dec!(1), dec!(100), false))
            .unwrap();

        assert!(engine.handle_event(mark(dec!(99.9))).unwrap().is_empty());
        let commands = engine.handle_event(mark(dec!(99.8))).unwrap();
        assert_eq!(commands, close_commands(SYMBOL));
        assert_eq!(
            engine.ledger().pending_exit(SYMBOL).map(|p| p.reason),
            Some(ExitReason::StopLoss)
        );
    }

    #[test]
    fn test_protective_fill_cancels_remaining_orders() {
        let mut engine = engine();
        open_long(&mut engine);

        let commands = engine
            .handle_event(fill(11, Side::Sell, dec!(0.1), dec!(101.3), true))
            .unwrap();
        assert_eq!(
            commands,
            vec![ExecutionCommand::CancelAll {
                symbol: SYMBOL.to_string()
            }]
        );
        assert_eq!(engine.ledger().stats().wins, 1);
    }

    #[test]
    fn test_untracked_fill_is_flattened() {
        let mut engine = engine();
        let commands = engine
            .handle_event(fill(5, Side::Buy, dec!(1), dec!(100), false))
            .unwrap();
        assert_eq!(
            commands,
            vec![ExecutionCommand::ClosePosition {
                symbol: SYMBOL.to_string()
            }]
        );

        let result = engine.handle_event(fill(6, Side::Sell, dec!(1), dec!(100), true));
        assert!(matches!(result, Err(EngineError::StateInconsistency { .. })));
    }

    #[test]
    fn test_rejected_entry_releases_reservation() {
        let mut engine = engine();
        engine.handle_event(counter_buy_kline()).unwrap();

        let rejected = EngineEvent::Market(MarketEvent::Order(OrderUpdate {
            symbol: SYMBOL.to_string(),
            order_id: 1,
            status: OrderStatus::Rejected,
            side: Side::Buy,
            filled_qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            reduce_only: false,
            order_type: OrderType::Limit,
            event_time: t(0),
        }));
        engine.handle_event(rejected).unwrap();
        assert_eq!(engine.ledger().state(SYMBOL), LifecycleState::Flat);
    }

    #[test]
    fn test_partially_filled_entry_cancel_opens_filled_part() {
        let mut engine = engine();
        engine.handle_event(counter_buy_kline()).unwrap();

        let update = |status, filled| {
            EngineEvent::Market(MarketEvent::Order(OrderUpdate {
                symbol: SYMBOL.to_string(),
                order_id: 1,
                status,
                side: Side::Buy,
                filled_qty: filled,
                avg_price: dec!(96.7516),
                reduce_only: false,
                order_type: OrderType::Limit,
                event_time: t(0),
            }))
        };
        assert!(engine
            .handle_event(update(OrderStatus::PartiallyFilled, dec!(0.05)))
            .unwrap()
            .is_empty());
        assert_eq!(engine.ledger().state(SYMBOL), LifecycleState::PendingEntry);

        let commands = engine
            .handle_event(update(OrderStatus::Canceled, dec!(0.05)))
            .unwrap();
        assert_eq!(engine.ledger().state(SYMBOL), LifecycleState::Open);
        let position = engine.ledger().position(SYMBOL).unwrap();
        assert_eq!(position.quantity, dec!(0.05));
        assert_eq!(position.entry_price, dec!(96.7516));
        assert!(matches!(
            &commands[..],
            [ExecutionCommand::SubmitProtective { side: Side::Sell, qty, .. }] if *qty == dec!(0.05)
        ));
    }

    #[test]
    fn test_failed_submission_releases_reservation() {
        let mut engine = engine();
        let commands = engine.handle_event(counter_buy_kline()).unwrap();
        engine
            .handle_event(EngineEvent::CommandFailed {
                command: commands[0].clone(),
                error: GatewayError::Transient("timeout".to_string()),
            })
            .unwrap();
        assert_eq!(engine.ledger().state(SYMBOL), LifecycleState::Flat);
    }

    #[test]
    fn test_failed_close_reopens_or_flattens() {
        let mut engine = engine();
        open_long(&mut engine);
        engine
            .handle_event(kline(1, dec!(97), dec!(97.5), dec!(96.9), dec!(97.2), true))
            .unwrap();

        let close = ExecutionCommand::ClosePosition {
            symbol: SYMBOL.to_string(),
        };
        engine
            .handle_event(EngineEvent::CommandFailed {
                command: close.clone(),
                error: GatewayError::Transient("timeout".to_string()),
            })
            .unwrap();
        assert_eq!(engine.ledger().state(SYMBOL), LifecycleState::Open);

        engine
            .handle_event(kline(2, dec!(97), dec!(97.5), dec!(96.9), dec!(97.2), true))
            .unwrap();
        let commands = engine
            .handle_event(EngineEvent::CommandFailed {
                command: close,
                error: GatewayError::NoPosition {
                    symbol: SYMBOL.to_string(),
                },
            })
            .unwrap();
        assert_eq!(engine.ledger().state(SYMBOL), LifecycleState::Flat);
        assert_eq!(
            commands,
            vec![ExecutionCommand::CancelAll {
                symbol: SYMBOL.to_string()
            }]
        );
    }

    #[test]
    fn test_stopped_entries_still_exit() {
        let mut engine = engine();
        open_long(&mut engine);
        engine.stop_entries();

        let exit = engine
            .handle_event(kline(1, dec!(97), dec!(97.5), dec!(96.9), dec!(97.2), true))
            .unwrap();
        assert_eq!(exit, close_commands(SYMBOL));

        let mut other = DecisionEngine::new(&EngineConfig::default());
        other.stop_entries();
        assert!(other.handle_event(counter_buy_kline()).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_kline_rejected() {
        let mut engine = engine();
        let result = engine.handle_event(kline(0, dec!(100), dec!(99), dec!(101), dec!(100), false));
        assert!(matches!(result, Err(EngineError::Validation { kind: "kline", .. })));
    }

    #[test]
    fn test_protective_order_tracked() {
        let mut engine = engine();
        open_long(&mut engine);

        let accepted = EngineEvent::Market(MarketEvent::Order(OrderUpdate {
            symbol: SYMBOL.to_string(),
            order_id: 42,
            status: OrderStatus::New,
            side: Side::Sell,
            filled_qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            reduce_only: true,
            order_type: OrderType::TakeProfit,
            event_time: t(1),
        }));
        engine.handle_event(accepted).unwrap();
        assert_eq!(
            engine
                .ledger()
                .position(SYMBOL)
                .and_then(|p| p.protective_orders.take_profit),
            Some(42)
        );
    }
}
