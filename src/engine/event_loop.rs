use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::codec;
use crate::engine::DecisionEngine;
use crate::error::EngineError;
use crate::execution::dispatcher::Dispatcher;
use crate::execution::gateway::GatewayError;
use crate::models::{ExecutionCommand, MarketEvent};
use crate::settings::RuntimeConfig;

/// Everything the consumer reacts to
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Market(MarketEvent),
    /// A gateway call that did not go through
    CommandFailed {
        command: ExecutionCommand,
        error: GatewayError,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::Market(event) => event.kind(),
            EngineEvent::CommandFailed { .. } => "command_failed",
        }
    }
}

const IDLE_POLL: std::time::Duration = std::time::Duration::from_millis(5);

/// Work handed off but not finished yet
///
/// One counter covers queued events and commands held by the dispatcher.
/// Every handoff counts the new unit before the old one is finished, so
/// zero means nothing is queued, running or about to report back.
#[derive(Debug, Clone, Default)]
pub struct Activity {
    outstanding: Arc<AtomicUsize>,
}

impl Activity {
    pub(crate) fn begin(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn finish(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }

    /// Wait until every queued event and dispatched command is done
    pub async fn wait_idle(&self) {
        while !self.is_idle() {
            tokio::time::sleep(IDLE_POLL).await;
        }
    }
}

/// Create the bounded event queue
///
/// Producers wait when it is full, so no fill report is ever dropped.
pub fn event_queue(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let activity = Activity::default();
    (
        EventSender {
            tx,
            activity: activity.clone(),
        },
        EventReceiver { rx, activity },
    )
}

/// Producer handle; clone one per stream
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<EngineEvent>,
    activity: Activity,
}

impl EventSender {
    pub async fn publish(&self, event: EngineEvent) -> Result<(), EngineError> {
        self.activity.begin();
        self.tx.send(event).await.map_err(|_| {
            self.activity.finish();
            EngineError::QueueClosed
        })
    }

    pub fn activity(&self) -> Activity {
        self.activity.clone()
    }

    pub async fn publish_market(&self, event: MarketEvent) -> Result<(), EngineError> {
        self.publish(EngineEvent::Market(event)).await
    }

    /// Decode one raw stream message and enqueue the events it carries
    ///
    /// Returns how many events were queued; malformed payloads are
    /// rejected before anything is queued.
    pub async fn publish_raw(&self, payload: &str) -> Result<usize, EngineError> {
        let events = codec::decode(payload)?;
        let count = events.len();
        for event in events {
            self.publish_market(event).await?;
        }
        Ok(count)
    }
}

#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<EngineEvent>,
    activity: Activity,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        self.rx.try_recv().ok()
    }

    /// Refuse further sends; already queued events stay readable
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Mark one received event as fully handled
    pub fn done(&self) {
        self.activity.finish();
    }
}

/// The single consumer
///
/// Owns the decision engine outright, so candle windows and the ledger are
/// never touched from more than one task.
pub struct EventLoop {
    engine: DecisionEngine,
    dispatcher: Dispatcher,
    liveness_every: Duration,
    last_liveness: Option<DateTime<Utc>>,
    processed: u64,
}

impl EventLoop {
    pub fn new(engine: DecisionEngine, dispatcher: Dispatcher, runtime: &RuntimeConfig) -> Self {
        Self {
            engine,
            dispatcher,
            liveness_every: i64::try_from(runtime.liveness_log_secs)
                .ok()
                .and_then(Duration::try_seconds)
                .unwrap_or(Duration::MAX),
            last_liveness: None,
            processed: 0,
        }
    }

    /// Drain events until shutdown is signalled or every producer is gone
    ///
    /// A producer that runs out of input should wait for
    /// [`Activity::wait_idle`] before signalling, otherwise entries still
    /// queued are refused. On shutdown new entries stop, the receiver is closed and whatever is
    /// already queued is still processed so fills and forced closes land.
    /// Closes dispatched during the drain are sent, but their fill reports
    /// arrive after the queue is closed and are not applied.
    pub async fn run(
        mut self,
        mut events: EventReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) -> DecisionEngine {
        tracing::info!("Event loop started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Shutdown requested");
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => {
                        self.process(event);
                        events.done();
                    }
                    None => {
                        tracing::info!("All producers finished");
                        break;
                    }
                },
            }
        }

        self.engine.stop_entries();
        events.close();
        let mut drained = 0u64;
        while let Some(event) = events.recv().await {
            self.process(event);
            events.done();
            drained += 1;
        }
        if drained > 0 {
            tracing::info!(drained, "Processed queued events after shutdown");
        }

        self.dispatcher.shutdown().await;

        let stats = self.engine.ledger().stats();
        tracing::info!(
            processed = self.processed,
            trades = stats.trades,
            wins = stats.wins,
            losses = stats.losses,
            realized_pnl = %stats.realized_pnl,
            open = self.engine.ledger().open_positions().len(),
            "Event loop stopped"
        );

        self.engine
    }

    fn process(&mut self, event: EngineEvent) {
        self.processed += 1;

        let mut backlog = VecDeque::from([event]);
        while let Some(event) = backlog.pop_front() {
            let kind = event.kind();
            let commands = match self.engine.handle_event(event) {
                Ok(commands) => commands,
                Err(error) => {
                    log_event_error(kind, &error);
                    continue;
                }
            };

            for command in commands {
                if let Err(error) = self.dispatcher.try_submit(command.clone()) {
                    tracing::warn!(
                        symbol = command.symbol(),
                        command = command.name(),
                        %error,
                        "Could not dispatch command"
                    );
                    backlog.push_back(EngineEvent::CommandFailed { command, error });
                }
            }
        }

        self.log_liveness();
    }

    fn log_liveness(&mut self) {
        let Some(now) = self.engine.last_event_time() else {
            return;
        };
        match self.last_liveness {
            None => self.last_liveness = Some(now),
            Some(last) if now - last >= self.liveness_every => {
                self.last_liveness = Some(now);
                tracing::info!(
                    processed = self.processed,
                    symbols = self.engine.windows().symbols().len(),
                    active = self.engine.ledger().active_count(),
                    "Engine alive"
                );
            }
            Some(_) => {}
        }
    }
}

fn log_event_error(kind: &'static str, error: &EngineError) {
    match error {
        EngineError::Validation { .. } | EngineError::StateInconsistency { .. } => {
            tracing::warn!(event = kind, %error, "Event rejected");
        }
        EngineError::Gateway(_) | EngineError::Config(_) | EngineError::QueueClosed => {
            tracing::error!(event = kind, %error, "Event handling failed");
        }
    }
}
