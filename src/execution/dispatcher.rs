use governor::{Quota, RateLimiter};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::engine::{Activity, EngineEvent, EventSender};
use crate::execution::gateway::{ExecutionGateway, GatewayError};
use crate::models::ExecutionCommand;
use crate::settings::RuntimeConfig;

type GatewayRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Bounded worker pool between the consumer and the gateway
///
/// Commands are routed to a lane by symbol, so calls for one symbol run
/// in submission order while a slow symbol never stalls the others.
/// Failed calls come back into the event queue as `CommandFailed`.
pub struct Dispatcher {
    lanes: Vec<mpsc::Sender<ExecutionCommand>>,
    workers: Vec<JoinHandle<()>>,
    activity: Activity,
}

impl Dispatcher {
    pub fn spawn(
        gateway: Arc<dyn ExecutionGateway>,
        events: EventSender,
        runtime: &RuntimeConfig,
    ) -> Self {
        let rate = NonZeroU32::new(runtime.gateway_rate_per_sec).unwrap_or(NonZeroU32::MIN);
        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(rate)));

        let worker_count = runtime.dispatcher_workers.max(1);
        let mut lanes = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);

        for lane in 0..worker_count {
            let (tx, rx) = mpsc::channel(runtime.dispatcher_capacity.max(1));
            lanes.push(tx);
            workers.push(tokio::spawn(run_worker(
                lane,
                rx,
                Arc::clone(&gateway),
                Arc::clone(&limiter),
                events.clone(),
            )));
        }

        tracing::info!(
            gateway = gateway.name(),
            workers = worker_count,
            rate_per_sec = rate.get(),
            "Dispatcher started"
        );

        Self {
            lanes,
            workers,
            activity: events.activity(),
        }
    }

    fn lane_for(&self, symbol: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);
        (hasher.finish() % self.lanes.len() as u64) as usize
    }

    /// Queue a command on its symbol's lane without waiting
    ///
    /// A full lane is reported as a transient failure instead of blocking
    /// the consumer.
    pub fn try_submit(&self, command: ExecutionCommand) -> Result<(), GatewayError> {
        let lane = self.lane_for(command.symbol());
        self.activity.begin();
        let result = match self.lanes[lane].try_send(command) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Full(command)) => Err(GatewayError::Transient(
                format!("dispatcher lane {} full, dropped {}", lane, command.name()),
            )),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(GatewayError::Closed),
        };
        self.activity.finish();
        result
    }

    /// Stop accepting commands and wait for queued ones to finish
    pub async fn shutdown(self) {
        let Self { lanes, workers, .. } = self;
        drop(lanes);

        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Dispatcher worker panicked");
            }
        }
        tracing::info!("Dispatcher stopped");
    }
}

async fn run_worker(
    lane: usize,
    mut commands: mpsc::Receiver<ExecutionCommand>,
    gateway: Arc<dyn ExecutionGateway>,
    limiter: Arc<GatewayRateLimiter>,
    events: EventSender,
) {
    let activity = events.activity();
    while let Some(command) = commands.recv().await {
        limiter.until_ready().await;

        match gateway.execute(&command).await {
            Ok(()) => {
                tracing::debug!(lane, symbol = command.symbol(), command = command.name(), "Command sent");
            }
            Err(error) => {
                tracing::warn!(
                    lane,
                    symbol = command.symbol(),
                    command = command.name(),
                    %error,
                    "Command failed"
                );
                if events
                    .publish(EngineEvent::CommandFailed { command, error })
                    .await
                    .is_err()
                {
                    tracing::debug!(lane, "Event queue closed, failure not reported");
                }
            }
        }
        activity.finish();
    }
}
