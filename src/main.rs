use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use klinebot::engine::{event_queue, Activity, DecisionEngine, EventLoop, EventSender};
use klinebot::execution::{Dispatcher, PaperGateway};
use klinebot::models::MarketEvent;
use klinebot::sim::{mark_from_kline, MarketScenario, SyntheticKlineGenerator};
use klinebot::{codec, EngineConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "klinebot", version, about = "Kline-driven futures trading engine")]
struct Cli {
    /// TOML config file; KLINEBOT__* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Feed recorded stream messages through the engine against the paper gateway
    Replay {
        /// File with one raw stream message per line
        input: PathBuf,
    },
    /// Trade a synthetic market against the paper gateway
    Paper {
        #[arg(long, value_delimiter = ',', default_value = "SOLUSDT,ETHUSDT")]
        symbols: Vec<String>,

        #[arg(long, default_value_t = 500)]
        candles: usize,

        /// Candle interval in minutes
        #[arg(long, default_value_t = 5)]
        interval: i64,

        #[arg(long, default_value_t = 42)]
        seed: u64,

        #[arg(long, value_enum, default_value_t = Scenario::Volatile)]
        scenario: Scenario,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Scenario {
    Uptrend,
    Downtrend,
    Sideways,
    Volatile,
}

impl From<Scenario> for MarketScenario {
    fn from(scenario: Scenario) -> Self {
        match scenario {
            Scenario::Uptrend => MarketScenario::Uptrend,
            Scenario::Downtrend => MarketScenario::Downtrend,
            Scenario::Sideways => MarketScenario::Sideways,
            Scenario::Volatile => MarketScenario::Volatile,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    setup_logging(cli.json);

    let config =
        EngineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let (events_tx, events_rx) = event_queue(config.runtime.queue_capacity);
    let activity = events_tx.activity();
    let gateway = Arc::new(PaperGateway::new(events_tx.clone()));
    let dispatcher = Dispatcher::spawn(gateway.clone(), events_tx.clone(), &config.runtime);
    let mut engine = DecisionEngine::new(&config);

    let producer = match cli.command {
        Command::Replay { input } => {
            tokio::spawn(replay(input, Arc::clone(&gateway), events_tx.clone()))
        }
        Command::Paper {
            symbols,
            candles,
            interval,
            seed,
            scenario,
        } => {
            let mut generator = SyntheticKlineGenerator::new(seed);
            let start = Utc::now() - Duration::minutes(candles as i64 * interval);
            let mut stream = Vec::new();

            for symbol in &symbols {
                // closed candles before the stream starts seed the RSI history
                let (closes, live) = generator.generate_session(
                    symbol,
                    scenario.into(),
                    config.signal.candle_history_depth,
                    candles,
                    interval,
                    start,
                );
                engine.seed_history(symbol, &closes);
                stream.extend(live);
            }
            stream.sort_by_key(|k| k.event_time);

            tracing::info!(
                symbols = symbols.len(),
                updates = stream.len(),
                ?scenario,
                "Generated synthetic market"
            );
            tokio::spawn(paper(stream, Arc::clone(&gateway), events_tx.clone()))
        }
    };
    drop(events_tx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = tokio::spawn(
        EventLoop::new(engine, dispatcher, &config.runtime).run(events_rx, shutdown_rx),
    );

    tokio::select! {
        result = finish_input(producer, activity) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl-C received");
        }
    }

    let _ = shutdown_tx.send(true);
    let engine = consumer.await.context("Event loop panicked")?;
    print_summary(&engine);

    Ok(())
}

/// Wait for the producer, then for the engine to work through what it queued
async fn finish_input(producer: JoinHandle<Result<()>>, activity: Activity) -> Result<()> {
    producer.await.context("Producer task panicked")??;
    tracing::info!(
        outstanding = activity.outstanding(),
        "Input exhausted, waiting for the engine to go idle"
    );
    activity.wait_idle().await;
    Ok(())
}

fn setup_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("klinebot=info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn replay(input: PathBuf, gateway: Arc<PaperGateway>, events: EventSender) -> Result<()> {
    let file = tokio::fs::File::open(&input)
        .await
        .with_context(|| format!("Failed to open {}", input.display()))?;
    let mut lines = BufReader::new(file).lines();

    let mut line_no = 0usize;
    let mut queued = 0usize;
    let mut skipped = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let decoded = match codec::decode(line) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "Skipping message");
                skipped += 1;
                continue;
            }
        };

        for event in decoded {
            if let MarketEvent::Kline(kline) = &event {
                gateway
                    .observe_price(&kline.symbol, kline.close, kline.event_time)
                    .await?;
            }
            events.publish_market(event).await?;
            queued += 1;
        }
    }

    tracing::info!(queued, skipped, "Replay input exhausted");
    Ok(())
}

async fn paper(
    stream: Vec<klinebot::models::KlineUpdate>,
    gateway: Arc<PaperGateway>,
    events: EventSender,
) -> Result<()> {
    for kline in stream {
        gateway
            .observe_price(&kline.symbol, kline.close, kline.event_time)
            .await?;
        let mark = mark_from_kline(&kline);
        events.publish_market(MarketEvent::Kline(kline)).await?;
        events.publish_market(MarketEvent::MarkPrice(vec![mark])).await?;
        // let the consumer keep pace with the simulated clock
        tokio::task::yield_now().await;
    }

    tracing::info!("Synthetic market exhausted");
    Ok(())
}

fn print_summary(engine: &DecisionEngine) {
    let ledger = engine.ledger();
    let stats = ledger.stats();

    println!("\n=== Session summary ===");
    println!("Trades:       {}", stats.trades);
    println!("Wins:         {}", stats.wins);
    println!("Losses:       {}", stats.losses);
    println!("Realized PnL: {}", stats.realized_pnl);

    let open = ledger.open_positions();
    if open.is_empty() {
        println!("Open positions: none");
    } else {
        println!("Open positions:");
        for position in open {
            println!(
                "  {} {:?} {} @ {}",
                position.symbol, position.side, position.quantity, position.entry_price
            );
        }
    }
}
