//! Skyfill producer: crawl accounts from a DID file into consumer sockets.
//!
//! Reads `["did", "server"]` lines, fetches every account's repository,
//! decodes its records and streams them as commit messages to one or three
//! consumer sockets, sharded by collection.
//!
//! # Usage
//!
//! ```bash
//! # One consumer
//! skyfill-producer dids.jsonl --socket /tmp/skyfill.sock
//!
//! # Three sharded consumers, lines 0..500000 only
//! skyfill-producer dids.jsonl \
//!     --socket /tmp/skyfill-0.sock,/tmp/skyfill-1.sock,/tmp/skyfill-2.sock \
//!     --starting-line 0 --ending-line 500000
//! ```
//!
//! # Signals
//!
//! - SIGINT / SIGTERM: stop admitting accounts, let in-flight accounts
//!   finish, flush the checkpoint and exit.
//! - SIGUSR1: log the in-flight account table.

use anyhow::{Context, Result};
use clap::Parser;
use skyfill_core::metrics::{init_metrics, set_running, start_metrics_server};
use skyfill_ingest::crawl::{LineRange, feed_account_file};
use skyfill_ingest::{
    CarDecoder, CheckpointStore, ClientSet, ConnectionPool, CrawlConfig, CrawlWorkerPool,
    RetryPolicy, ShardRouter, ShardedOutput,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Skyfill producer.
#[derive(Parser, Debug)]
#[command(name = "skyfill-producer")]
#[command(about = "Crawl repositories listed in a DID file into consumer sockets")]
#[command(version)]
struct Args {
    /// File with one `["did", "server"]` JSON array per line
    did_file: PathBuf,

    /// Consumer socket paths (comma-separated, exactly 1 or 3)
    #[arg(long, env = "PRODUCER_SOCKETS", value_delimiter = ',', required = true)]
    socket: Vec<PathBuf>,

    /// Maximum accounts processed at once
    #[arg(long, env = "PRODUCER_CONCURRENCY", default_value = "16")]
    concurrency: usize,

    /// Per-account deadline in seconds
    #[arg(long, env = "PRODUCER_PROCESSING_TIMEOUT", default_value = "60")]
    processing_timeout: u64,

    /// First input line to process (0-based, inclusive)
    #[arg(long)]
    starting_line: Option<u64>,

    /// Input line to stop at (0-based, exclusive)
    #[arg(long)]
    ending_line: Option<u64>,

    /// Checkpoint file of completed accounts
    #[arg(long, env = "PRODUCER_CHECKPOINT", default_value = "producer-checkpoint.json")]
    checkpoint: PathBuf,

    /// Seconds between checkpoint flushes
    #[arg(long, default_value = "30")]
    checkpoint_interval: u64,

    /// Skip servers whose address contains this (repeatable)
    #[arg(long)]
    skip_server: Vec<String>,

    /// Seconds between throughput log lines
    #[arg(long, env = "LOGGING_INTERVAL", default_value = "10")]
    logging_interval: u64,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9090")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before parsing so it can supply env-backed options
    if let Err(e) = dotenvy::dotenv()
        && !e.not_found()
    {
        return Err(e).context("Failed to load .env");
    }

    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("skyfill_ingest=debug".parse()?),
        )
        .init();

    tracing::info!("Skyfill producer starting...");

    let router = ShardRouter::new(args.socket.len())?;

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
        set_running("producer", true);
    }

    // Set up graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        running_clone.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    // Every worker holds at most one connection per shard at a time
    let mut pools = Vec::with_capacity(args.socket.len());
    for path in &args.socket {
        let pool = ConnectionPool::connect_unix(path, args.concurrency.max(1))
            .await
            .with_context(|| format!("Failed to connect to consumer at {}", path.display()))?;
        pools.push(pool);
    }
    let output = Arc::new(ShardedOutput::new(router, pools)?);

    let checkpoint = Arc::new(CheckpointStore::open(&args.checkpoint));

    let http = reqwest::Client::builder()
        .user_agent(concat!("skyfill/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;
    let fetcher = Arc::new(ClientSet::new(http, RetryPolicy::default()));

    let config = CrawlConfig {
        concurrency: args.concurrency,
        account_timeout: Duration::from_secs(args.processing_timeout),
        skip_servers: args.skip_server.clone(),
        skip_failed_accounts: false,
    };
    let pool = CrawlWorkerPool::new(
        config,
        fetcher,
        Arc::new(CarDecoder),
        output,
        Arc::clone(&checkpoint),
    )
    .with_running_flag(Arc::clone(&running));

    let flusher =
        checkpoint.spawn_periodic_flush(Duration::from_secs(args.checkpoint_interval), Arc::clone(&running));
    let reporter = pool
        .registry()
        .spawn_reporter(Duration::from_secs(args.logging_interval), Arc::clone(&running));
    spawn_snapshot_on_sigusr1(&pool)?;

    let (tx, rx) = mpsc::channel(args.concurrency.max(1) * 4);
    let range = LineRange {
        start: args.starting_line,
        end: args.ending_line,
    };
    let did_file = args.did_file.clone();
    let feeder = tokio::spawn(async move { feed_account_file(&did_file, range, tx).await });

    let result = pool.run(rx).await;

    running.store(false, Ordering::SeqCst);
    reporter.abort();
    flusher.abort();
    checkpoint.flush().context("Final checkpoint flush failed")?;

    // The pool dropped its receiver, so the feeder stops at its next send
    feeder
        .await
        .context("DID file reader panicked")?
        .with_context(|| format!("Failed to read {}", args.did_file.display()))?;

    if args.metrics_port > 0 {
        set_running("producer", false);
    }

    let summary = result?;
    tracing::info!(
        "Producer done: {} accounts completed, {} skipped, {} timed out",
        summary.accounts_completed,
        summary.accounts_skipped,
        summary.accounts_timed_out
    );
    Ok(())
}

/// Log the in-flight table whenever SIGUSR1 arrives.
fn spawn_snapshot_on_sigusr1(pool: &CrawlWorkerPool) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut usr1 = signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;
    let registry = Arc::clone(pool.registry());
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            registry.log_snapshot();
        }
    });
    Ok(())
}
