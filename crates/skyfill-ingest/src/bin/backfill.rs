//! Skyfill backfill: crawl every known server into a time-ordered log.
//!
//! # Phases
//!
//! 1. Discover servers (or take `--server`), list every account on each.
//! 2. Crawl all accounts into `backfill-unsorted.jsonl`, checkpointing to
//!    `seen-dids.json` so an interrupted run resumes where it left off.
//! 3. External-sort the log by timestamp into `backfill-sorted.jsonl`.
//!
//! # Usage
//!
//! ```bash
//! # Full run
//! skyfill-backfill
//!
//! # Resume only the sort after an interrupted run
//! skyfill-backfill --sort-only
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use skyfill_core::metrics::{init_metrics, set_running, start_metrics_server};
use skyfill_ingest::backfill::{
    BackfillLog, SORTED_LOG, SortConfig, UNSORTED_LOG, sort_backfill_log,
};
use skyfill_ingest::crawl::AccountRef;
use skyfill_ingest::discovery::{
    DEFAULT_SERVER_LIST_URL, feed_server_accounts, fetch_known_servers,
};
use skyfill_ingest::{
    CarDecoder, CheckpointStore, ClientSet, CrawlConfig, CrawlWorkerPool, RetryPolicy,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

/// Skyfill backfill.
#[derive(Parser, Debug)]
#[command(name = "skyfill-backfill")]
#[command(about = "Crawl every known server into a timestamp-sorted backfill log")]
#[command(version)]
struct Args {
    /// Servers to crawl instead of the discovered list (repeatable)
    #[arg(long)]
    server: Vec<String>,

    /// Where to discover servers from
    #[arg(long, env = "SERVER_LIST_URL", default_value = DEFAULT_SERVER_LIST_URL)]
    server_list_url: String,

    /// Skip servers whose address contains this (repeatable)
    #[arg(long)]
    skip_server: Vec<String>,

    /// Unsorted crawl log
    #[arg(long, default_value = UNSORTED_LOG)]
    unsorted: PathBuf,

    /// Sorted output
    #[arg(long, default_value = SORTED_LOG)]
    sorted: PathBuf,

    /// Checkpoint file of completed accounts
    #[arg(long, default_value = "seen-dids.json")]
    checkpoint: PathBuf,

    /// Seconds between checkpoint flushes
    #[arg(long, default_value = "30")]
    checkpoint_interval: u64,

    /// Maximum accounts crawled at once
    #[arg(long, env = "BACKFILL_CONCURRENCY", default_value = "16")]
    concurrency: usize,

    /// Maximum servers listed at once
    #[arg(long, default_value = "32")]
    list_concurrency: usize,

    /// Per-account deadline in seconds
    #[arg(long, env = "BACKFILL_PROCESSING_TIMEOUT", default_value = "300")]
    processing_timeout: u64,

    /// Only sort an existing unsorted log
    #[arg(long)]
    sort_only: bool,

    /// Megabytes of log lines per in-memory sort chunk
    #[arg(long, default_value = "256")]
    sort_chunk_mb: usize,

    /// Directory for sort chunk files (defaults to the system temp dir)
    #[arg(long)]
    tmp_dir: Option<PathBuf>,

    /// Seconds between throughput log lines
    #[arg(long, env = "LOGGING_INTERVAL", default_value = "10")]
    logging_interval: u64,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9092")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
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

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
        set_running("backfill", true);
    }

    if !args.sort_only {
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);
        ctrlc::set_handler(move || {
            tracing::info!("Shutdown signal received, stopping gracefully...");
            running_clone.store(false, Ordering::SeqCst);
        })
        .context("Failed to set Ctrl+C handler")?;

        crawl(&args, Arc::clone(&running)).await?;

        if !running.load(Ordering::SeqCst) {
            tracing::info!(
                "Crawl interrupted; rerun to resume, or use --sort-only to sort what was collected"
            );
            return Ok(());
        }
    }

    let config = SortConfig {
        max_chunk_bytes: args.sort_chunk_mb.max(1) * 1024 * 1024,
        tmp_dir: args.tmp_dir.clone(),
    };
    let (unsorted, sorted) = (args.unsorted.clone(), args.sorted.clone());
    let stats = tokio::task::spawn_blocking(move || sort_backfill_log(&unsorted, &sorted, &config))
        .await
        .context("Sort task panicked")?
        .with_context(|| format!("Failed to sort {}", args.unsorted.display()))?;

    if args.metrics_port > 0 {
        set_running("backfill", false);
    }

    tracing::info!(
        "Backfill done: {} records in {} ({} unreadable lines skipped)",
        stats.lines,
        args.sorted.display(),
        stats.skipped
    );
    Ok(())
}

async fn crawl(args: &Args, running: Arc<AtomicBool>) -> Result<()> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("skyfill/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let servers = if args.server.is_empty() {
        fetch_known_servers(&http, &args.server_list_url)
            .await
            .context("Failed to fetch server list")?
    } else {
        args.server.clone()
    };
    let servers: Vec<String> = servers
        .into_iter()
        .filter(|s| !args.skip_server.iter().any(|p| s.contains(p.as_str())))
        .collect();
    tracing::info!("Crawling {} servers", servers.len());

    let clients = Arc::new(ClientSet::new(http, RetryPolicy::backfill()));
    let log = Arc::new(
        BackfillLog::open(&args.unsorted)
            .with_context(|| format!("Failed to open {}", args.unsorted.display()))?,
    );
    let checkpoint = Arc::new(CheckpointStore::open(&args.checkpoint));

    let config = CrawlConfig {
        concurrency: args.concurrency,
        account_timeout: Duration::from_secs(args.processing_timeout),
        skip_servers: args.skip_server.clone(),
        skip_failed_accounts: true,
    };
    let pool = CrawlWorkerPool::new(
        config,
        Arc::clone(&clients) as _,
        Arc::new(CarDecoder),
        Arc::clone(&log) as _,
        Arc::clone(&checkpoint),
    )
    .with_running_flag(Arc::clone(&running));

    let flusher = checkpoint
        .spawn_periodic_flush(Duration::from_secs(args.checkpoint_interval), Arc::clone(&running));
    let reporter = pool
        .registry()
        .spawn_reporter(Duration::from_secs(args.logging_interval), Arc::clone(&running));

    let (tx, rx) = mpsc::channel(args.concurrency.max(1) * 4);
    let lister = tokio::spawn(list_accounts(
        Arc::clone(&clients),
        servers,
        args.list_concurrency,
        tx,
    ));

    let result = pool.run(rx).await;

    // Listing tasks may be parked on a server's rate limit
    lister.abort();
    reporter.abort();
    flusher.abort();
    log.flush().context("Failed to flush backfill log")?;
    checkpoint.flush().context("Final checkpoint flush failed")?;

    let summary = result?;
    tracing::info!(
        "Crawl finished: {} accounts completed, {} skipped, {} timed out, {} lines in {}",
        summary.accounts_completed,
        summary.accounts_skipped,
        summary.accounts_timed_out,
        log.lines(),
        log.path().display()
    );
    Ok(())
}

/// List accounts on every server, at most `concurrency` servers at a time.
///
/// A server that fails to list is logged and skipped.
async fn list_accounts(
    clients: Arc<ClientSet>,
    servers: Vec<String>,
    concurrency: usize,
    tx: mpsc::Sender<AccountRef>,
) -> u64 {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for server in servers {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let client = clients.client_for(&server);
        let tx = tx.clone();
        tasks.spawn(async move {
            let _permit = permit;
            match feed_server_accounts(&client, &tx).await {
                Ok(listed) => listed,
                Err(e) => {
                    tracing::warn!("Skipping server {}: {}", server, e);
                    0
                }
            }
        });
    }
    drop(tx);

    let mut total = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(listed) => total += listed,
            Err(e) => tracing::warn!("Listing task failed: {}", e),
        }
    }
    tracing::info!("Listed {} accounts", total);
    total
}
