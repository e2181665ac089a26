//! Skyfill consumer: index commit messages from producers into ClickHouse.
//!
//! Binds a Unix socket, accepts any number of producer connections and
//! batches their records per collection before bulk-inserting them.
//!
//! # Usage
//!
//! ```bash
//! skyfill-consumer --socket /tmp/skyfill.sock --clickhouse-url http://localhost:8123
//! ```
//!
//! On SIGINT / SIGTERM the listener stops accepting, open connections are
//! closed and pending rows are flushed before exit.

use anyhow::{Context, Result};
use clap::Parser;
use skyfill_core::metrics::{init_metrics, set_running, start_metrics_server};
use skyfill_ingest::consumer::{bind_unix, serve};
use skyfill_ingest::{AssemblerConfig, BatchAssembler, ClickHouseConfig, ClickHouseSink};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Skyfill consumer.
#[derive(Parser, Debug)]
#[command(name = "skyfill-consumer")]
#[command(about = "Index commit messages from skyfill producers into ClickHouse")]
#[command(version)]
struct Args {
    /// Unix socket to listen on
    #[arg(long, env = "CONSUMER_SOCKET", default_value = "/tmp/skyfill.sock")]
    socket: PathBuf,

    /// Rows of one collection that trigger a flush
    #[arg(long, env = "CONSUMER_BATCH_SIZE", default_value = "1000")]
    batch_size: usize,

    /// ClickHouse URL
    #[arg(long, env = "CLICKHOUSE_URL", default_value = "http://localhost:8123")]
    clickhouse_url: String,

    /// ClickHouse database name
    #[arg(long, env = "CLICKHOUSE_DATABASE", default_value = "skyfill")]
    clickhouse_db: String,

    /// ClickHouse table name
    #[arg(long, env = "CLICKHOUSE_TABLE", default_value = "records")]
    clickhouse_table: String,

    /// Seconds between throughput log lines
    #[arg(long, env = "LOGGING_INTERVAL", default_value = "10")]
    logging_interval: u64,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9091")]
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

    tracing::info!("Skyfill consumer starting...");

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
        set_running("consumer", true);
    }

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        running_clone.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let sink = ClickHouseSink::new(ClickHouseConfig {
        url: args.clickhouse_url.clone(),
        database: args.clickhouse_db.clone(),
        table: args.clickhouse_table.clone(),
    });
    match sink.health_check().await {
        Ok(true) => tracing::info!("ClickHouse reachable at {}", args.clickhouse_url),
        Ok(false) => tracing::warn!("ClickHouse health check returned unexpected result"),
        Err(e) => tracing::warn!("ClickHouse not reachable yet, flushes may fail: {}", e),
    }

    let assembler = Arc::new(BatchAssembler::new(
        Arc::new(sink),
        AssemblerConfig {
            batch_size: args.batch_size,
        },
    ));
    let reporter =
        assembler.spawn_reporter(Duration::from_secs(args.logging_interval), Arc::clone(&running));

    let listener = bind_unix(&args.socket)
        .with_context(|| format!("Failed to bind {}", args.socket.display()))?;
    serve(listener, Arc::clone(&assembler), Arc::clone(&running)).await?;

    reporter.abort();
    if let Err(e) = std::fs::remove_file(&args.socket) {
        tracing::debug!("Could not remove socket {}: {}", args.socket.display(), e);
    }

    if args.metrics_port > 0 {
        set_running("consumer", false);
    }

    let stats = assembler.stats();
    tracing::info!(
        "Consumer done: {} received, {} indexed, {} dropped in {} failed flushes",
        stats.rows_received,
        stats.rows_flushed,
        stats.rows_dropped,
        stats.flush_errors
    );
    Ok(())
}
