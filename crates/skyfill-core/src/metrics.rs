//! Prometheus metrics helpers for skyfill.
//!
//! This module provides centralized metrics initialization and the metric
//! descriptions shared by the producer, consumer and backfill binaries.
//!
//! # Usage
//!
//! ```rust,ignore
//! use skyfill_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     // Initialize the Prometheus recorder
//!     let handle = init_metrics();
//!
//!     // Start the HTTP server for /metrics endpoint
//!     start_metrics_server(9091, handle).await.unwrap();
//!
//!     // Now use metrics anywhere in your code
//!     use metrics::{counter, gauge};
//!     counter!("my_counter").increment(1);
//!     gauge!("my_gauge").set(42.0);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! All skyfill metrics follow these conventions:
//! - Prefix: Component name (e.g., `crawl_`, `client_`, `consumer_`)
//! - Suffix: Unit or type (e.g., `_total`, `_bytes`, `_seconds`)
//! - Labels: Use sparingly to avoid cardinality explosion

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
/// Returns a handle that can be used with [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    // Register all metric descriptions upfront
    register_common_metrics();

    handle
}

/// Start the Prometheus metrics HTTP server.
///
/// Serves the `/metrics` endpoint on the specified port. The listener is
/// bound before returning so a port conflict surfaces to the caller; serving
/// happens on a background task.
///
/// # Arguments
///
/// * `port` - TCP port to listen on (e.g., 9091)
/// * `handle` - Prometheus handle from [`init_metrics`]
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for the metrics emitted by skyfill.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    // =========================================================================
    // Crawl Metrics
    // =========================================================================

    describe_gauge!(
        "skyfill_running",
        "1 while a skyfill process is running (label: process)"
    );

    describe_counter!(
        "crawl_accounts_total",
        "Accounts finished by the crawl pool (label: outcome)"
    );
    describe_counter!(
        "crawl_records_total",
        "Records decoded from repository snapshots"
    );
    describe_counter!(
        "crawl_records_invalid_total",
        "Records dropped because they failed to decode"
    );
    describe_counter!(
        "crawl_snapshot_bytes_total",
        "Bytes of repository snapshots fetched (label: type)"
    );
    describe_gauge!("crawl_in_flight", "Accounts currently being processed");
    describe_gauge!(
        "crawl_records_per_second",
        "Current crawl throughput (records/sec)"
    );
    describe_histogram!(
        "crawl_account_duration_seconds",
        "Time spent processing one account"
    );

    // =========================================================================
    // Repository Server Client Metrics
    // =========================================================================

    describe_counter!("client_requests_total", "Requests sent to repository servers");
    describe_counter!(
        "client_retries_total",
        "Requests retried after a transient failure"
    );
    describe_counter!(
        "client_ratelimit_waits_total",
        "Times a client paused to respect a server's rate limit"
    );

    // =========================================================================
    // Consumer Metrics
    // =========================================================================

    describe_counter!(
        "consumer_records_total",
        "Records accepted by the batch assembler"
    );
    describe_counter!("consumer_flushes_total", "Batches submitted to the index");
    describe_counter!(
        "consumer_flush_errors_total",
        "Batch submissions that failed (records lost for this run)"
    );
    describe_counter!(
        "consumer_protocol_errors_total",
        "Connections dropped because of an invalid message"
    );
    describe_gauge!(
        "consumer_pending_records",
        "Records accumulated but not yet flushed"
    );
    describe_histogram!(
        "consumer_flush_duration_seconds",
        "Time spent on one bulk index call"
    );

    // =========================================================================
    // Checkpoint Metrics
    // =========================================================================

    describe_counter!("checkpoint_flushes_total", "Checkpoint files written");
    describe_gauge!(
        "checkpoint_accounts_completed",
        "Accounts recorded as completed"
    );
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Add to a bytes counter with a type label.
///
/// # Example
///
/// ```rust,ignore
/// use skyfill_core::metrics::record_bytes;
///
/// record_bytes("crawl_snapshot_bytes_total", "car", 1024);
/// ```
pub fn record_bytes(metric_name: &'static str, byte_type: &'static str, bytes: u64) {
    metrics::counter!(metric_name, "type" => byte_type).increment(bytes);
}

/// Mark `process` as running (or stopped) on the `skyfill_running` gauge.
pub fn set_running(process: &'static str, running: bool) {
    metrics::gauge!("skyfill_running", "process" => process).set(if running { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    // Ensure metrics are initialized exactly once for all tests
    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = PrometheusBuilder::new().install_recorder();
            register_common_metrics();
        });
    }

    // =========================================================================
    // Helper function tests
    // =========================================================================

    #[test]
    fn test_record_bytes_does_not_panic() {
        ensure_metrics_init();
        // Should not panic even with zero bytes
        record_bytes("test_bytes_total", "test_type", 0);
        record_bytes("test_bytes_total", "test_type", 1000);
        record_bytes("test_bytes_total", "test_type", u64::MAX);
    }

    #[test]
    fn test_set_running_does_not_panic() {
        ensure_metrics_init();
        set_running("producer", true);
        set_running("producer", false);
    }

    // =========================================================================
    // Metric description registration
    // =========================================================================

    #[test]
    fn test_register_common_metrics_does_not_panic() {
        ensure_metrics_init();
        // This should be idempotent and not panic
        register_common_metrics();
        register_common_metrics();
    }
}
