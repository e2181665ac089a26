//! Per-collection batching in front of an [`IndexingSink`].
//!
//! # Flush Strategy
//!
//! Rows accumulate in one batch per collection. As soon as any single batch
//! reaches `batch_size`, *all* batches are swapped out under the lock and the
//! lock is released before the sink is called, so rows arriving during a
//! flush land in fresh batches instead of waiting.
//!
//! A failed flush is logged with the affected collections and its rows are
//! dropped. Re-crawling is idempotent, so lost rows are recovered by running
//! the crawl again rather than by re-queueing here.

use super::sink::{Batches, CommitRow, IndexingSink};
use parking_lot::Mutex;
use skyfill_core::CommitMessage;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Batching settings.
#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// Rows of one collection that trigger a flush.
    pub batch_size: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self { batch_size: 1000 }
    }
}

/// Statistics about the assembler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub rows_received: u64,
    pub rows_flushed: u64,
    pub rows_dropped: u64,
    pub flushes: u64,
    pub flush_errors: u64,
}

/// Accumulates rows per collection and flushes them to a sink.
pub struct BatchAssembler {
    sink: Arc<dyn IndexingSink>,
    config: AssemblerConfig,
    batches: Mutex<Batches>,
    rows_received: AtomicU64,
    rows_flushed: AtomicU64,
    rows_dropped: AtomicU64,
    flushes: AtomicU64,
    flush_errors: AtomicU64,
}

impl BatchAssembler {
    pub fn new(sink: Arc<dyn IndexingSink>, config: AssemblerConfig) -> Self {
        Self {
            sink,
            config: AssemblerConfig {
                batch_size: config.batch_size.max(1),
            },
            batches: Mutex::new(Batches::new()),
            rows_received: AtomicU64::new(0),
            rows_flushed: AtomicU64::new(0),
            rows_dropped: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            flush_errors: AtomicU64::new(0),
        }
    }

    /// Add one message, flushing everything if its batch is now full.
    pub async fn push(&self, message: CommitMessage) {
        let collection = message.collection.clone();
        let row = CommitRow::from_message(message);
        self.rows_received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("consumer_records_total").increment(1);

        let full = {
            let mut batches = self.batches.lock();
            let batch = batches.entry(collection).or_default();
            batch.push(row);
            if batch.len() >= self.config.batch_size {
                Some(std::mem::take(&mut *batches))
            } else {
                metrics::gauge!("consumer_pending_records")
                    .set(batches.values().map(Vec::len).sum::<usize>() as f64);
                None
            }
        };

        if let Some(snapshot) = full {
            self.submit(snapshot).await;
        }
    }

    /// Flush whatever is pending. Called at end of stream.
    pub async fn finish(&self) {
        let snapshot = std::mem::take(&mut *self.batches.lock());
        if !snapshot.is_empty() {
            self.submit(snapshot).await;
        }
    }

    /// Rows waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.batches.lock().values().map(Vec::len).sum()
    }

    pub fn stats(&self) -> AssemblerStats {
        AssemblerStats {
            rows_received: self.rows_received.load(Ordering::Relaxed),
            rows_flushed: self.rows_flushed.load(Ordering::Relaxed),
            rows_dropped: self.rows_dropped.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_errors: self.flush_errors.load(Ordering::Relaxed),
        }
    }

    /// Log records/s every `interval` until `running` is cleared.
    pub fn spawn_reporter(
        self: &Arc<Self>,
        interval: Duration,
        running: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let assembler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut last = assembler.stats().rows_received;
            let mut last_at = Instant::now();

            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let stats = assembler.stats();
                let elapsed = last_at.elapsed().as_secs_f64().max(f64::EPSILON);
                tracing::info!(
                    "{:.1} records/s ({} received, {} indexed, {} dropped, {} pending)",
                    (stats.rows_received - last) as f64 / elapsed,
                    stats.rows_received,
                    stats.rows_flushed,
                    stats.rows_dropped,
                    assembler.pending()
                );
                last = stats.rows_received;
                last_at = Instant::now();
            }
        })
    }

    async fn submit(&self, snapshot: Batches) {
        metrics::gauge!("consumer_pending_records").set(self.pending() as f64);

        let rows: usize = snapshot.values().map(Vec::len).sum();
        let mut collections: Vec<String> = snapshot.keys().cloned().collect();
        collections.sort();

        let started = Instant::now();
        let result = self.sink.index_bulk(snapshot).await;
        metrics::histogram!("consumer_flush_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        self.flushes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("consumer_flushes_total").increment(1);

        match result {
            Ok(()) => {
                self.rows_flushed.fetch_add(rows as u64, Ordering::Relaxed);
                tracing::debug!("Flushed {} rows across {:?}", rows, collections);
            }
            Err(e) => {
                self.flush_errors.fetch_add(1, Ordering::Relaxed);
                self.rows_dropped.fetch_add(rows as u64, Ordering::Relaxed);
                metrics::counter!("consumer_flush_errors_total").increment(1);
                tracing::error!(
                    "Flush of {} rows failed for collections {:?}, rows dropped: {}",
                    rows,
                    collections,
                    e
                );
            }
        }
    }
}
