//! Crawl progress registry.
//!
//! Tracks which accounts are in flight and what each one is doing, plus
//! running totals. The producer logs a [`RegistrySnapshot`] on demand
//! (`SIGUSR1`) and a records/s line on a fixed interval.

use super::AccountRef;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// How an account's processing ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountOutcome {
    Completed,
    AlreadyDone,
    Skipped,
    TimedOut,
}

impl AccountOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountOutcome::Completed => "completed",
            AccountOutcome::AlreadyDone => "already_done",
            AccountOutcome::Skipped => "skipped",
            AccountOutcome::TimedOut => "timed_out",
        }
    }
}

/// One in-flight account.
#[derive(Debug, Clone)]
pub struct ActiveTask {
    pub did: String,
    pub server: String,
    pub started: Instant,
    pub records: u64,
    /// URI of the record most recently handed to the output.
    pub current_uri: Option<String>,
}

/// Totals and the in-flight table at one instant.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub queue_depth: usize,
    pub in_flight: Vec<(u64, ActiveTask)>,
    pub records_total: u64,
    pub records_invalid: u64,
    pub accounts_completed: u64,
    pub accounts_skipped: u64,
    pub accounts_timed_out: u64,
}

/// Shared crawl progress state.
#[derive(Default)]
pub struct CrawlRegistry {
    next_id: AtomicU64,
    active: Mutex<BTreeMap<u64, ActiveTask>>,
    queue_depth: AtomicUsize,
    records_total: AtomicU64,
    records_invalid: AtomicU64,
    accounts_completed: AtomicU64,
    accounts_skipped: AtomicU64,
    accounts_timed_out: AtomicU64,
}

impl CrawlRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an account as in flight. It is removed when the handle drops.
    pub fn begin(self: &Arc<Self>, account: &AccountRef) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let in_flight = {
            let mut active = self.active.lock();
            active.insert(
                id,
                ActiveTask {
                    did: account.did.clone(),
                    server: account.server.clone(),
                    started: Instant::now(),
                    records: 0,
                    current_uri: None,
                },
            );
            active.len()
        };
        metrics::gauge!("crawl_in_flight").set(in_flight as f64);
        TaskHandle {
            registry: Arc::clone(self),
            id,
        }
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.records_invalid.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("crawl_records_invalid_total").increment(1);
    }

    pub fn finish(&self, outcome: AccountOutcome) {
        let counter = match outcome {
            AccountOutcome::Completed => &self.accounts_completed,
            AccountOutcome::AlreadyDone | AccountOutcome::Skipped => &self.accounts_skipped,
            AccountOutcome::TimedOut => &self.accounts_timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("crawl_accounts_total", "outcome" => outcome.as_str()).increment(1);
    }

    pub fn records_total(&self) -> u64 {
        self.records_total.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.active.lock().len()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let in_flight = self
            .active
            .lock()
            .iter()
            .map(|(id, task)| (*id, task.clone()))
            .collect();
        RegistrySnapshot {
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            in_flight,
            records_total: self.records_total.load(Ordering::Relaxed),
            records_invalid: self.records_invalid.load(Ordering::Relaxed),
            accounts_completed: self.accounts_completed.load(Ordering::Relaxed),
            accounts_skipped: self.accounts_skipped.load(Ordering::Relaxed),
            accounts_timed_out: self.accounts_timed_out.load(Ordering::Relaxed),
        }
    }

    /// Log the snapshot, one line per in-flight account.
    pub fn log_snapshot(&self) {
        let snap = self.snapshot();
        tracing::info!(
            "Queue: {} waiting, {} in flight, {} records ({} invalid), accounts: {} done / {} skipped / {} timed out",
            snap.queue_depth,
            snap.in_flight.len(),
            snap.records_total,
            snap.records_invalid,
            snap.accounts_completed,
            snap.accounts_skipped,
            snap.accounts_timed_out
        );
        for (id, task) in &snap.in_flight {
            tracing::info!(
                "  [{}] {} @ {}: {} records in {:.1}s, at {}",
                id,
                task.did,
                task.server,
                task.records,
                task.started.elapsed().as_secs_f64(),
                task.current_uri.as_deref().unwrap_or("-")
            );
        }
    }

    /// Log records/s every `interval` until `running` is cleared.
    pub fn spawn_reporter(
        self: &Arc<Self>,
        interval: Duration,
        running: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut last = registry.records_total();
            let mut last_at = Instant::now();

            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let total = registry.records_total();
                let elapsed = last_at.elapsed().as_secs_f64().max(f64::EPSILON);
                let rate = (total - last) as f64 / elapsed;
                metrics::gauge!("crawl_records_per_second").set(rate);
                tracing::info!(
                    "{:.1} records/s ({} total, {} accounts in flight)",
                    rate,
                    total,
                    registry.in_flight()
                );
                last = total;
                last_at = Instant::now();
            }
        })
    }

    fn end(&self, id: u64) {
        let in_flight = {
            let mut active = self.active.lock();
            active.remove(&id);
            active.len()
        };
        metrics::gauge!("crawl_in_flight").set(in_flight as f64);
    }
}

/// Registration of one in-flight account.
pub struct TaskHandle {
    registry: Arc<CrawlRegistry>,
    id: u64,
}

impl TaskHandle {
    /// Note that a record was handed to the output.
    pub fn record_written(&self, uri: &str) {
        if let Some(task) = self.registry.active.lock().get_mut(&self.id) {
            task.records += 1;
            task.current_uri = Some(uri.to_string());
        }
        self.registry.records_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("crawl_records_total").increment(1);
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.registry.end(self.id);
    }
}
