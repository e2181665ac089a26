//! Bounded-concurrency account crawler.

use super::output::CommitOutput;
use super::registry::{AccountOutcome, CrawlRegistry, TaskHandle};
use super::{AccountRef, CrawlConfig};
use crate::checkpoint::CheckpointStore;
use crate::client::RepoFetcher;
use crate::repo::SnapshotDecoder;
use crate::{Disposition, Error, Result};
use chrono::{DateTime, Utc};
use skyfill_core::{AtUri, CommitMessage, canonical_timestamp};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Totals for one [`CrawlWorkerPool::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    pub accounts_admitted: u64,
    pub accounts_completed: u64,
    pub accounts_already_done: u64,
    pub accounts_skipped: u64,
    pub accounts_timed_out: u64,
}

impl CrawlSummary {
    fn count(&mut self, outcome: AccountOutcome) {
        match outcome {
            AccountOutcome::Completed => self.accounts_completed += 1,
            AccountOutcome::AlreadyDone => self.accounts_already_done += 1,
            AccountOutcome::Skipped => self.accounts_skipped += 1,
            AccountOutcome::TimedOut => self.accounts_timed_out += 1,
        }
    }
}

/// Drives per-account processing with at most `concurrency` accounts in
/// flight.
pub struct CrawlWorkerPool {
    worker: Arc<Worker>,
    registry: Arc<CrawlRegistry>,
    running: Arc<AtomicBool>,
    concurrency: usize,
}

struct Worker {
    config: CrawlConfig,
    fetcher: Arc<dyn RepoFetcher>,
    decoder: Arc<dyn SnapshotDecoder>,
    output: Arc<dyn CommitOutput>,
    checkpoint: Arc<CheckpointStore>,
    registry: Arc<CrawlRegistry>,
}

impl CrawlWorkerPool {
    pub fn new(
        config: CrawlConfig,
        fetcher: Arc<dyn RepoFetcher>,
        decoder: Arc<dyn SnapshotDecoder>,
        output: Arc<dyn CommitOutput>,
        checkpoint: Arc<CheckpointStore>,
    ) -> Self {
        let registry = CrawlRegistry::new();
        let concurrency = config.concurrency.max(1);
        Self {
            worker: Arc::new(Worker {
                config,
                fetcher,
                decoder,
                output,
                checkpoint,
                registry: Arc::clone(&registry),
            }),
            registry,
            running: Arc::new(AtomicBool::new(true)),
            concurrency,
        }
    }

    /// Use an externally owned shutdown flag (e.g. the Ctrl+C handler's).
    pub fn with_running_flag(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = running;
        self
    }

    pub fn registry(&self) -> &Arc<CrawlRegistry> {
        &self.registry
    }

    /// Crawl every account received on `accounts`.
    ///
    /// Returns when the input is exhausted and all admitted accounts have
    /// finished, or early when the running flag is cleared. A fatal error in
    /// any account aborts the remaining tasks and is returned.
    pub async fn run(&self, mut accounts: mpsc::Receiver<AccountRef>) -> Result<CrawlSummary> {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<Result<AccountOutcome>> = JoinSet::new();
        let mut summary = CrawlSummary::default();

        tracing::info!("Crawl starting with concurrency {}", self.concurrency);

        loop {
            if !self.running.load(Ordering::SeqCst) {
                tracing::info!("Shutdown requested, no longer admitting accounts");
                break;
            }

            // Wait for a free slot before pulling the next account so that at
            // most `concurrency` accounts are ever mid-processing.
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|e| Error::Task(e.to_string()))?;

            while let Some(joined) = tasks.try_join_next() {
                summary.count(flatten(joined)?);
            }

            self.registry.set_queue_depth(accounts.len());
            let Some(account) = accounts.recv().await else {
                break;
            };

            if let Some(pattern) = self.worker.skipped_by(&account.server) {
                tracing::debug!(
                    "Skipping {} on {} (matches {})",
                    account.did,
                    account.server,
                    pattern
                );
                continue;
            }

            summary.accounts_admitted += 1;
            let worker = Arc::clone(&self.worker);
            tasks.spawn(async move {
                let _permit = permit;
                worker.process(account).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            summary.count(flatten(joined)?);
        }

        tracing::info!(
            "Crawl finished: {} admitted, {} completed, {} already done, {} skipped, {} timed out",
            summary.accounts_admitted,
            summary.accounts_completed,
            summary.accounts_already_done,
            summary.accounts_skipped,
            summary.accounts_timed_out
        );
        Ok(summary)
    }
}

fn flatten(
    joined: std::result::Result<Result<AccountOutcome>, tokio::task::JoinError>,
) -> Result<AccountOutcome> {
    joined.map_err(|e| Error::Task(e.to_string()))?
}

impl Worker {
    fn skipped_by(&self, server: &str) -> Option<&str> {
        self.config
            .skip_servers
            .iter()
            .find(|pattern| server.contains(pattern.as_str()))
            .map(String::as_str)
    }

    async fn process(&self, account: AccountRef) -> Result<AccountOutcome> {
        if self.checkpoint.is_completed(&account.server, &account.did) {
            self.registry.finish(AccountOutcome::AlreadyDone);
            return Ok(AccountOutcome::AlreadyDone);
        }

        let task = self.registry.begin(&account);
        let started_at = Instant::now();
        let deadline = started_at + self.config.account_timeout;
        let now = Utc::now();

        let result = self.crawl_account(&account, now, deadline, &task).await;

        metrics::histogram!("crawl_account_duration_seconds")
            .record(started_at.elapsed().as_secs_f64());

        let outcome = match result {
            Ok(records) => {
                tracing::debug!(
                    "Crawled {} on {}: {} records",
                    account.did,
                    account.server,
                    records
                );
                self.checkpoint.mark_completed(&account.server, &account.did);
                AccountOutcome::Completed
            }
            Err(Error::Timeout(after)) => {
                tracing::warn!(
                    "Timed out after {:?} crawling {} on {}",
                    after,
                    account.did,
                    account.server
                );
                AccountOutcome::TimedOut
            }
            Err(e) => match e.disposition() {
                Disposition::Terminal => {
                    tracing::info!("Skipping {} on {}: {}", account.did, account.server, e);
                    self.checkpoint.mark_completed(&account.server, &account.did);
                    AccountOutcome::Skipped
                }
                Disposition::Unreachable | Disposition::Malformed => {
                    tracing::warn!("Skipping {} on {}: {}", account.did, account.server, e);
                    AccountOutcome::Skipped
                }
                Disposition::Retryable | Disposition::Fatal
                    if self.config.skip_failed_accounts && e.is_remote() =>
                {
                    tracing::warn!("Skipping repo {} on {}: {}", account.did, account.server, e);
                    AccountOutcome::Skipped
                }
                Disposition::Retryable | Disposition::Fatal => {
                    tracing::error!(
                        "Fatal error crawling {} on {}: {}",
                        account.did,
                        account.server,
                        e
                    );
                    return Err(e);
                }
            },
        };

        self.registry.finish(outcome);
        Ok(outcome)
    }

    /// Fetch, decode and deliver one account's records in key order.
    ///
    /// The fetch is cancelled at `deadline`. Deliveries are not: the deadline
    /// is checked between records so a line is never abandoned half-written
    /// on a pooled connection.
    async fn crawl_account(
        &self,
        account: &AccountRef,
        now: DateTime<Utc>,
        deadline: Instant,
        task: &TaskHandle,
    ) -> Result<u64> {
        let snapshot = tokio::time::timeout_at(
            deadline,
            self.fetcher.fetch_repo(&account.server, &account.did),
        )
        .await
        .map_err(|_| Error::Timeout(self.config.account_timeout))??;
        let records = self.decoder.decode(snapshot)?;

        let mut delivered = 0u64;
        for item in records {
            if Instant::now() >= deadline {
                return Err(Error::Timeout(self.config.account_timeout));
            }
            let record = match item {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(
                        "Dropping undecodable record from {} on {}: {}",
                        account.did,
                        account.server,
                        e
                    );
                    self.registry.record_invalid();
                    continue;
                }
            };

            let uri = AtUri::new(account.did.as_str(), record.collection.as_str(), record.rkey.as_str());
            let (timestamp, _) = canonical_timestamp(&record.record, &record.rkey, now);
            let message = CommitMessage {
                collection: record.collection,
                uri,
                cid: record.cid,
                timestamp,
                record: record.record,
            };

            self.output.deliver(&message).await?;
            task.record_written(&message.uri.to_string());
            delivered += 1;
        }
        self.output.sync().await?;
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::BackfillLog;
    use crate::crawl::ShardedOutput;
    use crate::repo::{RecordIter, RepoRecord};
    use crate::transport::{ConnectionPool, PoolStats, ShardRouter};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, DuplexStream, duplex};

    const CID: &str = "bafyreidfayvfuwqa7qlnopdjiqrxzs6blmoeu4rujcjtnci5beludirz2a";

    /// Serves canned snapshots keyed by DID. The "snapshot" is just the DID.
    #[derive(Default)]
    struct StubFetcher {
        calls: AtomicUsize,
        delay: Option<Duration>,
        fail: HashMap<String, fn() -> Error>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl RepoFetcher for StubFetcher {
        async fn fetch_repo(&self, _server: &str, did: &str) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match self.fail.get(did) {
                Some(make) => Err(make()),
                None => Ok(Bytes::from(did.to_string())),
            }
        }
    }

    /// Every snapshot holds the same records.
    struct StubDecoder {
        records: Vec<(String, String, serde_json::Value)>,
    }

    impl SnapshotDecoder for StubDecoder {
        fn decode(&self, _snapshot: Bytes) -> Result<RecordIter> {
            let records: Vec<Result<RepoRecord>> = self
                .records
                .iter()
                .map(|(collection, rkey, record)| {
                    Ok(RepoRecord {
                        collection: collection.clone(),
                        rkey: rkey.clone(),
                        cid: CID.parse().unwrap(),
                        record: record.clone(),
                    })
                })
                .collect();
            Ok(Box::new(records.into_iter()))
        }
    }

    /// Collects delivered messages in memory.
    #[derive(Default)]
    struct MemoryOutput {
        messages: Mutex<Vec<CommitMessage>>,
    }

    #[async_trait]
    impl CommitOutput for MemoryOutput {
        async fn deliver(&self, message: &CommitMessage) -> Result<()> {
            self.messages.lock().push(message.clone());
            Ok(())
        }
    }

    fn post_decoder() -> Arc<StubDecoder> {
        Arc::new(StubDecoder {
            records: vec![(
                "app.bsky.feed.post".to_string(),
                "k1".to_string(),
                serde_json::json!({ "createdAt": "2020-01-01T00:00:00Z", "text": "hi" }),
            )],
        })
    }

    fn config(concurrency: usize) -> CrawlConfig {
        CrawlConfig {
            concurrency,
            account_timeout: Duration::from_secs(5),
            skip_servers: Vec::new(),
            skip_failed_accounts: false,
        }
    }

    async fn feed(accounts: Vec<AccountRef>) -> mpsc::Receiver<AccountRef> {
        let (tx, rx) = mpsc::channel(accounts.len().max(1));
        for account in accounts {
            tx.send(account).await.unwrap();
        }
        rx
    }

    fn checkpoint(dir: &TempDir) -> Arc<CheckpointStore> {
        Arc::new(CheckpointStore::open(dir.path().join("seen-dids.json")))
    }

    #[tokio::test]
    async fn test_single_post_delivered_on_post_shard() {
        let dir = TempDir::new().unwrap();
        let (ours, theirs): (Vec<DuplexStream>, Vec<DuplexStream>) =
            (0..3).map(|_| duplex(64 * 1024)).unzip();
        let pools = ours
            .into_iter()
            .enumerate()
            .map(|(i, conn)| ConnectionPool::from_connections(format!("shard-{i}"), vec![conn]))
            .collect();
        let output = ShardedOutput::new(ShardRouter::new(3).unwrap(), pools).unwrap();

        let pool = CrawlWorkerPool::new(
            config(1),
            Arc::new(StubFetcher::default()),
            post_decoder(),
            Arc::new(output),
            checkpoint(&dir),
        );
        let summary = pool
            .run(feed(vec![AccountRef::new("acct1", "serverA")]).await)
            .await
            .unwrap();
        assert_eq!(summary.accounts_completed, 1);
        drop(pool);

        let mut peers = theirs.into_iter();
        let shard0 = peers.next().unwrap();
        let mut lines = BufReader::new(shard0).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let message = CommitMessage::parse_line(&line).unwrap();
        assert_eq!(message.collection, "app.bsky.feed.post");
        assert_eq!(message.uri.to_string(), "at://acct1/app.bsky.feed.post/k1");
        assert_eq!(
            skyfill_core::format_timestamp(&message.timestamp),
            "2020-01-01T00:00:00Z"
        );
        // The pool (and so the writer side) is gone: no second message.
        assert!(lines.next_line().await.unwrap().is_none());

        for other in peers {
            let mut lines = BufReader::new(other).lines();
            assert!(lines.next_line().await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_checkpointed_accounts_not_fetched() {
        let dir = TempDir::new().unwrap();
        let store = checkpoint(&dir);
        store.mark_completed("serverA", "acct1");

        let fetcher = Arc::new(StubFetcher::default());
        let output = Arc::new(MemoryOutput::default());
        let pool = CrawlWorkerPool::new(
            config(2),
            Arc::clone(&fetcher) as Arc<dyn RepoFetcher>,
            post_decoder(),
            Arc::clone(&output) as Arc<dyn CommitOutput>,
            Arc::clone(&store),
        );

        let summary = pool
            .run(
                feed(vec![
                    AccountRef::new("acct1", "serverA"),
                    AccountRef::new("acct2", "serverA"),
                ])
                .await,
            )
            .await
            .unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.accounts_already_done, 1);
        assert_eq!(summary.accounts_completed, 1);
        assert!(store.is_completed("serverA", "acct2"));
        assert_eq!(output.messages.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_bound_respected() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(StubFetcher {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let pool = CrawlWorkerPool::new(
            config(3),
            Arc::clone(&fetcher) as Arc<dyn RepoFetcher>,
            post_decoder(),
            Arc::new(MemoryOutput::default()),
            checkpoint(&dir),
        );

        let accounts = (0..12)
            .map(|i| AccountRef::new(format!("acct{i}"), "serverA"))
            .collect();
        let summary = pool.run(feed(accounts).await).await.unwrap();

        assert_eq!(summary.accounts_completed, 12);
        assert!(fetcher.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_terminal_and_unreachable_accounts_skipped() {
        let dir = TempDir::new().unwrap();
        let store = checkpoint(&dir);
        let mut fail: HashMap<String, fn() -> Error> = HashMap::new();
        fail.insert("gone".to_string(), || Error::Xrpc {
            server: "serverA".to_string(),
            status: 400,
            kind: Some("RepoDeactivated".to_string()),
            message: None,
        });
        fail.insert("garbled".to_string(), || Error::Decode("bad CAR".to_string()));

        let pool = CrawlWorkerPool::new(
            config(2),
            Arc::new(StubFetcher {
                fail,
                ..Default::default()
            }),
            post_decoder(),
            Arc::new(MemoryOutput::default()),
            Arc::clone(&store),
        );

        let summary = pool
            .run(
                feed(vec![
                    AccountRef::new("gone", "serverA"),
                    AccountRef::new("garbled", "serverA"),
                    AccountRef::new("fine", "serverA"),
                ])
                .await,
            )
            .await
            .unwrap();

        assert_eq!(summary.accounts_skipped, 2);
        assert_eq!(summary.accounts_completed, 1);
        // Terminal states are remembered; malformed data is retried next run.
        assert!(store.is_completed("serverA", "gone"));
        assert!(!store.is_completed("serverA", "garbled"));
    }

    #[tokio::test]
    async fn test_fatal_error_fails_the_pool() {
        let dir = TempDir::new().unwrap();
        let mut fail: HashMap<String, fn() -> Error> = HashMap::new();
        fail.insert("acct1".to_string(), || Error::Xrpc {
            server: "serverA".to_string(),
            status: 401,
            kind: Some("AuthRequired".to_string()),
            message: None,
        });

        let pool = CrawlWorkerPool::new(
            config(1),
            Arc::new(StubFetcher {
                fail,
                ..Default::default()
            }),
            post_decoder(),
            Arc::new(MemoryOutput::default()),
            checkpoint(&dir),
        );

        let result = pool
            .run(feed(vec![AccountRef::new("acct1", "serverA")]).await)
            .await;
        assert!(matches!(result, Err(Error::Xrpc { status: 401, .. })));
    }

    #[tokio::test]
    async fn test_internal_server_error_skipped() {
        let dir = TempDir::new().unwrap();
        let store = checkpoint(&dir);
        let mut fail: HashMap<String, fn() -> Error> = HashMap::new();
        fail.insert("broken".to_string(), || Error::Xrpc {
            server: "serverA".to_string(),
            status: 500,
            kind: None,
            message: None,
        });

        let pool = CrawlWorkerPool::new(
            config(1),
            Arc::new(StubFetcher {
                fail,
                ..Default::default()
            }),
            post_decoder(),
            Arc::new(MemoryOutput::default()),
            Arc::clone(&store),
        );

        let summary = pool
            .run(
                feed(vec![
                    AccountRef::new("broken", "serverA"),
                    AccountRef::new("fine", "serverA"),
                ])
                .await,
            )
            .await
            .unwrap();
        assert_eq!(summary.accounts_skipped, 1);
        assert_eq!(summary.accounts_completed, 1);
        assert!(store.is_completed("serverA", "broken"));
    }

    #[tokio::test]
    async fn test_skip_failed_accounts_keeps_crawling() {
        let dir = TempDir::new().unwrap();
        let store = checkpoint(&dir);
        let mut fail: HashMap<String, fn() -> Error> = HashMap::new();
        fail.insert("acct1".to_string(), || Error::Xrpc {
            server: "serverA".to_string(),
            status: 401,
            kind: Some("AuthRequired".to_string()),
            message: None,
        });

        let pool = CrawlWorkerPool::new(
            CrawlConfig {
                skip_failed_accounts: true,
                ..config(1)
            },
            Arc::new(StubFetcher {
                fail,
                ..Default::default()
            }),
            post_decoder(),
            Arc::new(MemoryOutput::default()),
            Arc::clone(&store),
        );

        let summary = pool
            .run(
                feed(vec![
                    AccountRef::new("acct1", "serverA"),
                    AccountRef::new("acct2", "serverA"),
                ])
                .await,
            )
            .await
            .unwrap();
        assert_eq!(summary.accounts_skipped, 1);
        assert_eq!(summary.accounts_completed, 1);
        // Retried on the next run
        assert!(!store.is_completed("serverA", "acct1"));
    }

    #[tokio::test]
    async fn test_timeout_during_slow_writes_keeps_connections() {
        let dir = TempDir::new().unwrap();
        let (ours, theirs) = duplex(8);
        let conns = ConnectionPool::from_connections("shard-0", vec![ours]);
        let output = ShardedOutput::new(ShardRouter::new(1).unwrap(), vec![Arc::clone(&conns)])
            .unwrap();

        // A consumer that drains a few bytes at a time, so every line takes
        // far longer to write than the account deadline.
        let reader = tokio::spawn(async move {
            let mut theirs = theirs;
            let mut buf = [0u8; 8];
            let mut lines = 0usize;
            loop {
                tokio::time::sleep(Duration::from_millis(2)).await;
                match theirs.read(&mut buf).await {
                    Ok(0) | Err(_) => break lines,
                    Ok(n) => lines += buf[..n].iter().filter(|&&b| b == b'\n').count(),
                }
            }
        });

        let decoder = Arc::new(StubDecoder {
            records: vec![
                (
                    "app.bsky.feed.post".to_string(),
                    "k1".to_string(),
                    serde_json::json!({ "createdAt": "2020-01-01T00:00:00Z", "text": "first" }),
                ),
                (
                    "app.bsky.feed.post".to_string(),
                    "k2".to_string(),
                    serde_json::json!({ "createdAt": "2020-01-01T00:00:01Z", "text": "second" }),
                ),
            ],
        });
        let pool = CrawlWorkerPool::new(
            CrawlConfig {
                account_timeout: Duration::from_millis(20),
                ..config(1)
            },
            Arc::new(StubFetcher::default()),
            decoder,
            Arc::new(output),
            checkpoint(&dir),
        );

        let summary = pool
            .run(
                feed(vec![
                    AccountRef::new("acct1", "serverA"),
                    AccountRef::new("acct2", "serverA"),
                    AccountRef::new("acct3", "serverA"),
                ])
                .await,
            )
            .await
            .unwrap();

        assert_eq!(summary.accounts_timed_out, 3);
        assert_eq!(
            conns.stats(),
            PoolStats {
                size: 1,
                idle: 1,
                active: 0,
                lost: 0,
            }
        );

        // Each account finished its first line before giving up on the rest
        drop(pool);
        drop(conns);
        assert_eq!(reader.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_backfill_log_written_before_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = checkpoint(&dir);
        let path = dir.path().join("backfill-unsorted.jsonl");
        let log = Arc::new(BackfillLog::open(&path).unwrap());

        let pool = CrawlWorkerPool::new(
            config(1),
            Arc::new(StubFetcher::default()),
            post_decoder(),
            Arc::clone(&log) as Arc<dyn CommitOutput>,
            Arc::clone(&store),
        );
        pool.run(feed(vec![AccountRef::new("acct1", "serverA")]).await)
            .await
            .unwrap();
        store.flush().unwrap();

        // No explicit log flush: a crash here must not lose checkpointed records
        assert!(store.is_completed("serverA", "acct1"));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("at://acct1/app.bsky.feed.post/k1"));
    }

    #[tokio::test]
    async fn test_timeout_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let store = checkpoint(&dir);
        let pool = CrawlWorkerPool::new(
            CrawlConfig {
                account_timeout: Duration::from_millis(10),
                ..config(2)
            },
            Arc::new(StubFetcher {
                delay: Some(Duration::from_secs(5)),
                ..Default::default()
            }),
            post_decoder(),
            Arc::new(MemoryOutput::default()),
            Arc::clone(&store),
        );

        let summary = pool
            .run(feed(vec![AccountRef::new("slow", "serverA")]).await)
            .await
            .unwrap();
        assert_eq!(summary.accounts_timed_out, 1);
        assert!(!store.is_completed("serverA", "slow"));
    }

    #[tokio::test]
    async fn test_skip_server_filter() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(StubFetcher::default());
        let pool = CrawlWorkerPool::new(
            CrawlConfig {
                skip_servers: vec!["blocked.example".to_string()],
                ..config(1)
            },
            Arc::clone(&fetcher) as Arc<dyn RepoFetcher>,
            post_decoder(),
            Arc::new(MemoryOutput::default()),
            checkpoint(&dir),
        );

        let summary = pool
            .run(
                feed(vec![
                    AccountRef::new("a", "https://pds.blocked.example"),
                    AccountRef::new("b", "https://pds.ok.example"),
                ])
                .await,
            )
            .await
            .unwrap();
        assert_eq!(summary.accounts_admitted, 1);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timestamps_never_in_future() {
        let dir = TempDir::new().unwrap();
        let output = Arc::new(MemoryOutput::default());
        let decoder = Arc::new(StubDecoder {
            records: vec![
                (
                    "app.bsky.feed.like".to_string(),
                    "3jzfcijpj2z2a".to_string(),
                    serde_json::json!({}),
                ),
                (
                    "app.bsky.feed.post".to_string(),
                    "self".to_string(),
                    serde_json::json!({ "createdAt": "2999-01-01T00:00:00Z" }),
                ),
            ],
        });
        let pool = CrawlWorkerPool::new(
            config(1),
            Arc::new(StubFetcher::default()),
            decoder,
            Arc::clone(&output) as Arc<dyn CommitOutput>,
            checkpoint(&dir),
        );

        let before = Utc::now();
        pool.run(feed(vec![AccountRef::new("acct1", "serverA")]).await)
            .await
            .unwrap();
        let after = Utc::now();

        let messages = output.messages.lock();
        assert_eq!(messages[0].timestamp.timestamp(), 1_688_137_381);
        assert!(messages[1].timestamp >= before && messages[1].timestamp <= after);
    }
}
