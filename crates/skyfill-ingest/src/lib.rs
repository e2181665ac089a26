//! Skyfill repository crawling and indexing components.
//!
//! This crate crawls every account on a set of federated repository servers,
//! decodes each account's snapshot into records and either streams them to
//! an indexing consumer or writes them to a local, time-ordered backfill log.
//!
//! # Modules
//!
//! - [`client`] - Rate-limit-aware XRPC client with retry policy
//! - [`repo`] - CAR snapshot decoding into records
//! - [`crawl`] - Bounded-concurrency account crawl with checkpoints
//! - [`transport`] - Connection pools and collection-to-shard routing
//! - [`consumer`] - Socket listener, batching and the ClickHouse sink
//! - [`backfill`] - Unsorted crawl log and its external merge sort
//! - [`discovery`] - Server lists, account listing and relay admin calls
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ Account source  │  (DID file, or listRepos on discovered servers)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CrawlWorkerPool │  N accounts at once, checkpointed
//! └────────┬────────┘
//!          │ CommitMessage per record
//!          ▼
//! ┌─────────────────┐       ┌─────────────────┐
//! │  ShardedOutput  │ ────▶ │  BatchAssembler │ ──▶ ClickHouse
//! └─────────────────┘ unix  └─────────────────┘
//!          or
//! ┌─────────────────┐
//! │   BackfillLog   │ ──▶ sort_backfill_log ──▶ backfill-sorted.jsonl
//! └─────────────────┘
//! ```

pub mod backfill;
pub mod checkpoint;
pub mod client;
pub mod consumer;
pub mod crawl;
pub mod discovery;
pub mod error;
pub mod repo;
pub mod transport;

// Re-export commonly used types at crate root
pub use error::{Disposition, Error, Result};

pub use checkpoint::CheckpointStore;
pub use client::{ClientSet, RateLimitedClient, RepoFetcher, RetryPolicy};
pub use consumer::{AssemblerConfig, BatchAssembler, ClickHouseConfig, ClickHouseSink, IndexingSink};
pub use crawl::{AccountRef, CommitOutput, CrawlConfig, CrawlWorkerPool, ShardedOutput};
pub use repo::{CarDecoder, SnapshotDecoder};
pub use transport::{ConnectionPool, ShardRouter};
