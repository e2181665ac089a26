//! Producer-side transport: connection pools and shard routing.
//!
//! ```text
//!   CrawlWorkerPool ──▶ ShardRouter ──▶ shard 0 ──▶ ConnectionPool ──▶ consumer socket 0
//!                                  ├──▶ shard 1 ──▶ ConnectionPool ──▶ consumer socket 1
//!                                  └──▶ shard 2 ──▶ ConnectionPool ──▶ consumer socket 2
//! ```

mod pool;
mod shard;

pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use shard::{SUPPORTED_SHARD_COUNTS, ShardRouter};
