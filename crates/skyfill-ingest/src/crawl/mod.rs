//! Account crawling: input, scheduling, progress tracking and output.
//!
//! # Per-account flow
//!
//! ```text
//! AccountRef ─▶ checkpoint? ─▶ fetch snapshot ─▶ decode ─▶ timestamp ─▶ CommitOutput
//!                  │ done                                                  │
//!                  └─▶ skip                                    mark completed ◀┘
//! ```
//!
//! Records of one account are delivered strictly in sequence; different
//! accounts proceed concurrently up to [`CrawlConfig::concurrency`].

mod input;
mod output;
mod pool;
mod registry;

pub use input::{AccountRef, LineRange, feed_account_file, parse_account_line};
pub use output::{CommitOutput, ShardedOutput};
pub use pool::{CrawlSummary, CrawlWorkerPool};
pub use registry::{AccountOutcome, ActiveTask, CrawlRegistry, RegistrySnapshot, TaskHandle};

use std::time::Duration;

/// Crawl scheduling settings.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Maximum accounts processed at once.
    pub concurrency: usize,

    /// Deadline for one account. It cancels the snapshot fetch, and is
    /// checked between deliveries so a record write always completes.
    pub account_timeout: Duration,

    /// Accounts on servers whose address contains any of these are ignored.
    pub skip_servers: Vec<String>,

    /// Skip an account on any repository server error, including retry
    /// exhaustion and unrecognized XRPC errors, instead of stopping the
    /// crawl. Output and local I/O failures still stop it.
    pub skip_failed_accounts: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            account_timeout: Duration::from_secs(60),
            skip_servers: Vec::new(),
            skip_failed_accounts: false,
        }
    }
}
