//! Offline backfill: crawl into a local log, then order it by time.
//!
//! ```text
//! crawl ──▶ BackfillLog (backfill-unsorted.jsonl)
//!                │
//!                ▼
//!         sort_backfill_log ──▶ backfill-sorted.jsonl
//! ```

mod log;
mod sort;

pub use log::{BackfillLog, LogLine};
pub use sort::{SortConfig, SortStats, sort_backfill_log};

/// Default name of the unsorted crawl log.
pub const UNSORTED_LOG: &str = "backfill-unsorted.jsonl";

/// Default name of the time-ordered output.
pub const SORTED_LOG: &str = "backfill-sorted.jsonl";
