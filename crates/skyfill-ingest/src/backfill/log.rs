//! Append-only, unsorted backfill log.
//!
//! One JSON object per line, in crawl order:
//!
//! ```text
//! {"action":"create","timestamp":1577836800000000,"uri":"at://...","cid":"bafy...","record":{...}}
//! ```
//!
//! `timestamp` is microseconds since the epoch so the sort can compare it
//! numerically without parsing dates.

use crate::Result;
use crate::crawl::CommitOutput;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use skyfill_core::CommitMessage;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// One backfill log line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogLine {
    pub action: String,
    pub timestamp: i64,
    pub uri: String,
    pub cid: String,
    pub record: serde_json::Value,
}

impl LogLine {
    pub fn from_message(message: &CommitMessage) -> Self {
        Self {
            action: "create".to_string(),
            timestamp: message.timestamp.timestamp_micros(),
            uri: message.uri.to_string(),
            cid: message.cid.to_string(),
            record: message.record.clone(),
        }
    }
}

/// Appends crawled records to the unsorted log.
pub struct BackfillLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    lines: AtomicU64,
}

impl BackfillLog {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::info!("Appending backfill records to {}", path.display());
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            lines: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines written since opening.
    pub fn lines(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }

    pub fn append(&self, message: &CommitMessage) -> Result<()> {
        let mut encoded = serde_json::to_vec(&LogLine::from_message(message))?;
        encoded.push(b'\n');
        self.writer.lock().write_all(&encoded)?;
        self.lines.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

#[async_trait]
impl CommitOutput for BackfillLog {
    async fn deliver(&self, message: &CommitMessage) -> Result<()> {
        self.append(message)
    }

    async fn sync(&self) -> Result<()> {
        self.flush()
    }
}
