//! The indexing sink interface.

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skyfill_core::{AtUri, Cid, CommitMessage, Value};
use std::collections::HashMap;

/// A record ready for indexing, with its content decoded into a [`Value`].
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRow {
    pub uri: AtUri,
    pub cid: Cid,
    pub timestamp: DateTime<Utc>,
    pub record: Value,
}

impl CommitRow {
    /// Decode a wire message, resolving any blob references in its content.
    pub fn from_message(message: CommitMessage) -> Self {
        let mut record = Value::from_json(message.record);
        if !record.resolve_blob_refs() {
            tracing::debug!("{} indexed with unresolved blob references", message.uri);
        }
        Self {
            uri: message.uri,
            cid: message.cid,
            timestamp: message.timestamp,
            record,
        }
    }
}

/// Pending rows grouped by collection.
pub type Batches = HashMap<String, Vec<CommitRow>>;

/// Bulk destination for decoded records.
///
/// A call either indexes every row it was given or fails as a whole.
#[async_trait]
pub trait IndexingSink: Send + Sync {
    async fn index_bulk(&self, batches: Batches) -> Result<()>;
}
