//! Repository snapshot decoding.
//!
//! A snapshot is the complete signed state of one account's repository. The
//! crawl only needs the records inside it, so decoders expose a lazy
//! iterator of [`RepoRecord`]s. A record that fails to decode is reported as
//! an `Err` item; iteration continues with the next one.

mod car;

pub use car::CarDecoder;

use crate::Result;
use bytes::Bytes;
use ipld_core::cid::Cid;

/// One record extracted from a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoRecord {
    pub collection: String,
    pub rkey: String,
    pub cid: Cid,
    /// Record body in DAG-JSON form.
    pub record: serde_json::Value,
}

/// Lazy, finite, single-pass sequence of decoded records.
pub type RecordIter = Box<dyn Iterator<Item = Result<RepoRecord>> + Send>;

/// Turns a snapshot blob into records.
pub trait SnapshotDecoder: Send + Sync {
    /// Start decoding. Fails only when the snapshot as a whole is unreadable.
    fn decode(&self, snapshot: Bytes) -> Result<RecordIter>;
}
