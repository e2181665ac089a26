//! Canonical per-record timestamps.
//!
//! Indexers treat records whose timestamp is far from their creation time as
//! archival, so every record gets the best available estimate of when it was
//! created:
//!
//! 1. the record's own `createdAt` field, if it parses;
//! 2. otherwise the time embedded in its key (a TID);
//! 3. otherwise `now`, captured when the account's processing started.
//!
//! Whatever the source, the result is clamped to `now`.

use crate::tid::Tid;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

/// Where a canonical timestamp came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampSource {
    CreatedAt,
    Key,
    Now,
}

/// Compute the canonical timestamp for a record.
pub fn canonical_timestamp(
    record: &serde_json::Value,
    rkey: &str,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, TimestampSource) {
    let (ts, source) = if let Some(created) = created_at(record) {
        (created, TimestampSource::CreatedAt)
    } else if let Some(from_key) = Tid::parse(rkey).ok().and_then(|tid| tid.datetime()) {
        (from_key, TimestampSource::Key)
    } else {
        (now, TimestampSource::Now)
    };

    if ts > now {
        (now, source)
    } else {
        (ts, source)
    }
}

/// Format a timestamp the way it travels on the wire.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse a wire timestamp.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Zone-less forms are read as UTC.
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn created_at(record: &serde_json::Value) -> Option<DateTime<Utc>> {
    let raw = record.get("createdAt")?.as_str()?;
    // The epoch itself is what broken clients emit for "unset".
    parse_timestamp(raw).filter(|dt| dt.timestamp_micros() != 0)
}
