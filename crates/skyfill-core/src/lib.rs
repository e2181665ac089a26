//! Core types and shared utilities for the skyfill backfill pipeline.
//!
//! This crate provides:
//! - Record identity: [`AtUri`], [`Tid`] record keys, content identifiers
//! - The portable record [`Value`] graph and blob reference resolution
//! - Canonical record timestamps
//! - The producer/consumer wire message ([`CommitMessage`])
//! - Prometheus metrics helpers
//! - Shared error types

mod commit;
mod error;
pub mod metrics;
mod tid;
mod timestamp;
mod uri;
mod value;

pub use commit::CommitMessage;
pub use error::{Error, Result};
pub use ipld_core::cid::Cid;
pub use tid::Tid;
pub use timestamp::{TimestampSource, canonical_timestamp, format_timestamp, parse_timestamp};
pub use uri::AtUri;
pub use value::{BlobRef, Value};
