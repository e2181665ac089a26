//! Error types for the crawl and ingest pipeline.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Remote error kinds that mean the account cannot be crawled on this server.
const TERMINAL_KINDS: &[&str] = &[
    "InternalServerError",
    "NotFound",
    "RepoDeactivated",
    "RepoNotFound",
    "RepoTakendown",
];

/// Errors that can occur while crawling, transporting or indexing records.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level HTTP failure (connect, timeout, body read).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A repository server answered with an XRPC error.
    #[error("XRPC error from {server}: {status} {}", xrpc_detail(.kind, .message))]
    Xrpc {
        /// Server that produced the error.
        server: String,
        /// HTTP status code.
        status: u16,
        /// XRPC `error` field.
        kind: Option<String>,
        /// XRPC `message` field.
        message: Option<String>,
    },

    /// ClickHouse error.
    #[error("ClickHouse error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Record-level error from the core crate (bad key, URI, CID or message).
    #[error(transparent)]
    Core(#[from] skyfill_core::Error),

    /// Repository snapshot could not be decoded.
    #[error("Snapshot decode error: {0}")]
    Decode(String),

    /// No idle connection left in a pool.
    #[error("Connection pool for {endpoint} exhausted ({lost} connections lost)")]
    PoolExhausted {
        /// Pool destination.
        endpoint: String,
        /// Connections closed since the pool was created.
        lost: usize,
    },

    /// Malformed traffic on a producer connection.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Account processing exceeded its deadline.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A crawl task panicked or was cancelled.
    #[error("Task failed: {0}")]
    Task(String),
}

fn xrpc_detail(kind: &Option<String>, message: &Option<String>) -> String {
    let kind = kind.as_deref().unwrap_or("<unknown>");
    match message {
        Some(m) => format!("{kind} ({m})"),
        None => kind.to_string(),
    }
}

/// How the crawl should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The server says the account is gone; skip it and do not retry.
    Terminal,
    /// The server could not be reached; skip the account.
    Unreachable,
    /// The account's data is malformed; skip it.
    Malformed,
    /// Transient; the client retries these.
    Retryable,
    /// Anything else; stops the crawl.
    Fatal,
}

impl Error {
    /// Classify this error.
    pub fn disposition(&self) -> Disposition {
        match self {
            Error::Xrpc { status, kind, .. } => {
                if matches!(status, 404 | 500)
                    || kind.as_deref().is_some_and(|k| TERMINAL_KINDS.contains(&k))
                {
                    Disposition::Terminal
                } else if matches!(status, 429 | 502 | 503 | 504) {
                    Disposition::Retryable
                } else {
                    Disposition::Fatal
                }
            }
            Error::Http(e) if e.is_connect() => Disposition::Unreachable,
            Error::Http(e) if e.is_timeout() || e.is_body() || e.is_decode() => {
                Disposition::Retryable
            }
            Error::Decode(_) | Error::Core(_) => Disposition::Malformed,
            _ => Disposition::Fatal,
        }
    }

    /// Whether the error came from a repository server rather than from
    /// local I/O or the output side.
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Xrpc { .. } | Error::Http(_))
    }
}
