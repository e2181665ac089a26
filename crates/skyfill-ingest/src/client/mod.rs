//! Rate-limit-aware, retrying XRPC client for repository servers.
//!
//! One [`RateLimitedClient`] exists per server. All clients share a single
//! `reqwest::Client` (and so its connection pool), but each tracks its own
//! server's request budget.
//!
//! # Retry Policy
//!
//! - `429 Too Many Requests`: wait for the signalled reset and retry the same
//!   request. These retries never count against the attempt budget.
//! - `502`/`503`/`504`, timeouts and truncated bodies: retry with the fixed
//!   backoff schedule, up to [`RetryPolicy::max_attempts`] attempts.
//! - Everything else (connection refused, XRPC 4xx, `500`) is returned
//!   immediately.

mod fetcher;
pub mod ratelimit;

pub use fetcher::{ClientSet, RepoFetcher};

use crate::{Disposition, Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// Default backoff schedule between retryable failures.
///
/// With the default ceiling of seven attempts there are six retries, so the
/// final 300s entry and the fallback only come into play for policies that
/// raise [`RetryPolicy::max_attempts`].
pub const DEFAULT_BACKOFF_SECS: [u64; 7] = [1, 5, 15, 30, 60, 120, 300];

/// Retry and rate-limit settings.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before retry N (0-based). Past the end, `fallback_backoff` applies.
    pub backoff: Vec<Duration>,

    /// Delay used once the schedule is exhausted.
    pub fallback_backoff: Duration,

    /// Attempts allowed for retryable failures, including the first.
    pub max_attempts: u32,

    /// Added to the server's reset time before the next request.
    pub ratelimit_margin: Duration,

    /// Wait after a 429 that carries no usable headers.
    pub ratelimit_fallback: Duration,

    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            fallback_backoff: Duration::from_secs(60),
            max_attempts: 7,
            ratelimit_margin: Duration::from_secs(1),
            ratelimit_fallback: Duration::from_secs(60),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Settings for the backfill crawler, which runs closer to the limits.
    pub fn backfill() -> Self {
        Self {
            ratelimit_margin: Duration::from_secs(3),
            ..Default::default()
        }
    }

    fn backoff_for(&self, retry: u32) -> Duration {
        self.backoff
            .get(retry as usize)
            .copied()
            .unwrap_or(self.fallback_backoff)
    }
}

/// One page of `com.atproto.sync.listRepos`.
#[derive(Debug, Clone, Deserialize)]
pub struct ListReposPage {
    pub cursor: Option<String>,
    #[serde(default)]
    pub repos: Vec<RepoEntry>,
}

/// An account listed by a server.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoEntry {
    pub did: String,
    #[serde(default)]
    pub active: Option<bool>,
}

#[derive(Deserialize)]
struct XrpcErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// XRPC client bound to one repository server.
pub struct RateLimitedClient {
    http: reqwest::Client,
    server: String,
    policy: RetryPolicy,
    /// No request may be sent before this instant.
    blocked_until: Mutex<Option<Instant>>,
}

impl RateLimitedClient {
    /// Create a client for `server` sharing `http`'s connection pool.
    pub fn new(http: reqwest::Client, server: &str, policy: RetryPolicy) -> Self {
        Self {
            http,
            server: normalize_server(server),
            policy,
            blocked_until: Mutex::new(None),
        }
    }

    /// Server base URL (no trailing slash).
    pub fn server(&self) -> &str {
        &self.server
    }

    /// When the next request is allowed, if currently held back.
    pub fn blocked_until(&self) -> Option<Instant> {
        (*self.blocked_until.lock()).filter(|t| *t > Instant::now())
    }

    /// Download an account's full repository as a CAR file.
    pub async fn get_repo(&self, did: &str) -> Result<Bytes> {
        let url = format!("{}/xrpc/com.atproto.sync.getRepo", self.server);
        self.fetch(|http| http.get(&url).query(&[("did", did)])).await
    }

    /// Fetch one page of accounts hosted on the server.
    pub async fn list_repos(&self, cursor: Option<&str>, limit: u32) -> Result<ListReposPage> {
        let url = format!("{}/xrpc/com.atproto.sync.listRepos", self.server);
        let limit = limit.to_string();
        let body = self
            .fetch(|http| {
                let req = http.get(&url).query(&[("limit", limit.as_str())]);
                match cursor {
                    Some(c) => req.query(&[("cursor", c)]),
                    None => req,
                }
            })
            .await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Send a request built by `build`, honouring rate limits and retrying
    /// per the policy, and return the successful response body.
    pub async fn fetch<F>(&self, build: F) -> Result<Bytes>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut failures = 0u32;

        loop {
            self.wait_for_budget().await;
            metrics::counter!("client_requests_total").increment(1);

            let err = match self.attempt(&build).await {
                Ok(body) => return Ok(body),
                Err(Attempt::RateLimited) => continue,
                Err(Attempt::Failed(e)) => e,
            };

            if err.disposition() != Disposition::Retryable {
                return Err(err);
            }

            failures += 1;
            if failures >= self.policy.max_attempts {
                tracing::warn!(
                    "{}: giving up after {} attempts: {}",
                    self.server,
                    failures,
                    err
                );
                return Err(err);
            }

            let delay = self.policy.backoff_for(failures - 1);
            metrics::counter!("client_retries_total").increment(1);
            tracing::debug!(
                "{}: attempt {}/{} failed ({}), retrying in {:?}",
                self.server,
                failures,
                self.policy.max_attempts,
                err,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt<F>(&self, build: &F) -> std::result::Result<Bytes, Attempt>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let response = build(&self.http)
            .timeout(self.policy.request_timeout)
            .send()
            .await
            .map_err(|e| Attempt::Failed(e.into()))?;

        let status = response.status();
        let now = SystemTime::now();
        let budget_delay =
            ratelimit::rate_limit_delay(response.headers(), now, self.policy.ratelimit_margin);

        if status == StatusCode::TOO_MANY_REQUESTS {
            let delay = budget_delay
                .or_else(|| ratelimit::retry_after(response.headers(), now))
                .unwrap_or(self.policy.ratelimit_fallback);
            tracing::info!("{}: rate limited, waiting {:?}", self.server, delay);
            self.hold_off(delay);
            return Err(Attempt::RateLimited);
        }

        if let Some(delay) = budget_delay {
            tracing::debug!(
                "{}: request budget spent, next request in {:?}",
                self.server,
                delay
            );
            self.hold_off(delay);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Attempt::Failed(e.into()))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(Attempt::Failed(self.xrpc_error(status, &body)))
        }
    }

    fn xrpc_error(&self, status: StatusCode, body: &[u8]) -> Error {
        let parsed: Option<XrpcErrorBody> = serde_json::from_slice(body).ok();
        let (kind, message) = parsed.map(|b| (b.error, b.message)).unwrap_or_default();
        Error::Xrpc {
            server: self.server.clone(),
            status: status.as_u16(),
            kind,
            message,
        }
    }

    fn hold_off(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut blocked = self.blocked_until.lock();
        if blocked.is_none_or(|current| current < until) {
            *blocked = Some(until);
        }
    }

    async fn wait_for_budget(&self) {
        loop {
            let until = *self.blocked_until.lock();
            match until {
                Some(t) if t > Instant::now() => {
                    metrics::counter!("client_ratelimit_waits_total").increment(1);
                    tokio::time::sleep_until(t).await;
                }
                _ => return,
            }
        }
    }
}

enum Attempt {
    RateLimited,
    Failed(Error),
}

/// Canonical form of a server address: scheme included, no trailing slash.
pub fn normalize_server(server: &str) -> String {
    let trimmed = server.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}
