//! Snapshot fetching across many servers.

use super::{RateLimitedClient, RetryPolicy, normalize_server};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Source of repository snapshots.
#[async_trait]
pub trait RepoFetcher: Send + Sync {
    /// Fetch the complete repository of `did` from `server`.
    async fn fetch_repo(&self, server: &str, did: &str) -> Result<Bytes>;
}

/// Lazily created [`RateLimitedClient`]s, one per server.
///
/// Each server has its own request budget, so accounts on the same server
/// share a client while different servers proceed independently.
pub struct ClientSet {
    http: reqwest::Client,
    policy: RetryPolicy,
    clients: Mutex<HashMap<String, Arc<RateLimitedClient>>>,
}

impl ClientSet {
    pub fn new(http: reqwest::Client, policy: RetryPolicy) -> Self {
        Self {
            http,
            policy,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// The client for `server`, creating it on first use.
    pub fn client_for(&self, server: &str) -> Arc<RateLimitedClient> {
        let key = normalize_server(server);
        let mut clients = self.clients.lock();
        Arc::clone(clients.entry(key).or_insert_with_key(|key| {
            Arc::new(RateLimitedClient::new(
                self.http.clone(),
                key,
                self.policy.clone(),
            ))
        }))
    }

    /// Number of distinct servers seen so far.
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RepoFetcher for ClientSet {
    async fn fetch_repo(&self, server: &str, did: &str) -> Result<Bytes> {
        let client = self.client_for(server);
        let body = client.get_repo(did).await?;
        skyfill_core::metrics::record_bytes("crawl_snapshot_bytes_total", "car", body.len() as u64);
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_shared_per_server() {
        let set = ClientSet::new(reqwest::Client::new(), RetryPolicy::default());
        let a = set.client_for("https://pds.example");
        let b = set.client_for("pds.example/");
        let c = set.client_for("https://other.example");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(set.len(), 2);
    }
}
