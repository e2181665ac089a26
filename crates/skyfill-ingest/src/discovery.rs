//! Finding servers and accounts, and nudging a relay to crawl them.
//!
//! The public server list is the `pdses` map of the community-maintained
//! atproto-scraping state file. Only `https://` entries are used.

use crate::client::{RateLimitedClient, normalize_server};
use crate::crawl::AccountRef;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Default source of known repository servers.
pub const DEFAULT_SERVER_LIST_URL: &str =
    "https://raw.githubusercontent.com/mary-ext/atproto-scraping/refs/heads/trunk/state.json";

/// Page size for `listRepos`.
pub const LIST_REPOS_LIMIT: u32 = 1000;

#[derive(Deserialize)]
struct ScrapingState {
    pdses: Option<BTreeMap<String, serde_json::Value>>,
}

/// Fetch the known server list, sorted and without trailing slashes.
pub async fn fetch_known_servers(http: &reqwest::Client, url: &str) -> Result<Vec<String>> {
    let state: ScrapingState = http
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let pdses = state
        .pdses
        .ok_or_else(|| Error::Config(format!("no pdses in server list at {url}")))?;

    let servers: Vec<String> = pdses
        .into_keys()
        .filter(|s| s.starts_with("https://"))
        .map(|s| normalize_server(&s))
        .collect();

    tracing::info!("Found {} servers in {}", servers.len(), url);
    Ok(servers)
}

/// Page through every account on `client`'s server, sending each to `tx`.
///
/// Returns the number of accounts sent. Stops early without error if the
/// receiver has gone away.
pub async fn feed_server_accounts(
    client: &RateLimitedClient,
    tx: &mpsc::Sender<AccountRef>,
) -> Result<u64> {
    let mut cursor: Option<String> = None;
    let mut sent = 0u64;

    loop {
        let page = client.list_repos(cursor.as_deref(), LIST_REPOS_LIMIT).await?;
        let empty = page.repos.is_empty();

        for repo in page.repos {
            if tx.send(AccountRef::new(repo.did, client.server())).await.is_err() {
                return Ok(sent);
            }
            sent += 1;
        }

        match page.cursor {
            Some(next) if !empty && cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
            _ => break,
        }
    }

    tracing::debug!("{}: listed {} accounts", client.server(), sent);
    Ok(sent)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChangeLimits<'a> {
    host: &'a str,
    per_second: u64,
    per_hour: u64,
    per_day: u64,
    repo_limit: u64,
    crawl_rate: u64,
}

#[derive(Deserialize)]
struct AdminErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// Admin client for a relay.
pub struct RelayAdmin {
    http: reqwest::Client,
    relay_url: String,
    admin_key: String,
}

impl RelayAdmin {
    pub fn new(http: reqwest::Client, relay_url: &str, admin_key: impl Into<String>) -> Self {
        Self {
            http,
            relay_url: normalize_server(relay_url),
            admin_key: admin_key.into(),
        }
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    /// Ask the relay to start crawling `hostname`.
    pub async fn request_crawl(&self, hostname: &str) -> Result<()> {
        let body = serde_json::json!({ "hostname": format!("https://{hostname}") });
        self.post("/admin/pds/requestCrawl", &body).await
    }

    /// Raise the relay's per-host limits for `hostname`.
    pub async fn change_limits(&self, hostname: &str) -> Result<()> {
        let body = ChangeLimits {
            host: hostname,
            per_second: 10_000,
            per_hour: 10_000_000,
            per_day: 200_000_000,
            repo_limit: 1_000_000,
            crawl_rate: 100_000,
        };
        self.post("/admin/pds/changeLimits", &body).await
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<()> {
        let response = self
            .http
            .post(format!("{}{}", self.relay_url, path))
            .bearer_auth(&self.admin_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        let parsed: Option<AdminErrorBody> = serde_json::from_str(&text).ok();
        let (kind, message) = parsed.map(|b| (b.error, b.message)).unwrap_or_default();
        Err(Error::Xrpc {
            server: self.relay_url.clone(),
            status: status.as_u16(),
            kind,
            message,
        })
    }
}

/// Host part of a server address.
pub fn server_hostname(server: &str) -> &str {
    let rest = server
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(server);
    rest.split(['/', ':']).next().unwrap_or(rest)
}
