//! Ask a relay to crawl every known server and lift its per-host limits.
//!
//! # Usage
//!
//! ```bash
//! RELAY_ADMIN_KEY=... request-crawl --relay relay.example.com
//!
//! # Only raise limits
//! request-crawl --relay relay.example.com --no-crawl
//! ```
//!
//! Failures are logged per host; the run always covers every server.

use anyhow::{Context, Result};
use clap::Parser;
use skyfill_ingest::discovery::{
    DEFAULT_SERVER_LIST_URL, RelayAdmin, fetch_known_servers, server_hostname,
};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

/// Relay crawl requester.
#[derive(Parser, Debug)]
#[command(name = "request-crawl")]
#[command(about = "Request relay crawls and raise rate limits for all known servers")]
#[command(version)]
struct Args {
    /// Relay host or URL
    #[arg(long, env = "RELAY_URL")]
    relay: String,

    /// Relay admin key
    #[arg(long, env = "RELAY_ADMIN_KEY", hide_env_values = true)]
    admin_key: String,

    /// Where to discover servers from
    #[arg(long, env = "SERVER_LIST_URL", default_value = DEFAULT_SERVER_LIST_URL)]
    server_list_url: String,

    /// Skip the requestCrawl phase
    #[arg(long)]
    no_crawl: bool,

    /// Skip the changeLimits phase
    #[arg(long)]
    no_change_limits: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv()
        && !e.not_found()
    {
        return Err(e).context("Failed to load .env");
    }

    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let http = reqwest::Client::new();
    let servers = fetch_known_servers(&http, &args.server_list_url)
        .await
        .context("Failed to fetch server list")?;
    let hosts: Vec<String> = servers
        .iter()
        .map(|s| server_hostname(s).to_string())
        .collect();

    // `relay` may be given with or without a scheme; the relay is always https
    let relay_host = args
        .relay
        .split_once("://")
        .map_or(args.relay.as_str(), |(_, rest)| rest);
    let relay = format!("https://{relay_host}");
    let admin = Arc::new(RelayAdmin::new(http, &relay, args.admin_key.clone()));

    if !args.no_crawl {
        tracing::info!("Requesting crawls of {} hosts from {}", hosts.len(), admin.relay_url());
        let mut tasks = JoinSet::new();
        for host in hosts.iter().cloned() {
            let admin = Arc::clone(&admin);
            tasks.spawn(async move {
                if let Err(e) = admin.request_crawl(&host).await {
                    tracing::error!("Error requesting crawl for {}: {}", host, e);
                    return false;
                }
                true
            });
        }
        let mut ok = 0usize;
        while let Some(joined) = tasks.join_next().await {
            if joined.unwrap_or(false) {
                ok += 1;
            }
        }
        tracing::info!("Done crawling! {}/{} requests accepted", ok, hosts.len());
    }

    if !args.no_change_limits {
        tracing::info!("Setting rate limits...");
        let mut ok = 0usize;
        for host in &hosts {
            match admin.change_limits(host).await {
                Ok(()) => ok += 1,
                Err(e) => tracing::error!("Error setting rate limits for {}: {}", host, e),
            }
        }
        tracing::info!("Done setting rate limits! {}/{} hosts updated", ok, hosts.len());
    }

    Ok(())
}
