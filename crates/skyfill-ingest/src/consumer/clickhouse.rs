//! ClickHouse indexing sink.
//!
//! Every flush becomes one `INSERT` into a single records table:
//!
//! ```sql
//! CREATE TABLE records (
//!     collection LowCardinality(String),
//!     uri        String,
//!     did        String,
//!     rkey       String,
//!     cid        String,
//!     created_at DateTime64(6),
//!     record     String,          -- DAG-JSON
//!     blobs      Array(String)
//! ) ENGINE = ReplacingMergeTree ORDER BY (did, collection, rkey);
//! ```
//!
//! Re-crawled rows repeat the same `(did, collection, rkey)`, which the
//! replacing engine collapses.

use super::sink::{Batches, CommitRow, IndexingSink};
use crate::Result;
use async_trait::async_trait;
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use skyfill_core::Value;

/// Configuration for the ClickHouse sink.
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    /// ClickHouse server URL (e.g., "http://localhost:8123")
    pub url: String,

    /// Database name
    pub database: String,

    /// Table name for records
    pub table: String,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "skyfill".to_string(),
            table: "records".to_string(),
        }
    }
}

/// Row structure matching the ClickHouse records table.
#[derive(Debug, Clone, Row, Serialize, Deserialize, PartialEq)]
pub struct RecordRow {
    pub collection: String,
    pub uri: String,
    pub did: String,
    pub rkey: String,
    pub cid: String,
    pub created_at: i64, // DateTime64(6) is stored as microseconds
    pub record: String,
    pub blobs: Vec<String>,
}

impl RecordRow {
    fn from_row(collection: &str, row: &CommitRow) -> Self {
        let mut blobs = Vec::new();
        collect_blobs(&row.record, &mut blobs);
        Self {
            collection: collection.to_string(),
            uri: row.uri.to_string(),
            did: row.uri.did.clone(),
            rkey: row.uri.rkey.clone(),
            cid: row.cid.to_string(),
            created_at: row.timestamp.timestamp_micros(),
            record: row.record.to_json().to_string(),
            blobs,
        }
    }
}

fn collect_blobs(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Blob(blob) => out.push(blob.cid.to_string()),
        Value::Array(items) => items.iter().for_each(|v| collect_blobs(v, out)),
        Value::Map(map) => map.values().for_each(|v| collect_blobs(v, out)),
        _ => {}
    }
}

/// Indexing sink writing to ClickHouse.
pub struct ClickHouseSink {
    client: Client,
    config: ClickHouseConfig,
}

impl ClickHouseSink {
    pub fn new(config: ClickHouseConfig) -> Self {
        let client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database);

        tracing::info!(
            "ClickHouse sink initialized: url={}, database={}, table={}",
            config.url,
            config.database,
            config.table
        );

        Self { client, config }
    }

    /// Check if ClickHouse is reachable.
    pub async fn health_check(&self) -> Result<bool> {
        let result: u8 = self.client.query("SELECT 1").fetch_one().await?;
        Ok(result == 1)
    }

    /// Get the count of records in the table.
    pub async fn record_count(&self) -> Result<u64> {
        let query = format!("SELECT count() FROM {}", self.config.table);
        let count: u64 = self.client.query(&query).fetch_one().await?;
        Ok(count)
    }
}

#[async_trait]
impl IndexingSink for ClickHouseSink {
    async fn index_bulk(&self, batches: Batches) -> Result<()> {
        if batches.values().all(Vec::is_empty) {
            return Ok(());
        }

        let mut inserter = self.client.insert(&self.config.table)?;
        for (collection, rows) in &batches {
            for row in rows {
                inserter.write(&RecordRow::from_row(collection, row)).await?;
            }
        }
        inserter.end().await?;

        Ok(())
    }
}
