//! Crawl checkpoint: which accounts on which servers are done.
//!
//! # File Format
//!
//! ```json
//! { "https://pds.example": { "did:plc:abc": true, "did:plc:def": true } }
//! ```
//!
//! The file is read once at startup. A missing or unreadable file means an
//! empty checkpoint, never an error. Flushes write the whole map to a
//! temporary file and rename it over the old one, so a crash mid-flush leaves
//! the previous checkpoint intact.
//!
//! # Consistency
//!
//! The checkpoint is not transactional with the crawl: an account completed
//! after the last flush is crawled again on restart. Downstream delivery is
//! idempotent on `(uri, cid)`, so this only costs time.

use crate::Result;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

type CompletedMap = HashMap<String, HashMap<String, bool>>;

/// Durable record of completed (server, account) pairs.
pub struct CheckpointStore {
    path: PathBuf,
    completed: RwLock<CompletedMap>,
    /// Serializes flushes so two writers never share the temporary file.
    flush_lock: Mutex<()>,
}

impl CheckpointStore {
    /// Load the checkpoint at `path`, starting empty if it is absent or corrupt.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let completed = match std::fs::read(&path) {
            Ok(raw) => match serde_json::from_slice::<CompletedMap>(&raw) {
                Ok(map) => {
                    let accounts: usize = map.values().map(HashMap::len).sum();
                    tracing::info!(
                        "Loaded checkpoint {}: {} accounts on {} servers",
                        path.display(),
                        accounts,
                        map.len()
                    );
                    map
                }
                Err(e) => {
                    tracing::warn!(
                        "Ignoring unreadable checkpoint {}: {}",
                        path.display(),
                        e
                    );
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No checkpoint at {}, starting fresh", path.display());
                HashMap::new()
            }
            Err(e) => {
                tracing::warn!("Could not read checkpoint {}: {}", path.display(), e);
                HashMap::new()
            }
        };

        Self {
            path,
            completed: RwLock::new(completed),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_completed(&self, server: &str, did: &str) -> bool {
        self.completed
            .read()
            .get(server)
            .and_then(|accounts| accounts.get(did))
            .copied()
            .unwrap_or(false)
    }

    pub fn mark_completed(&self, server: &str, did: &str) {
        self.completed
            .write()
            .entry(server.to_string())
            .or_default()
            .insert(did.to_string(), true);
    }

    /// Number of completed accounts across all servers.
    pub fn completed_count(&self) -> usize {
        self.completed.read().values().map(HashMap::len).sum()
    }

    /// Write the current map to disk atomically.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock();

        // Serialize under the read lock so the snapshot is consistent, then
        // release it before touching the filesystem.
        let (encoded, accounts) = {
            let completed = self.completed.read();
            let accounts: usize = completed.values().map(HashMap::len).sum();
            (serde_json::to_vec(&*completed)?, accounts)
        };

        let tmp = tmp_path(&self.path);
        std::fs::write(&tmp, &encoded)?;
        std::fs::rename(&tmp, &self.path)?;

        metrics::counter!("checkpoint_flushes_total").increment(1);
        metrics::gauge!("checkpoint_accounts_completed").set(accounts as f64);
        tracing::debug!(
            "Flushed checkpoint {} ({} accounts)",
            self.path.display(),
            accounts
        );
        Ok(())
    }

    /// Flush every `interval` until `running` is cleared, then flush once more.
    pub fn spawn_periodic_flush(
        self: &Arc<Self>,
        interval: Duration,
        running: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stopping = !running.load(Ordering::SeqCst);

                let store = Arc::clone(&store);
                match tokio::task::spawn_blocking(move || store.flush()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!("Checkpoint flush failed: {}", e),
                    Err(e) => tracing::error!("Checkpoint flush task failed: {}", e),
                }

                if stopping {
                    break;
                }
            }
        })
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
