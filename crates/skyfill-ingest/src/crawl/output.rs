//! Where crawled records go.

use crate::transport::{ConnectionPool, ShardRouter};
use crate::{Error, Result};
use async_trait::async_trait;
use skyfill_core::CommitMessage;
use std::sync::Arc;
use tokio::io::AsyncWrite;

/// Destination for commit messages produced by the crawl.
///
/// `deliver` returns only once the message has been accepted, so a slow
/// destination stalls the calling account and nothing else.
#[async_trait]
pub trait CommitOutput: Send + Sync {
    async fn deliver(&self, message: &CommitMessage) -> Result<()>;

    /// Make everything delivered so far durable.
    ///
    /// Called after an account's last record and before the account is
    /// checkpointed, so a checkpointed account never has buffered records.
    async fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Live mode: one connection pool per shard, one line per message.
pub struct ShardedOutput<C> {
    router: ShardRouter,
    pools: Vec<Arc<ConnectionPool<C>>>,
}

impl<C> ShardedOutput<C>
where
    C: AsyncWrite + Unpin + Send,
{
    /// `pools[i]` receives shard `i`.
    pub fn new(router: ShardRouter, pools: Vec<Arc<ConnectionPool<C>>>) -> Result<Self> {
        if pools.len() != router.shard_count() {
            return Err(Error::Config(format!(
                "{} connection pools for {} shards",
                pools.len(),
                router.shard_count()
            )));
        }
        Ok(Self { router, pools })
    }

    pub fn pools(&self) -> &[Arc<ConnectionPool<C>>] {
        &self.pools
    }
}

#[async_trait]
impl<C> CommitOutput for ShardedOutput<C>
where
    C: AsyncWrite + Unpin + Send + Sync + 'static,
{
    async fn deliver(&self, message: &CommitMessage) -> Result<()> {
        let shard = self.router.route(&message.collection);
        let line = message.to_line()?;
        let mut conn = self.pools[shard].checkout()?;
        conn.write_line(&line).await
    }
}
