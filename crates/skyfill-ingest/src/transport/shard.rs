//! Static routing of record collections to output shards.

use crate::{Error, Result};

/// Shard counts the routing table is laid out for.
pub const SUPPORTED_SHARD_COUNTS: [usize; 2] = [1, 3];

/// Three-way split of collections, balanced by write volume.
fn table_shard(collection: &str) -> Option<usize> {
    let shard = match collection {
        "app.bsky.feed.post"
        | "chat.bsky.actor.declaration"
        | "app.bsky.feed.postgate"
        | "app.bsky.labeler.service"
        | "app.bsky.feed.generator" => 0,

        "app.bsky.feed.like"
        | "app.bsky.actor.profile"
        | "app.bsky.graph.list"
        | "app.bsky.graph.block"
        | "app.bsky.graph.starterpack" => 1,

        "app.bsky.feed.threadgate"
        | "app.bsky.feed.repost"
        | "app.bsky.graph.follow"
        | "app.bsky.graph.listitem"
        | "app.bsky.graph.listblock" => 2,

        _ => return None,
    };
    Some(shard)
}

/// Maps a record's collection to the index of its output shard.
#[derive(Debug, Clone, Copy)]
pub struct ShardRouter {
    shards: usize,
}

impl ShardRouter {
    pub fn new(shards: usize) -> Result<Self> {
        if !SUPPORTED_SHARD_COUNTS.contains(&shards) {
            return Err(Error::Config(format!(
                "shard count must be 1 or 3, got {shards}"
            )));
        }
        Ok(Self { shards })
    }

    pub fn shard_count(&self) -> usize {
        self.shards
    }

    /// Shard for `collection`. Unknown collections go to shard 0.
    pub fn route(&self, collection: &str) -> usize {
        if self.shards == 1 {
            return 0;
        }
        table_shard(collection).unwrap_or_else(|| {
            tracing::warn!("No shard assigned for collection {}, using shard 0", collection);
            0
        })
    }
}
