//! In-process [`ShardClient`] that dispatches straight to registered handlers.

use crate::error::{NetworkError, Result};
use crate::network::rpc::{ShardCommandRequest, ShardCommandResponse};
use crate::network::{CommandHandler, ShardClient};
use crate::types::{ShardDescriptor, ShardId};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::fmt;
use std::sync::Arc;

/// Routes commands to handlers living in the same process.
///
/// Shards can be cut off with [`LocalShardClient::isolate`] to exercise
/// transport failures without sockets.
#[derive(Default)]
pub struct LocalShardClient {
    handlers: DashMap<ShardId, Arc<dyn CommandHandler>>,
    isolated: DashSet<ShardId>,
}

impl LocalShardClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, shard_id: ShardId, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(shard_id, handler);
    }

    pub fn unregister(&self, shard_id: &ShardId) {
        self.handlers.remove(shard_id);
    }

    /// Fail every command to `shard_id` with a connection error.
    pub fn isolate(&self, shard_id: ShardId) {
        self.isolated.insert(shard_id);
    }

    pub fn heal(&self, shard_id: &ShardId) {
        self.isolated.remove(shard_id);
    }
}

impl fmt::Debug for LocalShardClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut shards: Vec<String> = self.handlers.iter().map(|e| e.key().to_string()).collect();
        shards.sort();
        f.debug_struct("LocalShardClient")
            .field("shards", &shards)
            .field("isolated", &self.isolated.len())
            .finish()
    }
}

#[async_trait]
impl ShardClient for LocalShardClient {
    async fn run_command(
        &self,
        shard: &ShardDescriptor,
        request: ShardCommandRequest,
    ) -> Result<ShardCommandResponse> {
        if self.isolated.contains(&shard.id) {
            return Err(NetworkError::ConnectionFailed {
                addr: shard.endpoint.clone(),
                reason: "shard isolated".into(),
            }
            .into());
        }

        // Clone out of the map so no shard guard is held across the await.
        let handler = self
            .handlers
            .get(&shard.id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| NetworkError::UnknownShard(shard.id.clone()))?;

        Ok(handler.handle(request).await)
    }
}
