//! Shard-side handling of DDL participant commands.
//!
//! A coordinator sends `_shardsvrDropCollectionParticipant` to every shard.
//! The handler validates the request against the shard's role and routing
//! state, drops the local collection, and tears down whatever the shard
//! cached about it so later local operations start from a fresh refresh.

mod state;
mod storage;

pub use state::{
    CollectionShardingRuntime, DatabaseShardingState, FilteringMetadata, ShardingState,
};
pub use storage::{InMemoryStorage, LocalStorage};

use crate::error::{Error, ErrorKind, Result};
use crate::network::rpc::{ShardCommand, ShardCommandRequest, ShardCommandResponse};
use crate::network::CommandHandler;
use crate::types::{ChunkVersion, ClusterRole, Namespace, WriteConcern};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Serves participant commands for one shard.
#[derive(Debug, Clone)]
pub struct ParticipantHandler {
    sharding_state: Arc<ShardingState>,
    storage: Arc<dyn LocalStorage>,
}

impl ParticipantHandler {
    pub fn new(sharding_state: Arc<ShardingState>, storage: Arc<dyn LocalStorage>) -> Self {
        Self {
            sharding_state,
            storage,
        }
    }

    pub fn sharding_state(&self) -> &Arc<ShardingState> {
        &self.sharding_state
    }

    /// Drop `ns` on this shard.
    ///
    /// A collection that does not exist locally still has its cached routing
    /// rows, range deletions and filtering metadata removed; the call then
    /// reports `NamespaceNotFound` so the coordinator can tell "already gone"
    /// apart from "dropped now".
    pub async fn drop_collection_participant(
        &self,
        ns: &Namespace,
        write_concern: WriteConcern,
        shard_version: ChunkVersion,
    ) -> Result<()> {
        if self.sharding_state.cluster_role() != ClusterRole::ShardServer {
            return Err(Error::IllegalOperation(
                "_shardsvrDropCollectionParticipant can only be run on shard servers".into(),
            ));
        }
        if !write_concern.is_majority() {
            return Err(Error::InvalidOptions(format!(
                "_shardsvrDropCollectionParticipant must be called with majority writeConcern, got {}",
                write_concern
            )));
        }

        let csr = self.sharding_state.collection(ns);
        {
            let _shared = csr.lock_shared().await;
            csr.check_shard_version(&shard_version)?;
        }

        if ns.is_system() {
            return Err(Error::IllegalOperation(format!(
                "can't drop system collection {}",
                ns
            )));
        }

        let dropped = match self.storage.drop_collection(ns).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NamespaceNotFound => Err(e),
            Err(e) => return Err(e),
        };

        self.storage.remove_cached_collection_metadata(ns).await?;
        let range_deletions = self.storage.remove_range_deletions(ns).await?;

        {
            let _exclusive = csr.lock_exclusive().await;
            csr.clear_filtering_metadata();
        }

        match &dropped {
            Ok(()) => info!(
                shard = %self.sharding_state.shard_id(),
                %ns,
                range_deletions,
                "Collection dropped on participant"
            ),
            Err(_) => debug!(
                shard = %self.sharding_state.shard_id(),
                %ns,
                "Collection already absent on participant"
            ),
        }
        dropped
    }

    async fn run(&self, request: &ShardCommandRequest) -> Result<()> {
        match &request.command {
            ShardCommand::DropCollectionParticipant { ns } => {
                self.drop_collection_participant(ns, request.write_concern, request.shard_version)
                    .await
            }
        }
    }
}

#[async_trait]
impl CommandHandler for ParticipantHandler {
    async fn handle(&self, request: ShardCommandRequest) -> ShardCommandResponse {
        let result = self.run(&request).await;
        if let Err(e) = &result {
            debug!(
                command = request.command.name(),
                ns = %request.command.namespace(),
                error = %e,
                "Participant command failed"
            );
        }

        let response = ShardCommandResponse::from_result(request.request_id, &result);
        // Write concern is waited for whatever the command outcome.
        match self.storage.wait_for_write_concern(request.write_concern).await {
            Ok(()) => response,
            Err(e) => response.with_write_concern_error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShardId;
    use uuid::Uuid;

    struct Fixture {
        handler: ParticipantHandler,
        state: Arc<ShardingState>,
        storage: Arc<InMemoryStorage>,
        ns: Namespace,
    }

    fn fixture(role: ClusterRole) -> Fixture {
        let state = Arc::new(ShardingState::new(ShardId::new("a"), role));
        let storage = Arc::new(InMemoryStorage::new());
        let handler = ParticipantHandler::new(state.clone(), storage.clone());
        Fixture {
            handler,
            state,
            storage,
            ns: Namespace::new("app", "users").unwrap(),
        }
    }

    fn request(ns: &Namespace) -> ShardCommandRequest {
        ShardCommandRequest::new(1, ns.db(), ShardCommand::DropCollectionParticipant { ns: ns.clone() })
    }

    #[tokio::test]
    async fn test_drop_tears_down_local_state() {
        let f = fixture(ClusterRole::ShardServer);
        f.storage.create_collection(&f.ns);
        f.storage.add_range_deletions(&f.ns, 2);
        let epoch = Uuid::new_v4();
        f.state
            .collection(&f.ns)
            .set_filtering_metadata(FilteringMetadata::Sharded(ChunkVersion::new(3, 0, epoch)));

        let resp = f.handler.handle(request(&f.ns)).await;
        assert!(resp.status.is_ok());
        assert!(resp.write_concern_error.is_none());

        assert!(!f.storage.has_collection(&f.ns));
        assert!(!f.storage.has_cached_metadata(&f.ns));
        assert_eq!(f.storage.pending_range_deletions(&f.ns), 0);
        assert_eq!(f.state.collection(&f.ns).metadata(), FilteringMetadata::Unknown);
    }

    #[tokio::test]
    async fn test_absent_collection_reports_not_found_after_teardown() {
        let f = fixture(ClusterRole::ShardServer);
        f.storage.add_range_deletions(&f.ns, 1);
        f.state
            .collection(&f.ns)
            .set_filtering_metadata(FilteringMetadata::Unsharded);

        let resp = f.handler.handle(request(&f.ns)).await;
        assert_eq!(resp.status.kind(), Some(ErrorKind::NamespaceNotFound));
        assert_eq!(f.storage.pending_range_deletions(&f.ns), 0);
        assert_eq!(f.state.collection(&f.ns).metadata(), FilteringMetadata::Unknown);
    }

    #[tokio::test]
    async fn test_rejects_non_shard_role() {
        let f = fixture(ClusterRole::None);
        f.storage.create_collection(&f.ns);

        let resp = f.handler.handle(request(&f.ns)).await;
        assert_eq!(resp.status.kind(), Some(ErrorKind::IllegalOperation));
        assert!(f.storage.has_collection(&f.ns));
    }

    #[tokio::test]
    async fn test_rejects_non_majority() {
        let f = fixture(ClusterRole::ShardServer);
        f.storage.create_collection(&f.ns);

        let resp = f
            .handler
            .handle(request(&f.ns).with_write_concern(WriteConcern::Nodes(1)))
            .await;
        assert_eq!(resp.status.kind(), Some(ErrorKind::InvalidOptions));
        assert_eq!(f.storage.drop_count(), 0);
    }

    #[tokio::test]
    async fn test_critical_section_is_stale() {
        let f = fixture(ClusterRole::ShardServer);
        f.storage.create_collection(&f.ns);
        f.state.collection(&f.ns).enter_critical_section();

        let resp = f.handler.handle(request(&f.ns)).await;
        assert_eq!(resp.status.kind(), Some(ErrorKind::StaleShardVersion));
        assert!(f.storage.has_collection(&f.ns));

        f.state.collection(&f.ns).exit_critical_section();
        assert!(f.handler.handle(request(&f.ns)).await.status.is_ok());
    }

    #[tokio::test]
    async fn test_refuses_system_collection() {
        let f = fixture(ClusterRole::ShardServer);
        let ns = Namespace::new("app", "system.views").unwrap();
        f.storage.create_collection(&ns);

        let resp = f.handler.handle(request(&ns)).await;
        assert_eq!(resp.status.kind(), Some(ErrorKind::IllegalOperation));
        assert!(f.storage.has_collection(&ns));
    }

    #[tokio::test]
    async fn test_write_concern_error_reported_separately() {
        let f = fixture(ClusterRole::ShardServer);
        f.storage.create_collection(&f.ns);
        f.storage
            .fail_write_concern(Some("waiting for replication timed out".into()));

        let resp = f.handler.handle(request(&f.ns)).await;
        assert!(resp.status.is_ok());
        assert!(resp
            .write_concern_error
            .unwrap()
            .contains("waiting for replication timed out"));
    }
}
