//! Entry point for running sharded DDL on a database's primary shard.

use crate::catalog::CatalogClient;
use crate::config::DdlConfig;
use crate::ddl::{
    ConfigMetadataCleaner, DdlContext, DdlOperationKind, DropCollectionOperation,
    OperationHandle, ShardFanoutExecutor, ShardingDdlOperation,
};
use crate::error::{Error, Result};
use crate::lock::{DistLockManager, InMemoryDistLockManager};
use crate::metrics::DdlMetrics;
use crate::network::ShardClient;
use crate::participant::ShardingState;
use crate::routing::CatalogCache;
use crate::types::{Namespace, WriteConcern};
use std::sync::Arc;

/// Runs DDL operations for the databases this shard is primary for.
///
/// Every collaborator is injected; operations share the routing cache,
/// lock manager and metrics of the coordinator that started them.
#[derive(Debug, Clone)]
pub struct DdlCoordinator {
    config: DdlConfig,
    ctx: DdlContext,
}

impl DdlCoordinator {
    pub fn builder(config: DdlConfig) -> DdlCoordinatorBuilder {
        DdlCoordinatorBuilder::new(config)
    }

    pub fn config(&self) -> &DdlConfig {
        &self.config
    }

    /// Start dropping `ns` cluster-wide.
    pub fn drop_collection(&self, ns: Namespace, write_concern: WriteConcern) -> OperationHandle {
        self.start(DropCollectionOperation::new(ns).into(), write_concern)
    }

    /// Drop `ns` cluster-wide and wait for the result.
    pub async fn run_drop_collection(&self, ns: Namespace, write_concern: WriteConcern) -> Result<()> {
        self.drop_collection(ns, write_concern).wait().await
    }

    /// Start any DDL operation.
    pub fn start(&self, kind: DdlOperationKind, write_concern: WriteConcern) -> OperationHandle {
        ShardingDdlOperation::new(kind, write_concern, self.ctx.clone()).start()
    }

    pub fn metrics(&self) -> &Arc<DdlMetrics> {
        &self.ctx.metrics
    }

    pub fn catalog_cache(&self) -> &Arc<CatalogCache> {
        &self.ctx.catalog_cache
    }

    pub fn sharding_state(&self) -> &Arc<ShardingState> {
        &self.ctx.sharding_state
    }

    pub fn locks(&self) -> &Arc<dyn DistLockManager> {
        &self.ctx.locks
    }
}

/// Builder for [`DdlCoordinator`].
pub struct DdlCoordinatorBuilder {
    config: DdlConfig,
    catalog: Option<Arc<dyn CatalogClient>>,
    shard_client: Option<Arc<dyn ShardClient>>,
    locks: Option<Arc<dyn DistLockManager>>,
    sharding_state: Option<Arc<ShardingState>>,
    metrics: Option<Arc<DdlMetrics>>,
}

impl DdlCoordinatorBuilder {
    pub fn new(config: DdlConfig) -> Self {
        Self {
            config,
            catalog: None,
            shard_client: None,
            locks: None,
            sharding_state: None,
            metrics: None,
        }
    }

    /// Set the config store client. Required.
    pub fn catalog(mut self, catalog: Arc<dyn CatalogClient>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Set the client used to reach participants. Required.
    pub fn shard_client(mut self, client: Arc<dyn ShardClient>) -> Self {
        self.shard_client = Some(client);
        self
    }

    /// Set the lock manager. Defaults to a process-local lease table.
    pub fn locks(mut self, locks: Arc<dyn DistLockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Set the local sharding state, shared with this shard's participant.
    pub fn sharding_state(mut self, state: Arc<ShardingState>) -> Self {
        self.sharding_state = Some(state);
        self
    }

    /// Set the metrics instance.
    pub fn metrics(mut self, metrics: Arc<DdlMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the coordinator.
    pub fn build(self) -> Result<DdlCoordinator> {
        self.config.validate()?;
        let catalog = self
            .catalog
            .ok_or_else(|| Error::Config("a catalog client is required".into()))?;
        let shard_client = self
            .shard_client
            .ok_or_else(|| Error::Config("a shard client is required".into()))?;

        let config = self.config;
        let locks = self.locks.unwrap_or_else(|| {
            Arc::new(InMemoryDistLockManager::new(
                config.shard_id.as_str(),
                config.lock.clone(),
            ))
        });
        let sharding_state = self.sharding_state.unwrap_or_else(|| {
            Arc::new(ShardingState::new(config.shard_id.clone(), config.cluster_role))
        });
        if sharding_state.shard_id() != &config.shard_id {
            return Err(Error::Config(format!(
                "sharding state belongs to shard {}, coordinator is configured for {}",
                sharding_state.shard_id(),
                config.shard_id
            )));
        }
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(DdlMetrics::new()));

        let catalog_cache = Arc::new(CatalogCache::new(catalog.clone(), &config.routing_cache));
        let fanout = ShardFanoutExecutor::new(shard_client, config.fanout.clone(), metrics.clone());
        let cleaner = ConfigMetadataCleaner::new(catalog.clone(), catalog_cache.clone(), metrics.clone());

        let ctx = DdlContext {
            shard_id: config.shard_id.clone(),
            lock_config: config.lock.clone(),
            catalog,
            catalog_cache,
            locks,
            sharding_state,
            fanout,
            cleaner,
            metrics,
        };

        Ok(DdlCoordinator { config, ctx })
    }
}
