//! Process-local routing cache.
//!
//! Caches database entries (primary shard + version) and collection routing
//! tables (collection entry + chunks) read from the config store. Entries
//! are never patched in place: a DDL coordinator invalidates them and the
//! next reader reloads from the config store.

use crate::catalog::{CatalogClient, ChunkType, CollectionType, DatabaseType, ReadConcern};
use crate::config::RoutingCacheConfig;
use crate::error::Result;
use crate::types::{ChunkVersion, Namespace, ShardId};
use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Routing table for one namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionRoutingInfo {
    pub ns: Namespace,
    /// `None` when the collection is not sharded (or does not exist).
    pub collection: Option<CollectionType>,
    pub chunks: Vec<ChunkType>,
}

impl CollectionRoutingInfo {
    pub fn is_sharded(&self) -> bool {
        self.collection.is_some()
    }

    /// Highest chunk version, or `UNSHARDED`.
    pub fn version(&self) -> ChunkVersion {
        self.chunks
            .iter()
            .map(|c| c.version)
            .max_by_key(|v| (v.major, v.minor))
            .unwrap_or(ChunkVersion::UNSHARDED)
    }

    /// Shards owning at least one chunk, sorted.
    pub fn shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self.chunks.iter().map(|c| c.shard.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Moka-backed cache over a [`CatalogClient`].
#[derive(Debug)]
pub struct CatalogCache {
    catalog: Arc<dyn CatalogClient>,
    databases: Cache<String, DatabaseType>,
    collections: Cache<Namespace, Arc<CollectionRoutingInfo>>,
    database_refreshes: AtomicU64,
    collection_refreshes: AtomicU64,
}

impl CatalogCache {
    pub fn new(catalog: Arc<dyn CatalogClient>, config: &RoutingCacheConfig) -> Self {
        let mut databases = Cache::<String, DatabaseType>::builder().max_capacity(config.max_capacity);
        let mut collections = Cache::<Namespace, Arc<CollectionRoutingInfo>>::builder().max_capacity(config.max_capacity);
        if let Some(ttl) = config.time_to_live {
            databases = databases.time_to_live(ttl);
            collections = collections.time_to_live(ttl);
        }

        Self {
            catalog,
            databases: databases.build(),
            collections: collections.build(),
            database_refreshes: AtomicU64::new(0),
            collection_refreshes: AtomicU64::new(0),
        }
    }

    /// Cached database entry, loading it on a miss with local read concern.
    pub async fn get_database(&self, db: &str) -> Result<DatabaseType> {
        if let Some(entry) = self.databases.get(db).await {
            return Ok(entry);
        }
        self.refresh_database(db, ReadConcern::Local).await
    }

    /// Database entry read from the config store with majority read concern,
    /// replacing any cached one.
    pub async fn get_database_with_refresh(&self, db: &str) -> Result<DatabaseType> {
        self.databases.invalidate(db).await;
        self.refresh_database(db, ReadConcern::Majority).await
    }

    /// Cached routing table for `ns`, loading it on a miss.
    pub async fn get_collection_routing_info(
        &self,
        ns: &Namespace,
    ) -> Result<Arc<CollectionRoutingInfo>> {
        if let Some(entry) = self.collections.get(ns).await {
            return Ok(entry);
        }

        self.collection_refreshes.fetch_add(1, Ordering::Relaxed);
        let collection = self.catalog.get_collection(ns).await?;
        let chunks = if collection.is_some() {
            self.catalog.get_chunks(ns).await?
        } else {
            Vec::new()
        };
        let info = Arc::new(CollectionRoutingInfo {
            ns: ns.clone(),
            collection,
            chunks,
        });
        self.collections.insert(ns.clone(), info.clone()).await;
        tracing::debug!(%ns, version = %info.version(), "Collection routing info refreshed");
        Ok(info)
    }

    /// Collection entry of `ns` through the cache, `None` if not sharded.
    pub async fn get_collection(&self, ns: &Namespace) -> Result<Option<CollectionType>> {
        Ok(self.get_collection_routing_info(ns).await?.collection.clone())
    }

    /// Drop the cached routing table for `ns`.
    pub async fn invalidate_collection(&self, ns: &Namespace) {
        self.collections.invalidate(ns).await;
        tracing::debug!(%ns, "Collection routing entry invalidated");
    }

    /// Drop the cached entry for database `db`.
    pub async fn invalidate_database(&self, db: &str) {
        self.databases.invalidate(db).await;
    }

    pub fn is_collection_cached(&self, ns: &Namespace) -> bool {
        self.collections.contains_key(ns)
    }

    /// Number of database entries loaded from the config store.
    pub fn database_refresh_count(&self) -> u64 {
        self.database_refreshes.load(Ordering::Relaxed)
    }

    /// Number of collection routing tables loaded from the config store.
    pub fn collection_refresh_count(&self) -> u64 {
        self.collection_refreshes.load(Ordering::Relaxed)
    }

    /// Total config store loads of either kind.
    pub fn refresh_count(&self) -> u64 {
        self.database_refresh_count() + self.collection_refresh_count()
    }

    async fn refresh_database(&self, db: &str, read_concern: ReadConcern) -> Result<DatabaseType> {
        self.database_refreshes.fetch_add(1, Ordering::Relaxed);
        let entry = self.catalog.get_database(db, read_concern).await?;
        self.databases.insert(db.to_string(), entry.clone()).await;
        Ok(entry)
    }
}
