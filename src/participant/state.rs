//! Shard-local routing state.
//!
//! Every shard keeps the database versions and collection filtering
//! metadata it last learned from the config store. Requests carrying a
//! routing version are checked against this state before touching data.

use crate::error::{Error, Result};
use crate::types::{ChunkVersion, ClusterRole, DatabaseVersion, Namespace, ShardId};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{RwLock as AsyncRwLock, RwLockReadGuard, RwLockWriteGuard};

/// Sharding state of one shard process.
#[derive(Debug)]
pub struct ShardingState {
    shard_id: ShardId,
    cluster_role: ClusterRole,
    databases: DashMap<String, Arc<DatabaseShardingState>>,
    collections: DashMap<Namespace, Arc<CollectionShardingRuntime>>,
}

impl ShardingState {
    pub fn new(shard_id: ShardId, cluster_role: ClusterRole) -> Self {
        Self {
            shard_id,
            cluster_role,
            databases: DashMap::new(),
            collections: DashMap::new(),
        }
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn cluster_role(&self) -> ClusterRole {
        self.cluster_role
    }

    /// State for `db`, created empty on first access.
    pub fn database(&self, db: &str) -> Arc<DatabaseShardingState> {
        self.databases
            .entry(db.to_string())
            .or_insert_with(|| Arc::new(DatabaseShardingState::new(db)))
            .clone()
    }

    /// Runtime for `ns`, created with unknown metadata on first access.
    pub fn collection(&self, ns: &Namespace) -> Arc<CollectionShardingRuntime> {
        self.collections
            .entry(ns.clone())
            .or_insert_with(|| Arc::new(CollectionShardingRuntime::new(ns.clone())))
            .clone()
    }
}

/// Cached version of one database on this shard.
///
/// Local operations take the intent lock in shared mode; a primary move
/// takes it exclusively as its critical section.
#[derive(Debug)]
pub struct DatabaseShardingState {
    db: String,
    version: RwLock<Option<DatabaseVersion>>,
    ddl_lock: AsyncRwLock<()>,
}

impl DatabaseShardingState {
    fn new(db: &str) -> Self {
        Self {
            db: db.to_string(),
            version: RwLock::new(None),
            ddl_lock: AsyncRwLock::new(()),
        }
    }

    /// Intent lock for a local operation. Shared with other intents,
    /// excluded by a critical section.
    pub async fn lock_intent(&self) -> RwLockReadGuard<'_, ()> {
        self.ddl_lock.read().await
    }

    /// Block every intent holder until the guard drops.
    pub async fn enter_critical_section(&self) -> RwLockWriteGuard<'_, ()> {
        self.ddl_lock.write().await
    }

    pub fn version(&self) -> Option<DatabaseVersion> {
        *self.version.read()
    }

    pub fn set_version(&self, version: DatabaseVersion) {
        *self.version.write() = Some(version);
    }

    /// Adopt `version` if none is known yet. Returns whether it was adopted.
    pub fn install_version_if_unknown(&self, version: DatabaseVersion) -> bool {
        let mut current = self.version.write();
        if current.is_some() {
            return false;
        }
        *current = Some(version);
        true
    }

    pub fn clear_version(&self) {
        *self.version.write() = None;
    }

    /// Fails with `StaleDatabaseVersion` unless the cached version is `wanted`.
    pub fn check_db_version(&self, wanted: &DatabaseVersion) -> Result<()> {
        let local = self.version();
        if local.as_ref() == Some(wanted) {
            return Ok(());
        }
        Err(Error::StaleDatabaseVersion {
            db: self.db.clone(),
            wanted: *wanted,
            local,
        })
    }
}

/// Filtering metadata for one collection on this shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilteringMetadata {
    /// Not known; must be refreshed before versioned requests are served.
    Unknown,
    Unsharded,
    Sharded(ChunkVersion),
}

/// Per-collection routing runtime.
#[derive(Debug)]
pub struct CollectionShardingRuntime {
    ns: Namespace,
    metadata: RwLock<FilteringMetadata>,
    critical_section: RwLock<bool>,
    lock: AsyncRwLock<()>,
}

impl CollectionShardingRuntime {
    fn new(ns: Namespace) -> Self {
        Self {
            ns,
            metadata: RwLock::new(FilteringMetadata::Unknown),
            critical_section: RwLock::new(false),
            lock: AsyncRwLock::new(()),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// Collection lock in shared (IS) mode.
    pub async fn lock_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }

    /// Collection lock in exclusive mode.
    pub async fn lock_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().await
    }

    pub fn metadata(&self) -> FilteringMetadata {
        *self.metadata.read()
    }

    pub fn set_filtering_metadata(&self, metadata: FilteringMetadata) {
        *self.metadata.write() = metadata;
    }

    /// Forget the filtering metadata; the next versioned request refreshes it.
    pub fn clear_filtering_metadata(&self) {
        *self.metadata.write() = FilteringMetadata::Unknown;
    }

    /// Mark a chunk migration commit in progress.
    pub fn enter_critical_section(&self) {
        *self.critical_section.write() = true;
    }

    pub fn exit_critical_section(&self) {
        *self.critical_section.write() = false;
    }

    pub fn in_critical_section(&self) -> bool {
        *self.critical_section.read()
    }

    /// Check `received` against the local metadata.
    ///
    /// A migration commit in progress rejects every request, including ones
    /// sent with [`ChunkVersion::IGNORED`]; otherwise `IGNORED` always passes.
    pub fn check_shard_version(&self, received: &ChunkVersion) -> Result<()> {
        if self.in_critical_section() {
            return Err(Error::StaleShardVersion {
                ns: self.ns.to_string(),
                received: *received,
                wanted: None,
            });
        }
        if received.is_ignored() {
            return Ok(());
        }

        let wanted = match self.metadata() {
            FilteringMetadata::Unknown => {
                return Err(Error::StaleShardVersion {
                    ns: self.ns.to_string(),
                    received: *received,
                    wanted: None,
                })
            }
            FilteringMetadata::Unsharded => ChunkVersion::UNSHARDED,
            FilteringMetadata::Sharded(version) => version,
        };

        if received.epoch != wanted.epoch {
            return Err(Error::StaleEpoch {
                ns: self.ns.to_string(),
            });
        }
        if !received.is_write_compatible_with(&wanted) {
            return Err(Error::StaleShardVersion {
                ns: self.ns.to_string(),
                received: *received,
                wanted: Some(wanted),
            });
        }
        Ok(())
    }
}
