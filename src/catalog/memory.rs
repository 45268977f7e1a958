//! In-process config store.

use super::{
    CatalogClient, ChunkType, CollectionType, ConfigCollection, DatabaseType, ReadConcern, TagType,
};
use crate::error::{Error, Result};
use crate::types::{ChunkVersion, DatabaseVersion, Namespace, ShardDescriptor, ShardId, WriteConcern};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Default)]
struct CatalogState {
    shards: Vec<ShardDescriptor>,
    databases: HashMap<String, DatabaseType>,
    collections: HashMap<Namespace, CollectionType>,
    chunks: Vec<ChunkType>,
    tags: Vec<TagType>,
}

/// Config store kept in memory.
///
/// Besides the [`CatalogClient`] operations it offers setup helpers and
/// fault injection for tests.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    state: RwLock<CatalogState>,
    failing_removals: RwLock<HashSet<ConfigCollection>>,
    removal_write_concerns: RwLock<Vec<(ConfigCollection, WriteConcern)>>,
    database_reads: RwLock<Vec<ReadConcern>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shard.
    pub fn add_shard(&self, shard: ShardDescriptor) {
        let mut state = self.state.write();
        state.shards.retain(|s| s.id != shard.id);
        state.shards.push(shard);
    }

    /// Unregister a shard.
    pub fn remove_shard(&self, shard_id: &ShardId) {
        self.state.write().shards.retain(|s| &s.id != shard_id);
    }

    /// Create a database with the given primary. Returns its version.
    pub fn create_database(&self, name: &str, primary: impl Into<ShardId>) -> DatabaseVersion {
        let version = DatabaseVersion::new();
        self.state.write().databases.insert(
            name.to_string(),
            DatabaseType {
                name: name.to_string(),
                primary: primary.into(),
                version,
            },
        );
        version
    }

    /// Move a database's primary and bump its version.
    pub fn move_primary(&self, name: &str, to: impl Into<ShardId>) -> Result<DatabaseVersion> {
        let mut state = self.state.write();
        let db = state
            .databases
            .get_mut(name)
            .ok_or_else(|| Error::NamespaceNotFound(format!("database {} not found", name)))?;
        db.primary = to.into();
        db.version = db.version.next();
        Ok(db.version)
    }

    /// Register a sharded collection with one chunk per `(shard, min, max)`.
    ///
    /// Returns the collection epoch.
    pub fn shard_collection(
        &self,
        ns: &Namespace,
        key_pattern: &str,
        chunks: &[(ShardId, &str, &str)],
    ) -> Uuid {
        let epoch = Uuid::new_v4();
        let mut state = self.state.write();
        state.collections.insert(
            ns.clone(),
            CollectionType {
                ns: ns.clone(),
                epoch,
                uuid: Uuid::new_v4(),
                key_pattern: key_pattern.to_string(),
            },
        );
        state.chunks.retain(|c| &c.ns != ns);
        for (i, (shard, min, max)) in chunks.iter().enumerate() {
            state.chunks.push(ChunkType {
                ns: ns.clone(),
                min: Bytes::copy_from_slice(min.as_bytes()),
                max: Bytes::copy_from_slice(max.as_bytes()),
                shard: shard.clone(),
                version: ChunkVersion::new(1, i as u32, epoch),
            });
        }
        epoch
    }

    /// Add a zone range.
    pub fn add_tag(&self, ns: &Namespace, tag: &str, min: &str, max: &str) {
        self.state.write().tags.push(TagType {
            ns: ns.clone(),
            tag: tag.to_string(),
            min: Bytes::copy_from_slice(min.as_bytes()),
            max: Bytes::copy_from_slice(max.as_bytes()),
        });
    }

    /// Make removals from `collection` fail until cleared.
    pub fn fail_removals_from(&self, collection: ConfigCollection) {
        self.failing_removals.write().insert(collection);
    }

    pub fn clear_failures(&self) {
        self.failing_removals.write().clear();
    }

    /// Number of config rows (collection entry, chunks, tags) still
    /// referencing `ns`.
    pub fn rows_for(&self, ns: &Namespace) -> usize {
        let state = self.state.read();
        usize::from(state.collections.contains_key(ns))
            + state.chunks.iter().filter(|c| &c.ns == ns).count()
            + state.tags.iter().filter(|t| &t.ns == ns).count()
    }

    /// Write concerns used by every removal so far.
    pub fn removal_write_concerns(&self) -> Vec<(ConfigCollection, WriteConcern)> {
        self.removal_write_concerns.read().clone()
    }

    /// Number of database reads served.
    pub fn database_reads(&self) -> u64 {
        self.database_reads.read().len() as u64
    }

    /// Read concern of every database read so far.
    pub fn database_read_concerns(&self) -> Vec<ReadConcern> {
        self.database_reads.read().clone()
    }
}

#[async_trait]
impl CatalogClient for InMemoryCatalog {
    async fn get_all_shards(&self, _read_concern: ReadConcern) -> Result<Vec<ShardDescriptor>> {
        Ok(self.state.read().shards.clone())
    }

    async fn get_database(&self, db: &str, read_concern: ReadConcern) -> Result<DatabaseType> {
        self.database_reads.write().push(read_concern);
        self.state
            .read()
            .databases
            .get(db)
            .cloned()
            .ok_or_else(|| Error::NamespaceNotFound(format!("database {} not found", db)))
    }

    async fn get_collection(&self, ns: &Namespace) -> Result<Option<CollectionType>> {
        Ok(self.state.read().collections.get(ns).cloned())
    }

    async fn get_chunks(&self, ns: &Namespace) -> Result<Vec<ChunkType>> {
        let mut chunks: Vec<ChunkType> = self
            .state
            .read()
            .chunks
            .iter()
            .filter(|c| &c.ns == ns)
            .cloned()
            .collect();
        chunks.sort_by(|a, b| a.min.cmp(&b.min));
        Ok(chunks)
    }

    async fn get_tags(&self, ns: &Namespace) -> Result<Vec<TagType>> {
        Ok(self
            .state
            .read()
            .tags
            .iter()
            .filter(|t| &t.ns == ns)
            .cloned()
            .collect())
    }

    async fn remove_config_documents(
        &self,
        collection: ConfigCollection,
        ns: &Namespace,
        write_concern: WriteConcern,
    ) -> Result<u64> {
        self.removal_write_concerns
            .write()
            .push((collection, write_concern));

        if self.failing_removals.read().contains(&collection) {
            return Err(Error::ConfigStore(format!(
                "injected failure removing {} documents for {}",
                collection, ns
            )));
        }

        let mut state = self.state.write();
        let removed = match collection {
            ConfigCollection::Chunks => {
                let before = state.chunks.len();
                state.chunks.retain(|c| &c.ns != ns);
                before - state.chunks.len()
            }
            ConfigCollection::Tags => {
                let before = state.tags.len();
                state.tags.retain(|t| &t.ns != ns);
                before - state.tags.len()
            }
            ConfigCollection::Collections => usize::from(state.collections.remove(ns).is_some()),
            ConfigCollection::Databases | ConfigCollection::Shards => {
                return Err(Error::IllegalOperation(format!(
                    "{} documents are not keyed by namespace",
                    collection
                )));
            }
        };
        Ok(removed as u64)
    }
}
