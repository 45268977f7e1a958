//! Config store access.
//!
//! The config store holds the cluster-wide metadata: registered shards,
//! databases with their primary shard, sharded collections, their chunk
//! distribution and zone (tag) ranges. DDL coordinators read it to find
//! targets and delete from it once every shard has applied a drop.

mod memory;

pub use memory::InMemoryCatalog;

use crate::error::Result;
use crate::types::{ChunkVersion, DatabaseVersion, Namespace, ShardDescriptor, ShardId, WriteConcern};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Collections of the config store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigCollection {
    Shards,
    Databases,
    Collections,
    Chunks,
    Tags,
}

impl ConfigCollection {
    pub fn name(&self) -> &'static str {
        match self {
            ConfigCollection::Shards => "config.shards",
            ConfigCollection::Databases => "config.databases",
            ConfigCollection::Collections => "config.collections",
            ConfigCollection::Chunks => "config.chunks",
            ConfigCollection::Tags => "config.tags",
        }
    }
}

impl fmt::Display for ConfigCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Read concern for config store reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadConcern {
    Local,
    Majority,
}

/// `config.databases` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseType {
    pub name: String,
    pub primary: ShardId,
    pub version: DatabaseVersion,
}

/// `config.collections` entry for a sharded collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionType {
    pub ns: Namespace,
    pub epoch: Uuid,
    pub uuid: Uuid,
    pub key_pattern: String,
}

/// `config.chunks` entry: one contiguous key range owned by a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkType {
    pub ns: Namespace,
    pub min: Bytes,
    pub max: Bytes,
    pub shard: ShardId,
    pub version: ChunkVersion,
}

/// `config.tags` entry: a zone range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagType {
    pub ns: Namespace,
    pub tag: String,
    pub min: Bytes,
    pub max: Bytes,
}

/// Client for the config store.
///
/// Implementations talk to the config servers; [`InMemoryCatalog`] keeps
/// everything in process.
#[async_trait]
pub trait CatalogClient: Send + Sync + fmt::Debug {
    /// Every registered shard.
    async fn get_all_shards(&self, read_concern: ReadConcern) -> Result<Vec<ShardDescriptor>>;

    /// The database entry. Fails with `NamespaceNotFound` if the database
    /// does not exist.
    async fn get_database(&self, db: &str, read_concern: ReadConcern) -> Result<DatabaseType>;

    /// The collection entry, `None` if the collection is not sharded.
    async fn get_collection(&self, ns: &Namespace) -> Result<Option<CollectionType>>;

    /// Chunks of a collection, in key order.
    async fn get_chunks(&self, ns: &Namespace) -> Result<Vec<ChunkType>>;

    /// Zone ranges of a collection.
    async fn get_tags(&self, ns: &Namespace) -> Result<Vec<TagType>>;

    /// Delete every document of `collection` that belongs to `ns`.
    ///
    /// Returns the number of documents removed. Removing nothing is success.
    async fn remove_config_documents(
        &self,
        collection: ConfigCollection,
        ns: &Namespace,
        write_concern: WriteConcern,
    ) -> Result<u64>;
}
