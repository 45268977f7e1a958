//! Core types shared by the coordinator and the shard participants.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Name of a shard as registered in the config store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(String);

impl ShardId {
    /// Create a shard id from its registry name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The registry name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A `(database, collection)` pair.
///
/// This is the key for namespace locks, participant commands, and every
/// config metadata row that describes a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    db: String,
    coll: String,
}

impl Namespace {
    /// Create a namespace from its parts.
    ///
    /// Fails if either part is empty or the database name contains a dot.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Result<Self> {
        let db = db.into();
        let coll = coll.into();
        if db.is_empty() || coll.is_empty() {
            return Err(Error::InvalidOptions(format!(
                "invalid namespace '{}.{}': database and collection must be non-empty",
                db, coll
            )));
        }
        if db.contains('.') {
            return Err(Error::InvalidOptions(format!(
                "invalid database name '{}': must not contain '.'",
                db
            )));
        }
        Ok(Self { db, coll })
    }

    /// Parse a full `db.collection` string. The collection part may contain dots.
    pub fn parse(full: &str) -> Result<Self> {
        match full.split_once('.') {
            Some((db, coll)) => Self::new(db, coll),
            None => Err(Error::InvalidOptions(format!(
                "invalid namespace '{}': expected 'db.collection'",
                full
            ))),
        }
    }

    /// Database part.
    pub fn db(&self) -> &str {
        &self.db
    }

    /// Collection part.
    pub fn coll(&self) -> &str {
        &self.coll
    }

    /// Whether this is a `system.*` collection.
    pub fn is_system(&self) -> bool {
        self.coll.starts_with("system.")
    }

    /// The full `db.collection` string.
    pub fn ns(&self) -> String {
        format!("{}.{}", self.db, self.coll)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Routing generation of a database.
///
/// The uuid changes when the database is recreated; `last_mod` increases on
/// every primary move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseVersion {
    pub uuid: Uuid,
    pub last_mod: u32,
}

impl DatabaseVersion {
    /// A fresh version for a newly created database.
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            last_mod: 1,
        }
    }

    /// The version after a primary move.
    pub fn next(&self) -> Self {
        Self {
            uuid: self.uuid,
            last_mod: self.last_mod + 1,
        }
    }

    /// Whether `self` is a later generation of the same database than `other`.
    pub fn is_newer_than(&self, other: &DatabaseVersion) -> bool {
        self.uuid == other.uuid && self.last_mod > other.last_mod
    }
}

impl Default for DatabaseVersion {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DatabaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.uuid, self.last_mod)
    }
}

/// Version of a collection's chunk distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkVersion {
    pub major: u32,
    pub minor: u32,
    pub epoch: Uuid,
}

impl ChunkVersion {
    /// Sentinel sent by a coordinator that wants the participant to skip
    /// its own version comparison.
    pub const IGNORED: ChunkVersion = ChunkVersion {
        major: 0,
        minor: 0,
        epoch: Uuid::from_u128(u128::MAX),
    };

    /// Version of an unsharded collection.
    pub const UNSHARDED: ChunkVersion = ChunkVersion {
        major: 0,
        minor: 0,
        epoch: Uuid::nil(),
    };

    pub fn new(major: u32, minor: u32, epoch: Uuid) -> Self {
        Self {
            major,
            minor,
            epoch,
        }
    }

    pub fn is_ignored(&self) -> bool {
        *self == Self::IGNORED
    }

    /// Writes routed with `self` may be applied by a shard at `other`.
    pub fn is_write_compatible_with(&self, other: &ChunkVersion) -> bool {
        self.epoch == other.epoch && self.major == other.major
    }

    pub fn inc_major(&mut self) {
        self.major += 1;
        self.minor = 0;
    }

    pub fn inc_minor(&mut self) {
        self.minor += 1;
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ignored() {
            return f.write_str("IGNORED");
        }
        write!(f, "{}|{}||{}", self.major, self.minor, self.epoch)
    }
}

/// Acknowledgment requirement attached to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteConcern {
    /// Acknowledged by a majority of the replica set.
    Majority,
    /// Acknowledged by the given number of members.
    Nodes(u32),
}

impl WriteConcern {
    pub fn is_majority(&self) -> bool {
        matches!(self, WriteConcern::Majority)
    }
}

impl Default for WriteConcern {
    fn default() -> Self {
        WriteConcern::Nodes(1)
    }
}

impl fmt::Display for WriteConcern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteConcern::Majority => f.write_str("majority"),
            WriteConcern::Nodes(n) => write!(f, "{}", n),
        }
    }
}

/// A shard entry from the config store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub id: ShardId,
    /// Connection string, e.g. `rs0/host1:27018,host2:27018` or `127.0.0.1:9100`.
    pub endpoint: String,
}

impl ShardDescriptor {
    pub fn new(id: impl Into<ShardId>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Role this process plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterRole {
    /// Standalone or plain replica set member.
    None,
    /// Data-holding shard.
    ShardServer,
    /// Config server.
    ConfigServer,
}
