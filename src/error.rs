//! Error types for sharded DDL coordination.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{ChunkVersion, DatabaseVersion, ShardId};

/// Result type alias for DDL coordination.
pub type Result<T> = std::result::Result<T, Error>;

/// Wire-stable classification of an [`Error`].
///
/// Remote participants report failures as a kind plus a message; the
/// coordinator's retry and absorption rules are written against kinds only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidOptions,
    IllegalOperation,
    NotPrimaryForDatabase,
    StaleDatabaseVersion,
    StaleShardVersion,
    StaleEpoch,
    NamespaceNotFound,
    LockAcquisitionTimeout,
    LockLost,
    WriteConcernFailed,
    ConfigStore,
    Network,
    Timeout,
    Cancelled,
    Config,
    Internal,
}

impl ErrorKind {
    /// The stale routing version class: the shard's view of the collection
    /// differs from the request's and will converge on its own.
    pub fn is_stale_shard_version(&self) -> bool {
        matches!(self, ErrorKind::StaleShardVersion | ErrorKind::StaleEpoch)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Request options are not acceptable, e.g. a non-majority write concern.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The command cannot run on this node.
    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    /// This node is not the primary shard of the database.
    #[error("this is not the primary shard for db {db} expected: {expected} shardId: {actual}")]
    NotPrimaryForDatabase {
        db: String,
        expected: ShardId,
        actual: ShardId,
    },

    /// The locally cached database version differs from the routing table's.
    #[error("database version mismatch for {db}: wanted {wanted}, local {local:?}")]
    StaleDatabaseVersion {
        db: String,
        wanted: DatabaseVersion,
        local: Option<DatabaseVersion>,
    },

    /// A shard's filtering metadata differs from the version sent.
    #[error("shard version mismatch for {ns}: received {received}, wanted {wanted:?}")]
    StaleShardVersion {
        ns: String,
        received: ChunkVersion,
        wanted: Option<ChunkVersion>,
    },

    /// The collection was dropped and recreated under the sender.
    #[error("epoch mismatch for {ns}")]
    StaleEpoch { ns: String },

    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    /// A distributed lock could not be obtained within its timeout.
    #[error("could not acquire lock '{name}' for {why} within {timeout:?}")]
    LockAcquisitionTimeout {
        name: String,
        why: String,
        timeout: Duration,
    },

    /// A held lease expired or was taken over before it could be renewed.
    #[error("lost lock '{name}' held by session {session}")]
    LockLost { name: String, session: Uuid },

    /// The write was applied but not acknowledged as requested.
    #[error("write concern failed: {0}")]
    WriteConcernFailed(String),

    /// Config store read or write failure.
    #[error("config store error: {0}")]
    ConfigStore(String),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("config error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),

    /// Error reported by a remote participant.
    #[error("{message}")]
    Remote { kind: ErrorKind, message: String },

    /// An error with caller-supplied context. Keeps the wrapped kind.
    #[error("{context} :: caused by :: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Classification of this error, looking through any added context.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidOptions(_) => ErrorKind::InvalidOptions,
            Error::IllegalOperation(_) => ErrorKind::IllegalOperation,
            Error::NotPrimaryForDatabase { .. } => ErrorKind::NotPrimaryForDatabase,
            Error::StaleDatabaseVersion { .. } => ErrorKind::StaleDatabaseVersion,
            Error::StaleShardVersion { .. } => ErrorKind::StaleShardVersion,
            Error::StaleEpoch { .. } => ErrorKind::StaleEpoch,
            Error::NamespaceNotFound(_) => ErrorKind::NamespaceNotFound,
            Error::LockAcquisitionTimeout { .. } => ErrorKind::LockAcquisitionTimeout,
            Error::LockLost { .. } => ErrorKind::LockLost,
            Error::WriteConcernFailed(_) => ErrorKind::WriteConcernFailed,
            Error::ConfigStore(_) => ErrorKind::ConfigStore,
            Error::Network(_) => ErrorKind::Network,
            Error::Config(_) => ErrorKind::Config,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Timeout => ErrorKind::Timeout,
            Error::Internal(_) => ErrorKind::Internal,
            Error::Remote { kind, .. } => *kind,
            Error::Context { source, .. } => source.kind(),
        }
    }

    /// Wrap this error with context.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Rebuild an error received over the wire.
    pub fn remote(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::Remote {
            kind,
            message: message.into(),
        }
    }

    /// Whether this error belongs to the stale routing version class.
    pub fn is_stale_shard_version(&self) -> bool {
        self.kind().is_stale_shard_version()
    }
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("unknown shard: {0}")]
    UnknownShard(ShardId),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_keeps_kind() {
        let err = Error::StaleEpoch { ns: "db.c".into() }
            .with_context("Error dropping collection on shard s1")
            .with_context("outer");
        assert_eq!(err.kind(), ErrorKind::StaleEpoch);
        assert!(err.is_stale_shard_version());

        let msg = err.to_string();
        assert!(msg.starts_with("outer :: caused by :: Error dropping collection on shard s1"));
        assert!(msg.ends_with("epoch mismatch for db.c"));
    }

    #[test]
    fn test_remote_kind() {
        let err = Error::remote(ErrorKind::NamespaceNotFound, "ns not found");
        assert_eq!(err.kind(), ErrorKind::NamespaceNotFound);
        assert!(!err.is_stale_shard_version());
        assert_eq!(err.to_string(), "ns not found");
    }

    #[test]
    fn test_stale_class() {
        assert!(ErrorKind::StaleShardVersion.is_stale_shard_version());
        assert!(ErrorKind::StaleEpoch.is_stale_shard_version());
        assert!(!ErrorKind::StaleDatabaseVersion.is_stale_shard_version());
        assert!(!ErrorKind::NamespaceNotFound.is_stale_shard_version());
    }
}
