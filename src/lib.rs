//! Coordinated DDL for sharded clusters.
//!
//! A DDL operation runs on the primary shard of its database. The primary
//! takes distributed locks on the database and the namespace, tells every
//! shard to apply the change locally, then removes the authoritative
//! metadata from the config store:
//!
//! - **Distributed locks** serialize operations on the same database or
//!   namespace, across processes, with leases that outlive crashed holders
//! - **Shard fan-out** retries stale shard versions with backoff and treats
//!   "already gone" as success, so a drop can be repeated safely
//! - **Participants** check their role, write concern and shard version,
//!   then tear down local data and filtering metadata
//! - **Moka** backs the routing cache, invalidated when a drop finishes
//!
//! # Example
//!
//! ```rust,no_run
//! use shard_ddl::catalog::InMemoryCatalog;
//! use shard_ddl::network::TcpShardClient;
//! use shard_ddl::{DdlConfig, DdlCoordinator, Namespace, WriteConcern};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let catalog = Arc::new(InMemoryCatalog::new());
//!     catalog.create_database("app", "shardA");
//!
//!     let coordinator = DdlCoordinator::builder(DdlConfig::new("shardA"))
//!         .catalog(catalog)
//!         .shard_client(Arc::new(TcpShardClient::new()))
//!         .build()?;
//!
//!     let handle = coordinator.drop_collection(Namespace::new("app", "users")?, WriteConcern::Majority);
//!     handle.wait().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                DdlCoordinator                 │
//! │  drop_collection(ns, wc) -> OperationHandle   │
//! └───────────────────────────────────────────────┘
//!                        │
//!     ┌──────────────────┼──────────────────┐
//!     ▼                  ▼                  ▼
//! ┌──────────┐   ┌───────────────┐   ┌──────────────┐
//! │  Dist    │   │ ShardFanout   │   │ Config store │
//! │  locks   │   │ (ShardClient) │   │ + routing    │
//! └──────────┘   └───────────────┘   └──────────────┘
//!                        │
//!                        ▼
//!              ┌───────────────────┐
//!              │ ParticipantHandler│  (every shard)
//!              └───────────────────┘
//! ```

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod ddl;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod network;
pub mod participant;
pub mod routing;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::{DdlConfig, FanoutConfig, LockConfig, RoutingCacheConfig};
pub use coordinator::{DdlCoordinator, DdlCoordinatorBuilder};
pub use error::{Error, ErrorKind, NetworkError, Result};
pub use types::{
    ChunkVersion, ClusterRole, DatabaseVersion, Namespace, ShardDescriptor, ShardId, WriteConcern,
};

pub use catalog::{CatalogClient, InMemoryCatalog};
pub use ddl::{DdlOperationKind, DropCollectionOperation, OperationHandle, OperationState};
pub use lock::{DistLockManager, InMemoryDistLockManager, ScopedDistLock};
pub use metrics::{DdlMetrics, DdlMetricsSnapshot};
pub use network::{LocalShardClient, ParticipantServer, ShardClient, TcpShardClient};
pub use participant::{InMemoryStorage, LocalStorage, ParticipantHandler, ShardingState};
pub use routing::CatalogCache;

pub use testing::{ScriptedShardClient, TestCluster};
