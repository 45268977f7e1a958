//! Testing utilities for sharded DDL.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          TestCluster                            │
//! │                                                                 │
//! │   InMemoryCatalog ◄──────── DdlCoordinator (any shard)          │
//! │   InMemoryDistLockManager ◄──┘        │                         │
//! │                                       ▼                         │
//! │                              LocalShardClient                   │
//! │                     ┌─────────────┼─────────────┐               │
//! │                     ▼             ▼             ▼               │
//! │               TestShard a   TestShard b   TestShard c           │
//! │             (state, storage, ParticipantHandler)                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`ScriptedShardClient`] replaces the participants entirely when a test
//! needs exact control over every reply.

mod drop_collection_tests;

use crate::catalog::InMemoryCatalog;
use crate::config::{DdlConfig, FanoutConfig, LockConfig};
use crate::coordinator::DdlCoordinator;
use crate::error::{ErrorKind, NetworkError, Result};
use crate::lock::InMemoryDistLockManager;
use crate::network::rpc::{CommandStatus, ShardCommandRequest, ShardCommandResponse};
use crate::network::{LocalShardClient, ShardClient};
use crate::participant::{FilteringMetadata, InMemoryStorage, ParticipantHandler, ShardingState};
use crate::types::{
    ChunkVersion, ClusterRole, DatabaseVersion, Namespace, ShardDescriptor, ShardId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A reply a [`ScriptedShardClient`] will give.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    status: CommandStatus,
    write_concern_error: Option<String>,
}

impl ScriptedReply {
    pub fn with_write_concern_error(mut self, message: impl Into<String>) -> Self {
        self.write_concern_error = Some(message.into());
        self
    }

    fn to_response(&self, request_id: u64) -> ShardCommandResponse {
        ShardCommandResponse {
            request_id,
            status: self.status.clone(),
            write_concern_error: self.write_concern_error.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    queued: HashMap<ShardId, VecDeque<ScriptedReply>>,
    defaults: HashMap<ShardId, ScriptedReply>,
    transport_failures: HashMap<ShardId, u32>,
    requests: Vec<(ShardId, ShardCommandRequest)>,
}

/// [`ShardClient`] answering from per-shard scripts.
///
/// Each shard replies with its queued replies in order, then with its
/// default reply (plain success unless set).
#[derive(Debug, Default)]
pub struct ScriptedShardClient {
    state: Mutex<ScriptState>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedShardClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok() -> ScriptedReply {
        ScriptedReply {
            status: CommandStatus::Ok,
            write_concern_error: None,
        }
    }

    pub fn error(kind: ErrorKind) -> ScriptedReply {
        ScriptedReply {
            status: CommandStatus::Error {
                kind,
                message: format!("scripted {}", kind),
            },
            write_concern_error: None,
        }
    }

    /// Queue replies for `shard`.
    pub fn script(&self, shard: &str, replies: impl IntoIterator<Item = ScriptedReply>) {
        self.state
            .lock()
            .queued
            .entry(ShardId::new(shard))
            .or_default()
            .extend(replies);
    }

    /// Reply for `shard` once its queue is empty.
    pub fn set_default(&self, shard: &str, reply: ScriptedReply) {
        self.state.lock().defaults.insert(ShardId::new(shard), reply);
    }

    /// Fail the next `count` commands to `shard` with a connection error.
    pub fn fail_transport(&self, shard: &str, count: u32) {
        self.state
            .lock()
            .transport_failures
            .insert(ShardId::new(shard), count);
    }

    /// Delay every reply.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Every request received, in arrival order.
    pub fn requests(&self) -> Vec<ShardCommandRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Number of requests `shard` received.
    pub fn sent_to(&self, shard: &str) -> usize {
        let shard = ShardId::new(shard);
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(id, _)| *id == shard)
            .count()
    }

    /// Highest number of commands outstanding at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, shard: &ShardId, request: &ShardCommandRequest) -> Option<ScriptedReply> {
        let mut state = self.state.lock();
        state.requests.push((shard.clone(), request.clone()));

        if let Some(remaining) = state.transport_failures.get_mut(shard) {
            if *remaining > 0 {
                *remaining -= 1;
                return None;
            }
        }

        let queued = state.queued.get_mut(shard).and_then(|q| q.pop_front());
        Some(
            queued
                .or_else(|| state.defaults.get(shard).cloned())
                .unwrap_or_else(Self::ok),
        )
    }
}

#[async_trait]
impl ShardClient for ScriptedShardClient {
    async fn run_command(
        &self,
        shard: &ShardDescriptor,
        request: ShardCommandRequest,
    ) -> Result<ShardCommandResponse> {
        let reply = self.next_reply(&shard.id, &request);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match reply {
            Some(reply) => Ok(reply.to_response(request.request_id)),
            None => Err(NetworkError::ConnectionFailed {
                addr: shard.endpoint.clone(),
                reason: "scripted transport failure".into(),
            }
            .into()),
        }
    }
}

/// One shard of a [`TestCluster`].
#[derive(Debug, Clone)]
pub struct TestShard {
    pub id: ShardId,
    pub state: Arc<ShardingState>,
    pub storage: Arc<InMemoryStorage>,
    pub handler: Arc<ParticipantHandler>,
}

/// In-process cluster: a config store, a shared lock table, and shards
/// reachable through a [`LocalShardClient`].
#[derive(Debug)]
pub struct TestCluster {
    pub catalog: Arc<InMemoryCatalog>,
    pub locks: Arc<InMemoryDistLockManager>,
    pub client: Arc<LocalShardClient>,
    pub shards: Vec<TestShard>,
}

impl TestCluster {
    /// A cluster of data-holding shards with the given names.
    pub fn new(shard_ids: &[&str]) -> Self {
        Self::with_lock_config(
            shard_ids,
            LockConfig::default().with_retry_interval(Duration::from_millis(5)),
        )
    }

    pub fn with_lock_config(shard_ids: &[&str], lock_config: LockConfig) -> Self {
        let catalog = Arc::new(InMemoryCatalog::new());
        let locks = Arc::new(InMemoryDistLockManager::new("config", lock_config));
        let client = Arc::new(LocalShardClient::new());

        let shards = shard_ids
            .iter()
            .map(|id| {
                let id = ShardId::new(*id);
                let state = Arc::new(ShardingState::new(id.clone(), ClusterRole::ShardServer));
                let storage = Arc::new(InMemoryStorage::new());
                let handler = Arc::new(ParticipantHandler::new(state.clone(), storage.clone()));

                catalog.add_shard(ShardDescriptor::new(id.clone(), format!("local/{}", id)));
                client.register(id.clone(), handler.clone());

                TestShard {
                    id,
                    state,
                    storage,
                    handler,
                }
            })
            .collect();

        Self {
            catalog,
            locks,
            client,
            shards,
        }
    }

    /// The shard named `id`.
    ///
    /// # Panics
    ///
    /// If the cluster has no such shard.
    pub fn shard(&self, id: &str) -> &TestShard {
        self.shards
            .iter()
            .find(|s| s.id.as_str() == id)
            .unwrap_or_else(|| panic!("no shard {} in test cluster", id))
    }

    /// Create `db` with `primary` as its primary shard, and teach the
    /// primary its version.
    pub fn create_database(&self, db: &str, primary: &str) -> DatabaseVersion {
        let version = self.catalog.create_database(db, primary);
        self.shard(primary).state.database(db).set_version(version);
        version
    }

    /// Shard `ns` with one chunk on each of `owners`, creating the
    /// collection and filtering metadata on those shards.
    pub fn create_sharded_collection(&self, ns: &Namespace, owners: &[&str]) {
        let count = owners.len();
        let bounds: Vec<(ShardId, String, String)> = owners
            .iter()
            .enumerate()
            .map(|(i, owner)| (ShardId::new(*owner), split_point(i, count), split_point(i + 1, count)))
            .collect();
        let chunks: Vec<(ShardId, &str, &str)> = bounds
            .iter()
            .map(|(shard, min, max)| (shard.clone(), min.as_str(), max.as_str()))
            .collect();

        let epoch = self.catalog.shard_collection(ns, "{_id: 1}", &chunks);
        for owner in owners {
            let shard = self.shard(owner);
            shard.storage.create_collection(ns);
            shard
                .state
                .collection(ns)
                .set_filtering_metadata(FilteringMetadata::Sharded(ChunkVersion::new(1, 0, epoch)));
        }
    }

    /// Configuration used by test coordinators: no backoff sleeps and a
    /// short lock timeout.
    pub fn coordinator_config(&self, shard: &str) -> DdlConfig {
        DdlConfig::new(shard)
            .with_lock_timeout(Duration::from_millis(500))
            .with_fanout_config(FanoutConfig::immediate())
    }

    /// A coordinator running on `shard`, wired to the cluster.
    pub fn coordinator(&self, shard: &str) -> DdlCoordinator {
        self.coordinator_with(self.coordinator_config(shard), self.client.clone())
    }

    /// A coordinator with custom configuration and participant client.
    ///
    /// # Panics
    ///
    /// If the configuration is invalid or names an unknown shard.
    pub fn coordinator_with(&self, config: DdlConfig, client: Arc<dyn ShardClient>) -> DdlCoordinator {
        let state = self.shard(config.shard_id.as_str()).state.clone();
        DdlCoordinator::builder(config)
            .catalog(self.catalog.clone())
            .locks(self.locks.clone())
            .shard_client(client)
            .sharding_state(state)
            .build()
            .unwrap_or_else(|e| panic!("invalid test coordinator: {}", e))
    }
}

/// Key `i` of `count` evenly spaced split points over `"" .. "~"`.
fn split_point(i: usize, count: usize) -> String {
    if i == 0 {
        return String::new();
    }
    if i >= count {
        return "~".to_string();
    }
    let step = 26 / count.max(1);
    ((b'a' + (i * step) as u8) as char).to_string()
}
