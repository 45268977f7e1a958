//! Generic coordinator-side execution of a sharded DDL operation.
//!
//! ```text
//!  NotStarted ─► PreconditionsChecked ─► LocksHeld ─► BodyRunning ─┬► Succeeded ─┬► LocksReleased ─► Resolved
//!      │                   │                                       └► Failed ────┘                     ▲
//!      └───────────────────┴──────────────► Failed ───────────────────────────────────────────────────┘
//! ```
//!
//! Preconditions run before any lock is taken: majority write concern, the
//! operation's own validation, ownership of the database (read with a
//! forced refresh) and the local database version, which is filled in from
//! the refreshed entry when this shard has none yet. Then the database lock
//! and the namespace lock are taken, in that order, and held for the whole
//! body. The body is abandoned with `LockLost` if either lease is lost. Both
//! are released before the result is delivered.

use super::cleanup::ConfigMetadataCleaner;
use super::fanout::ShardFanoutExecutor;
use super::DdlOperationKind;
use crate::catalog::CatalogClient;
use crate::config::LockConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::lock::{DistLockManager, ScopedDistLock};
use crate::metrics::DdlMetrics;
use crate::participant::ShardingState;
use crate::routing::CatalogCache;
use crate::types::{Namespace, ShardId, WriteConcern};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Everything an operation needs from the node it runs on.
#[derive(Debug, Clone)]
pub struct DdlContext {
    pub shard_id: ShardId,
    pub lock_config: LockConfig,
    pub catalog: Arc<dyn CatalogClient>,
    pub catalog_cache: Arc<CatalogCache>,
    pub locks: Arc<dyn DistLockManager>,
    pub sharding_state: Arc<ShardingState>,
    pub fanout: ShardFanoutExecutor,
    pub cleaner: ConfigMetadataCleaner,
    pub metrics: Arc<DdlMetrics>,
}

/// Progress of an operation. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperationState {
    NotStarted,
    PreconditionsChecked,
    LocksHeld,
    BodyRunning,
    Succeeded,
    Failed,
    LocksReleased,
    Resolved,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        *self == OperationState::Resolved
    }
}

#[derive(Debug, Default)]
struct Progress {
    transitions: Mutex<Vec<OperationState>>,
}

impl Progress {
    fn current(&self) -> OperationState {
        self.transitions
            .lock()
            .last()
            .copied()
            .unwrap_or(OperationState::NotStarted)
    }

    fn advance(&self, next: OperationState) {
        let mut transitions = self.transitions.lock();
        let current = transitions.last().copied().unwrap_or(OperationState::NotStarted);
        // Succeeded and Failed are alternatives; neither follows the other.
        let skips_outcome =
            current == OperationState::Succeeded && next == OperationState::Failed;
        if next > current && !skips_outcome {
            transitions.push(next);
        }
    }
}

/// One run of a DDL operation.
#[derive(Debug)]
pub struct ShardingDdlOperation {
    id: Uuid,
    kind: DdlOperationKind,
    write_concern: WriteConcern,
    ctx: DdlContext,
    progress: Arc<Progress>,
}

impl ShardingDdlOperation {
    pub fn new(kind: DdlOperationKind, write_concern: WriteConcern, ctx: DdlContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            write_concern,
            ctx,
            progress: Arc::new(Progress::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Spawn the operation on the current runtime.
    ///
    /// Dropping the returned handle does not cancel the operation.
    pub fn start(self) -> OperationHandle {
        let (result_tx, result_rx) = oneshot::channel();
        let handle = OperationHandle {
            id: self.id,
            name: self.kind.name(),
            namespace: self.kind.namespace().clone(),
            progress: self.progress.clone(),
            result_rx,
        };

        tokio::spawn(async move {
            let result = self.run().await;
            self.progress.advance(OperationState::Resolved);
            let _ = result_tx.send(result);
        });

        handle
    }

    /// Run to completion in the calling task.
    pub async fn run(&self) -> Result<()> {
        let started = Instant::now();
        self.ctx.metrics.record_operation_start();
        debug!(op = %self.id, name = self.kind.name(), ns = %self.kind.namespace(), "DDL operation started");

        let result = self.run_phases().await;

        self.kind.cleanup(&self.ctx, &result).await;
        self.ctx
            .metrics
            .record_operation_end(result.is_ok(), started.elapsed());
        if result.is_ok() {
            info!(
                op = %self.id,
                name = self.kind.name(),
                ns = %self.kind.namespace(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "DDL operation succeeded"
            );
        }
        result
    }

    async fn run_phases(&self) -> Result<()> {
        if let Err(e) = self.check_preconditions().await {
            self.progress.advance(OperationState::Failed);
            return Err(e);
        }
        self.progress.advance(OperationState::PreconditionsChecked);

        let (db_lock, ns_lock) = match self.acquire_locks().await {
            Ok(locks) => locks,
            Err(e) => {
                self.progress.advance(OperationState::Failed);
                return Err(e);
            }
        };
        self.progress.advance(OperationState::LocksHeld);

        self.progress.advance(OperationState::BodyRunning);
        // A lost lease may already belong to another coordinator.
        let result = tokio::select! {
            result = self.kind.execute(&self.ctx) => result,
            lost = db_lock.lost() => Err(lost),
            lost = ns_lock.lost() => Err(lost),
        };
        self.progress.advance(if result.is_ok() {
            OperationState::Succeeded
        } else {
            OperationState::Failed
        });

        // A failed release is logged by the lock; the lease expires on its own.
        let _ = ns_lock.release().await;
        let _ = db_lock.release().await;
        self.progress.advance(OperationState::LocksReleased);

        result
    }

    async fn check_preconditions(&self) -> Result<()> {
        if !self.write_concern.is_majority() {
            return Err(Error::InvalidOptions(format!(
                "{} must be called with majority writeConcern, got {}",
                self.kind.command_name(),
                self.write_concern
            )));
        }

        self.kind.validate()?;

        let db = self.kind.namespace().db();
        let entry = self.ctx.catalog_cache.get_database_with_refresh(db).await?;
        if entry.primary != self.ctx.shard_id {
            return Err(Error::NotPrimaryForDatabase {
                db: db.to_string(),
                expected: entry.primary,
                actual: self.ctx.shard_id.clone(),
            });
        }

        let dss = self.ctx.sharding_state.database(db);
        let _intent = dss.lock_intent().await;
        if dss.install_version_if_unknown(entry.version) {
            debug!(db, version = %entry.version, "Installed database version from the config store");
        }
        dss.check_db_version(&entry.version)
    }

    async fn acquire_locks(&self) -> Result<(ScopedDistLock, ScopedDistLock)> {
        let ns = self.kind.namespace();
        let db_lock = self.acquire_lock(ns.db()).await?;
        match self.acquire_lock(&ns.ns()).await {
            Ok(ns_lock) => Ok((db_lock, ns_lock)),
            Err(e) => {
                let _ = db_lock.release().await;
                Err(e)
            }
        }
    }

    async fn acquire_lock(&self, name: &str) -> Result<ScopedDistLock> {
        let result = ScopedDistLock::acquire(
            self.ctx.locks.clone(),
            name,
            self.kind.name(),
            self.ctx.lock_config.acquisition_timeout,
        )
        .await;

        match &result {
            Ok(_) => self.ctx.metrics.locks_acquired.inc(),
            Err(e) if e.kind() == ErrorKind::LockAcquisitionTimeout => {
                self.ctx.metrics.lock_timeouts.inc()
            }
            Err(_) => {}
        }
        result
    }
}

/// Handle to a spawned operation. Resolves exactly once.
#[derive(Debug)]
pub struct OperationHandle {
    id: Uuid,
    name: &'static str,
    namespace: Namespace,
    progress: Arc<Progress>,
    result_rx: oneshot::Receiver<Result<()>>,
}

impl OperationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Latest state reached.
    pub fn state(&self) -> OperationState {
        self.progress.current()
    }

    /// Every state reached so far, in order.
    pub fn transitions(&self) -> Vec<OperationState> {
        self.progress.transitions.lock().clone()
    }

    /// Wait for the result. A task that died without resolving reports
    /// `Cancelled`.
    pub async fn wait(self) -> Result<()> {
        match self.result_rx.await {
            Ok(result) => result,
            Err(_) => {
                error!(op = %self.id, ns = %self.namespace, "DDL operation ended without a result");
                Err(Error::Cancelled)
            }
        }
    }
}
