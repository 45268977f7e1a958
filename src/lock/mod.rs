//! Distributed locks for DDL operations.
//!
//! A DDL operation holds two named leases for its whole body: one keyed by
//! the database name and one keyed by the full namespace. The database lease
//! is always taken first.
//!
//! Leases have a TTL. While a [`ScopedDistLock`] is held a background task
//! renews its lease every third of the TTL, so a long body keeps the lock.
//! A coordinator that dies stops renewing and loses its locks once the TTL
//! runs out, and another node may retry the operation.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager: Arc<dyn DistLockManager> = Arc::new(InMemoryDistLockManager::new("shardA", LockConfig::default()));
//!
//! let db_lock = ScopedDistLock::acquire(manager.clone(), "app", "dropCollection", timeout).await?;
//! let ns_lock = ScopedDistLock::acquire(manager.clone(), "app.users", "dropCollection", timeout).await?;
//!
//! // ... DDL body ...
//!
//! ns_lock.release().await?;
//! db_lock.release().await?;
//! ```

mod memory;

pub use memory::{InMemoryDistLockManager, LockHolder};

use crate::error::{Error, ErrorKind, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Proof of an acquired lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistLockHandle {
    /// Lock name.
    pub name: String,
    /// Session that owns the lease. Release only succeeds for this session.
    pub session_id: Uuid,
    /// Why the lock was taken, e.g. `"dropCollection"`.
    pub why: String,
}

/// Source of named, TTL-bounded leases in the coordination store.
#[async_trait]
pub trait DistLockManager: Send + Sync + fmt::Debug {
    /// Acquire `name`, waiting up to `timeout` while another session holds it.
    ///
    /// Returns `LockAcquisitionTimeout` if the lease could not be taken in time.
    async fn lock(&self, name: &str, why: &str, timeout: Duration) -> Result<DistLockHandle>;

    /// Release a lease. Releasing a lease that already expired or was taken
    /// over is not an error.
    async fn unlock(&self, handle: &DistLockHandle) -> Result<()>;

    /// Push the lease's expiry a full TTL past now.
    ///
    /// Fails with `LockLost` once another session owns the lease or it was
    /// removed.
    async fn renew(&self, handle: &DistLockHandle) -> Result<()>;

    /// Lifetime of a lease after `lock` or `renew`.
    fn lease_ttl(&self) -> Duration;

    /// Identifier of this process in lock documents.
    fn process_id(&self) -> &str;
}

/// A held lease that is released when the scope ends.
///
/// Prefer [`ScopedDistLock::release`] so release errors can be observed.
/// Dropping without releasing spawns a best-effort unlock on the current
/// runtime; without a runtime the lease TTL frees the lock.
pub struct ScopedDistLock {
    manager: Arc<dyn DistLockManager>,
    handle: DistLockHandle,
    released: bool,
    renewal: JoinHandle<()>,
    lost_rx: watch::Receiver<bool>,
}

impl ScopedDistLock {
    /// Acquire `name` through `manager`.
    pub async fn acquire(
        manager: Arc<dyn DistLockManager>,
        name: &str,
        why: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let handle = manager.lock(name, why, timeout).await?;
        tracing::debug!(lock = name, why, session = %handle.session_id, "Distributed lock acquired");

        let (lost_tx, lost_rx) = watch::channel(false);
        let renewal = tokio::spawn(renew_until_lost(manager.clone(), handle.clone(), lost_tx));
        Ok(Self {
            manager,
            handle,
            released: false,
            renewal,
            lost_rx,
        })
    }

    pub fn handle(&self) -> &DistLockHandle {
        &self.handle
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    /// Whether renewal found the lease owned by someone else.
    pub fn is_lost(&self) -> bool {
        *self.lost_rx.borrow()
    }

    /// Resolves with `LockLost` once the lease is lost; pends while held.
    pub async fn lost(&self) -> Error {
        let mut lost_rx = self.lost_rx.clone();
        if lost_rx.wait_for(|lost| *lost).await.is_err() {
            // Renewal ended without losing the lease: held until release.
            std::future::pending::<()>().await;
        }
        Error::LockLost {
            name: self.handle.name.clone(),
            session: self.handle.session_id,
        }
    }

    /// Release the lease now.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.renewal.abort();
        let result = self.manager.unlock(&self.handle).await;
        match &result {
            Ok(()) => tracing::debug!(lock = %self.handle.name, "Distributed lock released"),
            Err(e) => tracing::warn!(
                lock = %self.handle.name,
                error = %e,
                "Failed to release distributed lock, lease will expire"
            ),
        }
        result
    }
}

impl fmt::Debug for ScopedDistLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedDistLock")
            .field("handle", &self.handle)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for ScopedDistLock {
    fn drop(&mut self) {
        self.renewal.abort();
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let manager = self.manager.clone();
        let handle = self.handle.clone();
        runtime.spawn(async move {
            if let Err(e) = manager.unlock(&handle).await {
                tracing::warn!(lock = %handle.name, error = %e, "Deferred lock release failed");
            }
        });
    }
}

async fn renew_until_lost(
    manager: Arc<dyn DistLockManager>,
    handle: DistLockHandle,
    lost_tx: watch::Sender<bool>,
) {
    let period = (manager.lease_ttl() / 3).max(Duration::from_millis(1));
    loop {
        tokio::time::sleep(period).await;
        match manager.renew(&handle).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::LockLost => {
                tracing::error!(lock = %handle.name, session = %handle.session_id, "Distributed lock lost");
                let _ = lost_tx.send(true);
                return;
            }
            Err(e) => {
                tracing::warn!(lock = %handle.name, error = %e, "Lease renewal failed, retrying");
            }
        }
    }
}
