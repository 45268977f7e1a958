//! In-process lease table implementing [`DistLockManager`].

use super::{DistLockHandle, DistLockManager};
use crate::config::LockConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// Current owner of a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub session_id: Uuid,
    pub process_id: String,
    pub why: String,
}

#[derive(Debug)]
struct Lease {
    holder: LockHolder,
    expires_at: Instant,
}

impl Lease {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Lease table shared by every coordinator in one process.
///
/// Models the coordination store: one holder per name, leases expire after
/// `lease_ttl`, and an expired lease may be taken over by the next caller.
#[derive(Debug)]
pub struct InMemoryDistLockManager {
    process_id: String,
    config: LockConfig,
    leases: Mutex<HashMap<String, Lease>>,
    released: Notify,
}

impl InMemoryDistLockManager {
    pub fn new(process_id: impl Into<String>, config: LockConfig) -> Self {
        Self {
            process_id: process_id.into(),
            config,
            leases: Mutex::new(HashMap::new()),
            released: Notify::new(),
        }
    }

    /// Current live holder of `name`.
    pub fn holder(&self, name: &str) -> Option<LockHolder> {
        let now = Instant::now();
        self.leases
            .lock()
            .get(name)
            .filter(|lease| !lease.is_expired(now))
            .map(|lease| lease.holder.clone())
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.holder(name).is_some()
    }

    /// Drop a lease regardless of owner (admin recovery).
    pub fn force_unlock(&self, name: &str) {
        if self.leases.lock().remove(name).is_some() {
            tracing::warn!(lock = name, "Lease forcibly removed");
            self.released.notify_waiters();
        }
    }

    /// One acquisition attempt. On failure returns the live holder and the
    /// instant its lease runs out.
    fn try_acquire(
        &self,
        name: &str,
        why: &str,
    ) -> std::result::Result<DistLockHandle, (LockHolder, Instant)> {
        let now = Instant::now();
        let mut leases = self.leases.lock();

        if let Some(existing) = leases.get(name) {
            if !existing.is_expired(now) {
                return Err((existing.holder.clone(), existing.expires_at));
            }
            tracing::info!(
                lock = name,
                previous = %existing.holder.session_id,
                "Taking over expired lease"
            );
        }

        let session_id = Uuid::new_v4();
        leases.insert(
            name.to_string(),
            Lease {
                holder: LockHolder {
                    session_id,
                    process_id: self.process_id.clone(),
                    why: why.to_string(),
                },
                expires_at: now + self.config.lease_ttl,
            },
        );
        Ok(DistLockHandle {
            name: name.to_string(),
            session_id,
            why: why.to_string(),
        })
    }
}

#[async_trait]
impl DistLockManager for InMemoryDistLockManager {
    async fn lock(&self, name: &str, why: &str, timeout: Duration) -> Result<DistLockHandle> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register for wake-ups before looking, so a release between the
            // check and the wait is not missed.
            let notified = self.released.notified();

            let (holder, lease_expiry) = match self.try_acquire(name, why) {
                Ok(handle) => return Ok(handle),
                Err(busy) => busy,
            };

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(
                    lock = name,
                    holder = %holder.process_id,
                    held_for = %holder.why,
                    "Lock acquisition timed out"
                );
                return Err(Error::LockAcquisitionTimeout {
                    name: name.to_string(),
                    why: why.to_string(),
                    timeout,
                });
            }

            let wake_at = deadline
                .min(lease_expiry)
                .min(now + self.config.retry_interval);
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn unlock(&self, handle: &DistLockHandle) -> Result<()> {
        let removed = {
            let mut leases = self.leases.lock();
            let owned = leases
                .get(&handle.name)
                .is_some_and(|lease| lease.holder.session_id == handle.session_id);
            owned && leases.remove(&handle.name).is_some()
        };

        if removed {
            self.released.notify_waiters();
        } else {
            tracing::debug!(
                lock = %handle.name,
                session = %handle.session_id,
                "Lease no longer owned by this session, nothing to release"
            );
        }
        Ok(())
    }

    async fn renew(&self, handle: &DistLockHandle) -> Result<()> {
        let mut leases = self.leases.lock();
        match leases.get_mut(&handle.name) {
            Some(lease) if lease.holder.session_id == handle.session_id => {
                lease.expires_at = Instant::now() + self.config.lease_ttl;
                Ok(())
            }
            _ => Err(Error::LockLost {
                name: handle.name.clone(),
                session: handle.session_id,
            }),
        }
    }

    fn lease_ttl(&self) -> Duration {
        self.config.lease_ttl
    }

    fn process_id(&self) -> &str {
        &self.process_id
    }
}
