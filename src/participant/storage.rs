//! Storage operations a participant needs from its node.

use crate::error::{Error, ErrorKind, Result};
use crate::types::{Namespace, WriteConcern};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Local storage engine and shard-local bookkeeping collections.
#[async_trait]
pub trait LocalStorage: Send + Sync + fmt::Debug {
    /// Drop the collection. `NamespaceNotFound` if it does not exist.
    async fn drop_collection(&self, ns: &Namespace) -> Result<()>;

    /// Remove cached routing rows (collection entry and chunks) for `ns`.
    async fn remove_cached_collection_metadata(&self, ns: &Namespace) -> Result<()>;

    /// Remove pending range deletion tasks for `ns`. Returns how many.
    async fn remove_range_deletions(&self, ns: &Namespace) -> Result<u64>;

    /// Wait until this node's writes satisfy `write_concern`.
    async fn wait_for_write_concern(&self, write_concern: WriteConcern) -> Result<()>;
}

/// [`LocalStorage`] kept in memory, with fault injection.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    collections: DashSet<Namespace>,
    cached_metadata: DashSet<Namespace>,
    range_deletions: DashMap<Namespace, u64>,
    drop_failure: Mutex<Option<ErrorKind>>,
    write_concern_failure: Mutex<Option<String>>,
    drops: AtomicU64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collection along with its cached routing rows.
    pub fn create_collection(&self, ns: &Namespace) {
        self.collections.insert(ns.clone());
        self.cached_metadata.insert(ns.clone());
    }

    pub fn add_range_deletions(&self, ns: &Namespace, count: u64) {
        *self.range_deletions.entry(ns.clone()).or_insert(0) += count;
    }

    pub fn has_collection(&self, ns: &Namespace) -> bool {
        self.collections.contains(ns)
    }

    pub fn has_cached_metadata(&self, ns: &Namespace) -> bool {
        self.cached_metadata.contains(ns)
    }

    pub fn pending_range_deletions(&self, ns: &Namespace) -> u64 {
        self.range_deletions.get(ns).map(|e| *e.value()).unwrap_or(0)
    }

    /// Number of drop calls served (including failed ones).
    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Make every drop fail with `kind` until cleared with `None`.
    pub fn fail_drops_with(&self, kind: Option<ErrorKind>) {
        *self.drop_failure.lock() = kind;
    }

    /// Make write concern waits fail with `message` until cleared with `None`.
    pub fn fail_write_concern(&self, message: Option<String>) {
        *self.write_concern_failure.lock() = message;
    }
}

#[async_trait]
impl LocalStorage for InMemoryStorage {
    async fn drop_collection(&self, ns: &Namespace) -> Result<()> {
        self.drops.fetch_add(1, Ordering::Relaxed);
        if let Some(kind) = *self.drop_failure.lock() {
            return Err(Error::remote(kind, format!("injected drop failure for {}", ns)));
        }
        if self.collections.remove(ns).is_none() {
            return Err(Error::NamespaceNotFound(format!("ns not found: {}", ns)));
        }
        Ok(())
    }

    async fn remove_cached_collection_metadata(&self, ns: &Namespace) -> Result<()> {
        self.cached_metadata.remove(ns);
        Ok(())
    }

    async fn remove_range_deletions(&self, ns: &Namespace) -> Result<u64> {
        Ok(self.range_deletions.remove(ns).map(|(_, n)| n).unwrap_or(0))
    }

    async fn wait_for_write_concern(&self, write_concern: WriteConcern) -> Result<()> {
        match self.write_concern_failure.lock().clone() {
            Some(message) => Err(Error::WriteConcernFailed(format!(
                "{} (w: {})",
                message, write_concern
            ))),
            None => Ok(()),
        }
    }
}
