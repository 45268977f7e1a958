//! Coordinator side of sharded DDL.
//!
//! A DDL verb is a variant of [`DdlOperationKind`] providing validation,
//! the body, and a post-run hook. [`ShardingDdlOperation`] runs any of them
//! through the same preconditions and locking:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    ShardingDdlOperation                       │
//! │  preconditions ─► db lock ─► ns lock ─► body ─► release       │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ DropCollection body
//!              ┌─────────────────┴──────────────────┐
//!              ▼                                    ▼
//!   ┌─────────────────────┐             ┌─────────────────────────┐
//!   │ ShardFanoutExecutor │  then       │  ConfigMetadataCleaner  │
//!   │ every shard, retry  │ ──────────► │ chunks, tags, coll row  │
//!   │ on stale version    │             │ + cache invalidation    │
//!   └─────────────────────┘             └─────────────────────────┘
//! ```

mod cleanup;
mod drop_collection;
mod fanout;
mod operation;

pub use cleanup::{CleanupSummary, ConfigMetadataCleaner};
pub use drop_collection::DropCollectionOperation;
pub use fanout::{BroadcastSummary, ShardFanoutExecutor};
pub use operation::{DdlContext, OperationHandle, OperationState, ShardingDdlOperation};

use crate::error::Result;
use crate::types::Namespace;

/// A DDL verb the coordinator can run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdlOperationKind {
    DropCollection(DropCollectionOperation),
}

impl DdlOperationKind {
    /// Name recorded as the reason on distributed locks.
    pub fn name(&self) -> &'static str {
        match self {
            DdlOperationKind::DropCollection(_) => DropCollectionOperation::NAME,
        }
    }

    pub fn command_name(&self) -> &'static str {
        match self {
            DdlOperationKind::DropCollection(_) => DropCollectionOperation::COMMAND_NAME,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        match self {
            DdlOperationKind::DropCollection(op) => op.namespace(),
        }
    }

    /// Checks that need no remote state.
    pub fn validate(&self) -> Result<()> {
        match self {
            DdlOperationKind::DropCollection(op) => op.validate(),
        }
    }

    /// The body, run with both locks held.
    pub async fn execute(&self, ctx: &DdlContext) -> Result<()> {
        match self {
            DdlOperationKind::DropCollection(op) => op.execute(ctx).await,
        }
    }

    /// Runs after the body (or a failed precondition) with the final result.
    pub async fn cleanup(&self, ctx: &DdlContext, result: &Result<()>) {
        match self {
            DdlOperationKind::DropCollection(op) => op.cleanup(ctx, result).await,
        }
    }
}

impl From<DropCollectionOperation> for DdlOperationKind {
    fn from(op: DropCollectionOperation) -> Self {
        DdlOperationKind::DropCollection(op)
    }
}
