//! Sharded drop collection.

use super::operation::DdlContext;
use crate::catalog::ReadConcern;
use crate::error::{Error, Result};
use crate::network::rpc::ShardCommand;
use crate::types::Namespace;
use tracing::{error, info};

/// Drops a collection on every shard, then removes its config metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropCollectionOperation {
    ns: Namespace,
}

impl DropCollectionOperation {
    pub const NAME: &'static str = "dropCollection";

    /// Command the coordinator is invoked through.
    pub const COMMAND_NAME: &'static str = "_shardsvrDropCollection";

    pub fn new(ns: Namespace) -> Self {
        Self { ns }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.ns.is_system() {
            return Err(Error::IllegalOperation(format!(
                "can't drop system collection {}",
                self.ns
            )));
        }
        Ok(())
    }

    /// Fan out to the shard list read now, then clean up config metadata.
    ///
    /// Shards registered after the list is read are not contacted.
    pub(crate) async fn execute(&self, ctx: &DdlContext) -> Result<()> {
        let shards = ctx.catalog.get_all_shards(ReadConcern::Majority).await?;
        let command = ShardCommand::DropCollectionParticipant {
            ns: self.ns.clone(),
        };

        let summary = ctx.fanout.broadcast(self.ns.db(), &command, &shards).await?;
        info!(
            ns = %self.ns,
            applied = summary.applied.len(),
            already_gone = summary.already_gone.len(),
            stale_retries = summary.stale_retries,
            "Collection dropped on every shard"
        );

        ctx.cleaner.cleanup_namespace(&self.ns).await?;
        Ok(())
    }

    pub(crate) async fn cleanup(&self, _ctx: &DdlContext, result: &Result<()>) {
        if let Err(e) = result {
            error!(ns = %self.ns, error = %e, "Error running drop collection");
        }
    }
}
