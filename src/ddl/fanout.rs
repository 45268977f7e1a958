//! Broadcast of an idempotent participant command to a fixed shard list.
//!
//! Each shard's reply is classified:
//!
//! | reply                         | action                                   |
//! |-------------------------------|------------------------------------------|
//! | write concern error           | fail the broadcast                       |
//! | ok                            | next shard                               |
//! | `NamespaceNotFound`           | next shard (already gone)                |
//! | stale shard version / epoch   | resend, up to `max_stale_retries` tries  |
//! | anything else                 | fail the broadcast                       |
//!
//! A connection failure or timeout leaves the outcome unknown; the same
//! request is resent up to `max_transport_retries` times, which is safe
//! because the command is idempotent.

use crate::config::FanoutConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::metrics::{DdlMetrics, ShardOutcome};
use crate::network::rpc::{ShardCommand, ShardCommandRequest, ShardCommandResponse};
use crate::network::ShardClient;
use crate::types::{ShardDescriptor, ShardId};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// What a broadcast did on each shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastSummary {
    /// Shards that applied the command.
    pub applied: Vec<ShardId>,
    /// Shards that reported `NamespaceNotFound`.
    pub already_gone: Vec<ShardId>,
    /// Resends caused by stale shard versions, over all shards.
    pub stale_retries: u32,
}

impl BroadcastSummary {
    fn record(&mut self, shard: ShardId, reply: ShardReply) {
        self.stale_retries += reply.stale_retries;
        if reply.already_gone {
            self.already_gone.push(shard);
        } else {
            self.applied.push(shard);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ShardReply {
    already_gone: bool,
    stale_retries: u32,
}

/// Sends participant commands with the retry policy of a [`FanoutConfig`].
#[derive(Debug, Clone)]
pub struct ShardFanoutExecutor {
    client: Arc<dyn ShardClient>,
    config: FanoutConfig,
    metrics: Arc<DdlMetrics>,
    next_request_id: Arc<AtomicU64>,
}

impl ShardFanoutExecutor {
    pub fn new(client: Arc<dyn ShardClient>, config: FanoutConfig, metrics: Arc<DdlMetrics>) -> Self {
        Self {
            client,
            config,
            metrics,
            next_request_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    /// Run `command` on every shard in `shards`.
    ///
    /// Stops at the first shard that fails; shards already contacted keep
    /// whatever the command did there.
    pub async fn broadcast(
        &self,
        db: &str,
        command: &ShardCommand,
        shards: &[ShardDescriptor],
    ) -> Result<BroadcastSummary> {
        debug!(
            command = command.name(),
            ns = %command.namespace(),
            shards = shards.len(),
            parallel = self.config.parallel,
            "Broadcasting to shards"
        );

        if self.config.parallel {
            self.broadcast_parallel(db, command, shards).await
        } else {
            self.broadcast_sequential(db, command, shards).await
        }
    }

    async fn broadcast_sequential(
        &self,
        db: &str,
        command: &ShardCommand,
        shards: &[ShardDescriptor],
    ) -> Result<BroadcastSummary> {
        let mut summary = BroadcastSummary::default();
        for shard in shards {
            let reply = self.run_on_shard(db, command, shard).await?;
            summary.record(shard.id.clone(), reply);
        }
        Ok(summary)
    }

    async fn broadcast_parallel(
        &self,
        db: &str,
        command: &ShardCommand,
        shards: &[ShardDescriptor],
    ) -> Result<BroadcastSummary> {
        let mut tasks = JoinSet::new();
        for shard in shards {
            let executor = self.clone();
            let db = db.to_string();
            let command = command.clone();
            let shard = shard.clone();
            tasks.spawn(async move {
                let reply = executor.run_on_shard(&db, &command, &shard).await;
                (shard.id, reply)
            });
        }

        let mut summary = BroadcastSummary::default();
        while let Some(joined) = tasks.join_next().await {
            let (shard_id, reply) = joined
                .map_err(|e| Error::Internal(format!("fan-out task failed: {}", e)))?;
            match reply {
                Ok(reply) => summary.record(shard_id, reply),
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        // Report shards in the order given, not completion order.
        let position = |id: &ShardId| shards.iter().position(|s| &s.id == id);
        summary.applied.sort_by_key(|id| position(id));
        summary.already_gone.sort_by_key(|id| position(id));
        Ok(summary)
    }

    /// Run `command` on one shard until it succeeds, is already gone, or
    /// fails terminally.
    async fn run_on_shard(
        &self,
        db: &str,
        command: &ShardCommand,
        shard: &ShardDescriptor,
    ) -> Result<ShardReply> {
        let context = command.failure_context(shard.id.as_str());
        let mut stale_attempts: u32 = 0;

        loop {
            let response = match self.send_with_transport_retry(db, command, shard).await {
                Ok(response) => response,
                Err(e) => {
                    self.metrics
                        .record_shard_command(shard.id.as_str(), ShardOutcome::Failed);
                    return Err(e.with_context(context));
                }
            };

            if let Some(wc_error) = response.write_concern_error {
                self.metrics
                    .record_shard_command(shard.id.as_str(), ShardOutcome::Failed);
                return Err(Error::WriteConcernFailed(wc_error).with_context(context));
            }

            let status = match response.status.into_result() {
                Ok(()) => {
                    self.metrics
                        .record_shard_command(shard.id.as_str(), ShardOutcome::Ok);
                    return Ok(ShardReply {
                        already_gone: false,
                        stale_retries: stale_attempts,
                    });
                }
                Err(status) => status,
            };

            match status.kind() {
                ErrorKind::NamespaceNotFound => {
                    self.metrics
                        .record_shard_command(shard.id.as_str(), ShardOutcome::NamespaceNotFound);
                    info!(shard = %shard.id, ns = %command.namespace(), "Namespace not found");
                    return Ok(ShardReply {
                        already_gone: true,
                        stale_retries: stale_attempts,
                    });
                }
                kind if kind.is_stale_shard_version() => {
                    self.metrics
                        .record_shard_command(shard.id.as_str(), ShardOutcome::Stale);
                    stale_attempts += 1;
                    if stale_attempts >= self.config.max_stale_retries {
                        warn!(
                            shard = %shard.id,
                            attempts = stale_attempts,
                            error = %status,
                            "Giving up on stale shard"
                        );
                        return Err(status.with_context(format!(
                            "{} due to exceeded retry attempts",
                            context
                        )));
                    }
                    // Sent with IGNORED: the shard serializes the drop behind its
                    // own refresh, so resend without refreshing here.
                    let delay = self.stale_backoff(stale_attempts);
                    debug!(
                        shard = %shard.id,
                        attempt = stale_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Stale shard version, resending"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                _ => {
                    self.metrics
                        .record_shard_command(shard.id.as_str(), ShardOutcome::Failed);
                    return Err(status.with_context(context));
                }
            }
        }
    }

    async fn send_with_transport_retry(
        &self,
        db: &str,
        command: &ShardCommand,
        shard: &ShardDescriptor,
    ) -> Result<ShardCommandResponse> {
        let mut attempts: u32 = 0;
        loop {
            let request = ShardCommandRequest::new(
                self.next_request_id.fetch_add(1, Ordering::Relaxed),
                db,
                command.clone(),
            );

            let result = match tokio::time::timeout(
                self.config.rpc_timeout,
                self.client.run_command(shard, request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if is_transport_error(&e) && attempts < self.config.max_transport_retries => {
                    attempts += 1;
                    warn!(shard = %shard.id, attempt = attempts, error = %e, "Resending after transport failure");
                    let delay = self.config.backoff_for(attempts);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Capped exponential backoff plus up to 50% jitter.
    fn stale_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_for(attempt);
        if !self.config.jitter || base.is_zero() {
            return base;
        }
        let max_jitter = (base.as_millis() as u64 / 2).max(1);
        base + Duration::from_millis(rand::rng().random_range(0..=max_jitter))
    }
}

fn is_transport_error(e: &Error) -> bool {
    matches!(e.kind(), ErrorKind::Network | ErrorKind::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedShardClient;
    use crate::types::Namespace;

    fn command() -> ShardCommand {
        ShardCommand::DropCollectionParticipant {
            ns: Namespace::new("app", "users").unwrap(),
        }
    }

    fn shards(ids: &[&str]) -> Vec<ShardDescriptor> {
        ids.iter().map(|id| ShardDescriptor::new(*id, "local")).collect()
    }

    fn executor(client: Arc<ScriptedShardClient>, config: FanoutConfig) -> (ShardFanoutExecutor, Arc<DdlMetrics>) {
        let metrics = Arc::new(DdlMetrics::new());
        (ShardFanoutExecutor::new(client, config, metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn test_not_found_is_absorbed() {
        let client = Arc::new(ScriptedShardClient::new());
        client.script("a", [ScriptedShardClient::error(ErrorKind::NamespaceNotFound)]);
        client.script("c", [ScriptedShardClient::error(ErrorKind::NamespaceNotFound)]);
        let (executor, metrics) = executor(client.clone(), FanoutConfig::immediate());

        let summary = executor
            .broadcast("app", &command(), &shards(&["a", "b", "c"]))
            .await
            .unwrap();
        assert_eq!(summary.applied, vec![ShardId::new("b")]);
        assert_eq!(summary.already_gone, vec![ShardId::new("a"), ShardId::new("c")]);
        assert_eq!(metrics.shard_commands_for("a", ShardOutcome::NamespaceNotFound), 1);

        for request in client.requests() {
            assert!(request.write_concern.is_majority());
            assert!(request.shard_version.is_ignored());
        }
    }

    #[tokio::test]
    async fn test_stale_resent_until_success() {
        let client = Arc::new(ScriptedShardClient::new());
        client.script(
            "a",
            [
                ScriptedShardClient::error(ErrorKind::StaleShardVersion),
                ScriptedShardClient::error(ErrorKind::StaleEpoch),
                ScriptedShardClient::ok(),
            ],
        );
        let (executor, metrics) = executor(client.clone(), FanoutConfig::immediate());

        let summary = executor
            .broadcast("app", &command(), &shards(&["a"]))
            .await
            .unwrap();
        assert_eq!(summary.stale_retries, 2);
        assert_eq!(client.sent_to("a"), 3);
        assert_eq!(metrics.snapshot().stale_retries, 2);
    }

    #[tokio::test]
    async fn test_stale_ceiling() {
        let client = Arc::new(ScriptedShardClient::new());
        client.set_default("b", ScriptedShardClient::error(ErrorKind::StaleShardVersion));
        let (executor, _) = executor(client.clone(), FanoutConfig::immediate());

        let err = executor
            .broadcast("app", &command(), &shards(&["a", "b"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StaleShardVersion);
        assert!(err
            .to_string()
            .starts_with("Error dropping collection on shard b due to exceeded retry attempts"));
        assert_eq!(client.sent_to("b"), 10);
    }

    #[tokio::test]
    async fn test_hard_error_aborts_remaining() {
        let client = Arc::new(ScriptedShardClient::new());
        client.script("b", [ScriptedShardClient::error(ErrorKind::IllegalOperation)]);
        let (executor, _) = executor(client.clone(), FanoutConfig::immediate());

        let err = executor
            .broadcast("app", &command(), &shards(&["a", "b", "c"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalOperation);
        assert!(err.to_string().starts_with("Error dropping collection on shard b"));
        assert_eq!(client.sent_to("c"), 0);
    }

    #[tokio::test]
    async fn test_write_concern_error_fails_even_when_not_found() {
        let client = Arc::new(ScriptedShardClient::new());
        client.script(
            "a",
            [ScriptedShardClient::error(ErrorKind::NamespaceNotFound)
                .with_write_concern_error("waiting for replication timed out")],
        );
        let (executor, _) = executor(client.clone(), FanoutConfig::immediate());

        let err = executor
            .broadcast("app", &command(), &shards(&["a", "b"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteConcernFailed);
        assert_eq!(client.sent_to("b"), 0);
    }

    #[tokio::test]
    async fn test_transport_failures_retried() {
        let client = Arc::new(ScriptedShardClient::new());
        client.fail_transport("a", 2);
        let (executor, _) = executor(client.clone(), FanoutConfig::immediate());

        let summary = executor
            .broadcast("app", &command(), &shards(&["a"]))
            .await
            .unwrap();
        assert_eq!(summary.applied, vec![ShardId::new("a")]);

        client.fail_transport("a", 10);
        let err = executor
            .broadcast("app", &command(), &shards(&["a"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[tokio::test]
    async fn test_rpc_timeout() {
        let client = Arc::new(ScriptedShardClient::new());
        client.set_delay(Duration::from_millis(200));
        let config = FanoutConfig::immediate()
            .with_rpc_timeout(Duration::from_millis(10))
            .with_max_transport_retries(0);
        let (executor, _) = executor(client, config);

        let err = executor
            .broadcast("app", &command(), &shards(&["a"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_parallel_keeps_order_and_overlaps() {
        let client = Arc::new(ScriptedShardClient::new());
        client.set_delay(Duration::from_millis(20));
        client.script("a", [ScriptedShardClient::error(ErrorKind::NamespaceNotFound)]);
        let (executor, _) = executor(client.clone(), FanoutConfig::immediate().with_parallel(true));

        let summary = executor
            .broadcast("app", &command(), &shards(&["d", "a", "c", "b"]))
            .await
            .unwrap();
        assert_eq!(
            summary.applied,
            vec![ShardId::new("d"), ShardId::new("c"), ShardId::new("b")]
        );
        assert!(client.max_in_flight() > 1);
    }

    #[tokio::test]
    async fn test_parallel_stale_ceiling_is_per_shard() {
        let client = Arc::new(ScriptedShardClient::new());
        client.set_default("b", ScriptedShardClient::error(ErrorKind::StaleEpoch));
        let (executor, _) = executor(client.clone(), FanoutConfig::immediate().with_parallel(true));

        let err = executor
            .broadcast("app", &command(), &shards(&["a", "b"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StaleEpoch);
        assert_eq!(client.sent_to("b"), 10);
        assert_eq!(client.sent_to("a"), 1);
    }
}
