//! Configuration types for DDL coordination.

use crate::error::{Error, Result};
use crate::types::{ClusterRole, ShardId};
use std::time::Duration;

/// Stale shard version attempts per shard before a broadcast gives up.
pub const MAX_STALE_SHARD_VERSION_RETRIES: u32 = 10;

/// Main configuration for a node taking part in sharded DDL.
#[derive(Debug, Clone)]
pub struct DdlConfig {
    /// Identity of the local shard.
    pub shard_id: ShardId,

    /// Role of this process in the cluster.
    pub cluster_role: ClusterRole,

    /// Distributed lock configuration.
    pub lock: LockConfig,

    /// Fan-out and retry policy for participant commands.
    pub fanout: FanoutConfig,

    /// Routing cache configuration.
    pub routing_cache: RoutingCacheConfig,
}

impl Default for DdlConfig {
    fn default() -> Self {
        Self {
            shard_id: ShardId::new("shard0"),
            cluster_role: ClusterRole::ShardServer,
            lock: LockConfig::default(),
            fanout: FanoutConfig::default(),
            routing_cache: RoutingCacheConfig::default(),
        }
    }
}

impl DdlConfig {
    /// Create a configuration for the given shard.
    pub fn new(shard_id: impl Into<ShardId>) -> Self {
        Self {
            shard_id: shard_id.into(),
            ..Default::default()
        }
    }

    /// Set the cluster role.
    pub fn with_cluster_role(mut self, role: ClusterRole) -> Self {
        self.cluster_role = role;
        self
    }

    /// Set the lock configuration.
    pub fn with_lock_config(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Set the lock acquisition timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock.acquisition_timeout = timeout;
        self
    }

    /// Set the fan-out configuration.
    pub fn with_fanout_config(mut self, fanout: FanoutConfig) -> Self {
        self.fanout = fanout;
        self
    }

    /// Set the routing cache configuration.
    pub fn with_routing_cache_config(mut self, routing_cache: RoutingCacheConfig) -> Self {
        self.routing_cache = routing_cache;
        self
    }

    /// Check the configuration for values that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.shard_id.as_str().is_empty() {
            return Err(Error::Config("shard_id must not be empty".into()));
        }
        if self.lock.acquisition_timeout.is_zero() {
            return Err(Error::Config("lock acquisition timeout must be > 0".into()));
        }
        if self.lock.lease_ttl < self.lock.acquisition_timeout {
            return Err(Error::Config(format!(
                "lock lease ttl {:?} is shorter than the acquisition timeout {:?}",
                self.lock.lease_ttl, self.lock.acquisition_timeout
            )));
        }
        if self.fanout.max_stale_retries == 0 {
            return Err(Error::Config("max_stale_retries must be > 0".into()));
        }
        if self.fanout.initial_backoff > self.fanout.max_backoff {
            return Err(Error::Config(
                "initial_backoff must not exceed max_backoff".into(),
            ));
        }
        Ok(())
    }
}

/// Distributed lock configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long an acquisition may wait for a busy lease.
    pub acquisition_timeout: Duration,

    /// Lease lifetime. A holder that dies loses the lock after this long.
    pub lease_ttl: Duration,

    /// Delay between attempts while a lease is busy.
    pub retry_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquisition_timeout: Duration::from_secs(20),
            lease_ttl: Duration::from_secs(15 * 60),
            retry_interval: Duration::from_millis(500),
        }
    }
}

impl LockConfig {
    /// Set the acquisition timeout.
    pub fn with_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.acquisition_timeout = timeout;
        self
    }

    /// Set the lease TTL.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Set the retry interval.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

/// Retry policy for broadcasting a participant command.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Attempts per shard on stale shard version before giving up.
    pub max_stale_retries: u32,

    /// Backoff before the first resend to a stale shard.
    pub initial_backoff: Duration,

    /// Upper bound on the resend backoff.
    pub max_backoff: Duration,

    /// Add random jitter (up to half the backoff) to each resend.
    pub jitter: bool,

    /// Per-request timeout.
    pub rpc_timeout: Duration,

    /// Resends of one request after a connection failure or timeout.
    pub max_transport_retries: u32,

    /// Contact all shards concurrently instead of one after another.
    pub parallel: bool,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            max_stale_retries: MAX_STALE_SHARD_VERSION_RETRIES,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            jitter: true,
            rpc_timeout: Duration::from_secs(30),
            max_transport_retries: 3,
            parallel: false,
        }
    }
}

impl FanoutConfig {
    /// A policy with no sleeps between resends, for tests.
    pub fn immediate() -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: false,
            ..Default::default()
        }
    }

    /// Set the stale retry ceiling.
    pub fn with_max_stale_retries(mut self, retries: u32) -> Self {
        self.max_stale_retries = retries;
        self
    }

    /// Set the backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Set the per-request timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set the transport retry count.
    pub fn with_max_transport_retries(mut self, retries: u32) -> Self {
        self.max_transport_retries = retries;
        self
    }

    /// Enable or disable concurrent fan-out.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Backoff before resend number `attempt` (1-based), without jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Routing cache configuration.
#[derive(Debug, Clone)]
pub struct RoutingCacheConfig {
    /// Maximum number of cached database and collection entries.
    pub max_capacity: u64,

    /// Optional lifetime after which an entry is reloaded.
    pub time_to_live: Option<Duration>,
}

impl Default for RoutingCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            time_to_live: None,
        }
    }
}
