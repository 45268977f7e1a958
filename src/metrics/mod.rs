//! In-process metrics for DDL coordination.
//!
//! Prometheus-style counters, gauges and histograms. Nothing is exported;
//! callers read [`DdlMetrics::snapshot`].
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       DdlMetrics                          │
//! │  operations      started / succeeded / failed / active    │
//! │  locks           acquired / timeouts                      │
//! │  fan-out         commands{shard,outcome} / stale retries  │
//! │  cleanup         runs / failures                          │
//! │  latency         operation duration histogram             │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod primitives;

pub use primitives::{Counter, Gauge, Histogram, HistogramSnapshot, LabeledCounter};

use std::time::Duration;

/// Bucket bounds for whole-operation latency (seconds).
pub const DDL_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Outcome label for a single participant command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardOutcome {
    Ok,
    NamespaceNotFound,
    Stale,
    Failed,
}

impl ShardOutcome {
    fn label(&self) -> &'static str {
        match self {
            ShardOutcome::Ok => "ok",
            ShardOutcome::NamespaceNotFound => "namespace_not_found",
            ShardOutcome::Stale => "stale",
            ShardOutcome::Failed => "failed",
        }
    }
}

/// Metrics for DDL operations on one node.
#[derive(Debug)]
pub struct DdlMetrics {
    pub operations_started: Counter,
    pub operations_succeeded: Counter,
    pub operations_failed: Counter,
    pub operations_active: Gauge,
    pub locks_acquired: Counter,
    pub lock_timeouts: Counter,
    pub shard_commands: LabeledCounter<2>,
    pub stale_retries: Counter,
    pub cleanup_runs: Counter,
    pub cleanup_failures: Counter,
    pub operation_duration: Histogram,
}

impl DdlMetrics {
    pub fn new() -> Self {
        Self {
            operations_started: Counter::new("ddl_operations_started", "DDL operations started"),
            operations_succeeded: Counter::new(
                "ddl_operations_succeeded",
                "DDL operations that resolved successfully",
            ),
            operations_failed: Counter::new(
                "ddl_operations_failed",
                "DDL operations that resolved with an error",
            ),
            operations_active: Gauge::new("ddl_operations_active"),
            locks_acquired: Counter::new("ddl_locks_acquired", "Distributed locks acquired"),
            lock_timeouts: Counter::new(
                "ddl_lock_timeouts",
                "Distributed lock acquisitions that timed out",
            ),
            shard_commands: LabeledCounter::new("ddl_shard_commands", ["shard", "outcome"]),
            stale_retries: Counter::new(
                "ddl_stale_retries",
                "Participant commands resent after a stale shard version",
            ),
            cleanup_runs: Counter::new("ddl_cleanup_runs", "Config metadata cleanups started"),
            cleanup_failures: Counter::new(
                "ddl_cleanup_failures",
                "Config metadata cleanups that failed",
            ),
            operation_duration: Histogram::new("ddl_operation_duration", DDL_LATENCY_BUCKETS),
        }
    }

    pub fn record_operation_start(&self) {
        self.operations_started.inc();
        self.operations_active.inc();
    }

    pub fn record_operation_end(&self, success: bool, duration: Duration) {
        if success {
            self.operations_succeeded.inc();
        } else {
            self.operations_failed.inc();
        }
        self.operations_active.dec();
        self.operation_duration.observe(duration);
    }

    pub fn record_shard_command(&self, shard: &str, outcome: ShardOutcome) {
        self.shard_commands.inc([shard, outcome.label()]);
        if outcome == ShardOutcome::Stale {
            self.stale_retries.inc();
        }
    }

    /// Commands sent to `shard` with the given outcome.
    pub fn shard_commands_for(&self, shard: &str, outcome: ShardOutcome) -> u64 {
        self.shard_commands.get([shard, outcome.label()])
    }

    pub fn snapshot(&self) -> DdlMetricsSnapshot {
        DdlMetricsSnapshot {
            operations_started: self.operations_started.get(),
            operations_succeeded: self.operations_succeeded.get(),
            operations_failed: self.operations_failed.get(),
            operations_active: self.operations_active.get(),
            locks_acquired: self.locks_acquired.get(),
            lock_timeouts: self.lock_timeouts.get(),
            shard_commands: self.shard_commands.total(),
            stale_retries: self.stale_retries.get(),
            cleanup_runs: self.cleanup_runs.get(),
            cleanup_failures: self.cleanup_failures.get(),
            operation_duration: self.operation_duration.snapshot(),
        }
    }
}

impl Default for DdlMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`DdlMetrics`].
#[derive(Debug, Clone)]
pub struct DdlMetricsSnapshot {
    pub operations_started: u64,
    pub operations_succeeded: u64,
    pub operations_failed: u64,
    pub operations_active: i64,
    pub locks_acquired: u64,
    pub lock_timeouts: u64,
    pub shard_commands: u64,
    pub stale_retries: u64,
    pub cleanup_runs: u64,
    pub cleanup_failures: u64,
    pub operation_duration: HistogramSnapshot,
}
