//! Lock-free metric primitives.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter split by label values, e.g. `[shard, outcome]`.
#[derive(Debug)]
pub struct LabeledCounter<const N: usize> {
    name: &'static str,
    label_names: [&'static str; N],
    values: RwLock<HashMap<[String; N], AtomicU64>>,
}

impl<const N: usize> LabeledCounter<N> {
    pub fn new(name: &'static str, label_names: [&'static str; N]) -> Self {
        Self {
            name,
            label_names,
            values: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn label_names(&self) -> &[&'static str; N] {
        &self.label_names
    }

    pub fn inc(&self, labels: [&str; N]) {
        let key: [String; N] = labels.map(str::to_string);

        // Fast path: label set already present.
        if let Some(value) = self.values.read().get(&key) {
            value.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.values
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, labels: [&str; N]) -> u64 {
        let key: [String; N] = labels.map(str::to_string);
        self.values
            .read()
            .get(&key)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum over every label set.
    pub fn total(&self) -> u64 {
        self.values
            .read()
            .values()
            .map(|v| v.load(Ordering::Relaxed))
            .sum()
    }
}

/// A value that can go up and down.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    value: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Cumulative bucketed histogram of durations, in seconds.
#[derive(Debug)]
pub struct Histogram {
    name: &'static str,
    bounds: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(name: &'static str, bounds: &[f64]) -> Self {
        let mut bounds = bounds.to_vec();
        bounds.sort_by(f64::total_cmp);
        let counts = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            name,
            bounds,
            counts,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn observe(&self, duration: Duration) {
        let secs = duration.as_secs_f64();
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        for (bound, count) in self.bounds.iter().zip(&self.counts) {
            if secs <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bounds: self.bounds.clone(),
            cumulative_counts: self
                .counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            count: self.count.load(Ordering::Relaxed),
            sum: Duration::from_micros(self.sum_micros.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of a [`Histogram`].
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    pub bounds: Vec<f64>,
    /// Observations `<=` the matching bound.
    pub cumulative_counts: Vec<u64>,
    pub count: u64,
    pub sum: Duration,
}

impl HistogramSnapshot {
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(self.sum.as_secs_f64() / self.count as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labeled_counter() {
        let counter = LabeledCounter::<2>::new("shard_commands", ["shard", "outcome"]);
        counter.inc(["s1", "ok"]);
        counter.inc(["s1", "ok"]);
        counter.inc(["s2", "stale"]);

        assert_eq!(counter.get(["s1", "ok"]), 2);
        assert_eq!(counter.get(["s2", "stale"]), 1);
        assert_eq!(counter.get(["s3", "ok"]), 0);
        assert_eq!(counter.total(), 3);
    }

    #[test]
    fn test_histogram_buckets() {
        let histogram = Histogram::new("op", &[1.0, 0.01, 0.1]);
        histogram.observe(Duration::from_millis(5));
        histogram.observe(Duration::from_millis(50));
        histogram.observe(Duration::from_secs(5));

        let snap = histogram.snapshot();
        assert_eq!(snap.bounds, vec![0.01, 0.1, 1.0]);
        assert_eq!(snap.cumulative_counts, vec![1, 2, 2]);
        assert_eq!(snap.count, 3);
        assert_eq!(snap.sum, Duration::from_millis(5055));
    }

    #[test]
    fn test_mean_with_large_count() {
        let snap = HistogramSnapshot {
            bounds: vec![1.0],
            cumulative_counts: vec![1 << 32],
            count: 1 << 32,
            sum: Duration::from_secs(1 << 32),
        };
        assert_eq!(snap.mean(), Duration::from_secs(1));

        let empty = HistogramSnapshot {
            count: 0,
            sum: Duration::ZERO,
            ..snap
        };
        assert_eq!(empty.mean(), Duration::ZERO);
    }
}
