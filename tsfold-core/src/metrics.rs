//! Fire-and-forget metrics reporting

use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::debug;

/// Metric names reported by the compaction path
pub mod names {
    pub const COMPACTION_STARTED: &str = "compaction_started_total";
    pub const COMPACTION_SUCCEEDED: &str = "compaction_succeeded_total";
    pub const COMPACTION_FAILED: &str = "compaction_failed_total";
    pub const COMPACTION_POINTS_WRITTEN: &str = "compaction_points_written_total";
    pub const COMPACTION_DUPLICATES_DROPPED: &str = "compaction_duplicates_dropped_total";
    pub const COMPACTION_BYTES_WRITTEN: &str = "compaction_bytes_written_total";
    pub const COMPACTION_DURATION_MS: &str = "compaction_duration_ms";
    pub const SEQUENCE_FILES: &str = "sequence_files";
    pub const UNSEQUENCE_FILES: &str = "unsequence_files";
    pub const PENDING_DELETIONS: &str = "pending_deletions";
}

/// Sink for gauges and counters; implementations must not block
pub trait MetricsSink: Send + Sync {
    fn gauge(&self, name: &str, value: f64);
    fn counter(&self, name: &str, delta: u64);
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn gauge(&self, _name: &str, _value: f64) {}
    fn counter(&self, _name: &str, _delta: u64) {}
}

/// Emits every sample as a debug-level tracing event
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn gauge(&self, name: &str, value: f64) {
        debug!(metric = name, value, "gauge");
    }

    fn counter(&self, name: &str, delta: u64) {
        debug!(metric = name, delta, "counter");
    }
}

/// Keeps the latest gauges and summed counters in memory
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    gauges: Mutex<BTreeMap<String, f64>>,
    counters: Mutex<BTreeMap<String, u64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges.lock().get(name).copied()
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    /// Snapshot of all counters
    pub fn counters(&self) -> BTreeMap<String, u64> {
        self.counters.lock().clone()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn gauge(&self, name: &str, value: f64) {
        self.gauges.lock().insert(name.to_string(), value);
    }

    fn counter(&self, name: &str, delta: u64) {
        *self.counters.lock().entry(name.to_string()).or_insert(0) += delta;
    }
}
