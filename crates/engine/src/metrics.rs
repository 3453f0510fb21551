//! Per-tenant engine counters
//!
//! Counters are kept in memory for inspection and also emitted as
//! structured `tracing` events (`metric = "..."`) so an external
//! observability pipeline can aggregate them from the log stream.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tracing::info;

/// Counter names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Enrollments,
    DuplicatesDiscarded,
    Completions,
    Failures,
    Cancellations,
    Retries,
    CleanupLogsDeleted,
    CleanupExecutionsDeleted,
    TriggersDropped,
}

impl Counter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enrollments => "workflow.enrollments",
            Self::DuplicatesDiscarded => "workflow.duplicates_discarded",
            Self::Completions => "workflow.completions",
            Self::Failures => "workflow.failures",
            Self::Cancellations => "workflow.cancellations",
            Self::Retries => "workflow.retries",
            Self::CleanupLogsDeleted => "workflow.cleanup.logs_deleted",
            Self::CleanupExecutionsDeleted => "workflow.cleanup.executions_deleted",
            Self::TriggersDropped => "workflow.triggers_dropped",
        }
    }
}

/// Counter values for one tenant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub enrollments: u64,
    pub duplicates_discarded: u64,
    pub completions: u64,
    pub failures: u64,
    pub cancellations: u64,
    pub retries: u64,
    pub cleanup_logs_deleted: u64,
    pub cleanup_executions_deleted: u64,
    pub triggers_dropped: u64,
}

/// Engine metrics registry
///
/// # Example
///
/// ```
/// use tenantflow_engine::metrics::{Counter, EngineMetrics};
///
/// let metrics = EngineMetrics::new();
/// metrics.incr("tenant-a", Counter::Enrollments);
/// metrics.add("tenant-a", Counter::CleanupLogsDeleted, 40);
///
/// let snapshot = metrics.snapshot("tenant-a");
/// assert_eq!(snapshot.enrollments, 1);
/// assert_eq!(snapshot.cleanup_logs_deleted, 40);
/// ```
#[derive(Debug, Default)]
pub struct EngineMetrics {
    counters: DashMap<(String, Counter), AtomicU64>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a tenant counter by one
    pub fn incr(&self, tenant_id: &str, counter: Counter) {
        self.add(tenant_id, counter, 1);
    }

    /// Increment a tenant counter by `value`
    pub fn add(&self, tenant_id: &str, counter: Counter, value: u64) {
        if value == 0 {
            return;
        }

        let total = {
            let entry = self
                .counters
                .entry((tenant_id.to_string(), counter))
                .or_insert_with(|| AtomicU64::new(0));
            entry.fetch_add(value, Ordering::Relaxed) + value
        };

        info!(
            metric = counter.as_str(),
            tenant_id,
            value,
            total,
            "metric"
        );
    }

    /// Current value of a tenant counter
    pub fn get(&self, tenant_id: &str, counter: Counter) -> u64 {
        self.counters
            .get(&(tenant_id.to_string(), counter))
            .map_or(0, |v| v.load(Ordering::Relaxed))
    }

    /// Engine-wide total of a counter across tenants
    pub fn total(&self, counter: Counter) -> u64 {
        self.counters
            .iter()
            .filter(|entry| entry.key().1 == counter)
            .map(|entry| entry.value().load(Ordering::Relaxed))
            .sum()
    }

    /// All counters of a tenant
    pub fn snapshot(&self, tenant_id: &str) -> MetricsSnapshot {
        MetricsSnapshot {
            enrollments: self.get(tenant_id, Counter::Enrollments),
            duplicates_discarded: self.get(tenant_id, Counter::DuplicatesDiscarded),
            completions: self.get(tenant_id, Counter::Completions),
            failures: self.get(tenant_id, Counter::Failures),
            cancellations: self.get(tenant_id, Counter::Cancellations),
            retries: self.get(tenant_id, Counter::Retries),
            cleanup_logs_deleted: self.get(tenant_id, Counter::CleanupLogsDeleted),
            cleanup_executions_deleted: self.get(tenant_id, Counter::CleanupExecutionsDeleted),
            triggers_dropped: self.get(tenant_id, Counter::TriggersDropped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_tenant() {
        let metrics = EngineMetrics::new();
        metrics.incr("a", Counter::Failures);
        metrics.incr("a", Counter::Failures);
        metrics.incr("b", Counter::Failures);

        assert_eq!(metrics.get("a", Counter::Failures), 2);
        assert_eq!(metrics.get("b", Counter::Failures), 1);
        assert_eq!(metrics.get("c", Counter::Failures), 0);
        assert_eq!(metrics.total(Counter::Failures), 3);
    }

    #[test]
    fn test_zero_add_creates_nothing() {
        let metrics = EngineMetrics::new();
        metrics.add("a", Counter::CleanupLogsDeleted, 0);
        assert_eq!(metrics.snapshot("a"), MetricsSnapshot::default());
    }
}
