//! Metrics registry for reflux
//!
//! - Counters only, monotonic, reset only on process start
//! - `subscriptions_active` is derived from created minus removed
//! - Thread-safe, lock-free

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Metrics registry containing all operational counters
///
/// Uses Relaxed ordering; readers only need eventually consistent values.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Change events applied by the scheduler
    events_applied: AtomicU64,
    /// Batches applied
    batches_applied: AtomicU64,
    /// Recomputes that ran to completion
    recomputes_executed: AtomicU64,
    /// Recomputes discarded as stale or for removed subscriptions
    recomputes_discarded: AtomicU64,
    /// Recomputes whose query function failed
    recomputes_failed: AtomicU64,
    /// Deltas queued for delivery
    deltas_delivered: AtomicU64,
    /// Recomputes suppressed by an unchanged content hash
    deltas_suppressed: AtomicU64,
    /// Deltas merged into a pending message
    deltas_coalesced: AtomicU64,
    /// Full resyncs
    resyncs: AtomicU64,
    /// Connections failed with `DeliveryOverflow`
    overflows: AtomicU64,
    /// Subscriptions created
    subscriptions_created: AtomicU64,
    /// Subscriptions removed for any reason
    subscriptions_removed: AtomicU64,
    /// Subscriptions torn down after repeated failures
    subscriptions_terminated: AtomicU64,
}

macro_rules! counter {
    ($incr:ident, $add:ident, $get:ident, $field:ident) => {
        pub fn $incr(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $add(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl MetricsRegistry {
    /// Create a new metrics registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    counter!(increment_events_applied, add_events_applied, events_applied, events_applied);
    counter!(increment_batches_applied, add_batches_applied, batches_applied, batches_applied);
    counter!(increment_recomputes_executed, add_recomputes_executed, recomputes_executed, recomputes_executed);
    counter!(increment_recomputes_discarded, add_recomputes_discarded, recomputes_discarded, recomputes_discarded);
    counter!(increment_recomputes_failed, add_recomputes_failed, recomputes_failed, recomputes_failed);
    counter!(increment_deltas_delivered, add_deltas_delivered, deltas_delivered, deltas_delivered);
    counter!(increment_deltas_suppressed, add_deltas_suppressed, deltas_suppressed, deltas_suppressed);
    counter!(increment_deltas_coalesced, add_deltas_coalesced, deltas_coalesced, deltas_coalesced);
    counter!(increment_resyncs, add_resyncs, resyncs, resyncs);
    counter!(increment_overflows, add_overflows, overflows, overflows);
    counter!(increment_subscriptions_created, add_subscriptions_created, subscriptions_created, subscriptions_created);
    counter!(increment_subscriptions_removed, add_subscriptions_removed, subscriptions_removed, subscriptions_removed);
    counter!(increment_subscriptions_terminated, add_subscriptions_terminated, subscriptions_terminated, subscriptions_terminated);

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let created = self.subscriptions_created();
        let removed = self.subscriptions_removed();
        MetricsSnapshot {
            events_applied: self.events_applied(),
            batches_applied: self.batches_applied(),
            recomputes_executed: self.recomputes_executed(),
            recomputes_discarded: self.recomputes_discarded(),
            recomputes_failed: self.recomputes_failed(),
            deltas_delivered: self.deltas_delivered(),
            deltas_suppressed: self.deltas_suppressed(),
            deltas_coalesced: self.deltas_coalesced(),
            resyncs: self.resyncs(),
            overflows: self.overflows(),
            subscriptions_created: created,
            subscriptions_removed: removed,
            subscriptions_terminated: self.subscriptions_terminated(),
            subscriptions_active: created.saturating_sub(removed),
        }
    }

    /// Current values as a JSON object
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub events_applied: u64,
    pub batches_applied: u64,
    pub recomputes_executed: u64,
    pub recomputes_discarded: u64,
    pub recomputes_failed: u64,
    pub deltas_delivered: u64,
    pub deltas_suppressed: u64,
    pub deltas_coalesced: u64,
    pub resyncs: u64,
    pub overflows: u64,
    pub subscriptions_created: u64,
    pub subscriptions_removed: u64,
    pub subscriptions_terminated: u64,
    pub subscriptions_active: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let metrics = MetricsRegistry::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_increment_and_add() {
        let metrics = MetricsRegistry::new();
        metrics.increment_recomputes_executed();
        metrics.add_events_applied(5);
        metrics.increment_subscriptions_created();
        metrics.increment_subscriptions_created();
        metrics.increment_subscriptions_removed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.recomputes_executed, 1);
        assert_eq!(snapshot.events_applied, 5);
        assert_eq!(snapshot.subscriptions_active, 1);
    }

    #[test]
    fn test_to_json() {
        let metrics = MetricsRegistry::new();
        metrics.increment_resyncs();
        let json: serde_json::Value = serde_json::from_str(&metrics.to_json()).unwrap();
        assert_eq!(json["resyncs"], 1);
        assert_eq!(json["overflows"], 0);
    }
}
