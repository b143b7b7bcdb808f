//! Recompute of a single subscription
//!
//! Runs the query outside the subscription lock, then applies the outcome
//! under it. Applying and queueing happen under the same lock so messages
//! for one subscription leave in the order their results were applied.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::delivery::{Delta, DeliveryError, Enqueued, ServerMessage};
use crate::ids::{ConnectionId, SubscriptionId};
use crate::index::DependencyIndex;
use crate::observability::{Event, MetricsRegistry};
use crate::registry::{Subscription, SubscriptionState};
use crate::store::Snapshot;
use crate::tracker::{Execution, ReadSetTracker, TrackerError};

/// How a fresh result is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecomputeMode {
    /// Delta against the cached result, suppressed when unchanged
    Incremental,
    /// Full result as a fresh initial snapshot, always delivered
    Resync,
}

/// What happened to one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecomputeOutcome {
    /// New result applied and queued
    Delivered,
    /// Result unchanged; watermark advanced only
    Suppressed,
    /// Snapshot older than the watermark, or the subscription is gone
    Discarded,
    /// Query failed; error delivered, subscription degraded
    Failed,
    /// Query failed too many times in a row; terminal message queued and
    /// the caller must remove the subscription
    Terminated,
    /// The connection's buffer overflowed; the caller must close it
    Overflow(ConnectionId),
    /// Store unavailable; retried next cycle
    Retry,
}

/// Shared handles a recompute needs
#[derive(Debug, Clone)]
pub struct Recomputer {
    tracker: ReadSetTracker,
    index: Arc<DependencyIndex>,
    metrics: Arc<MetricsRegistry>,
    max_consecutive_failures: u32,
}

impl Recomputer {
    pub fn new(
        tracker: ReadSetTracker,
        index: Arc<DependencyIndex>,
        metrics: Arc<MetricsRegistry>,
        max_consecutive_failures: u32,
    ) -> Self {
        Self {
            tracker,
            index,
            metrics,
            max_consecutive_failures: max_consecutive_failures.max(1),
        }
    }

    /// Recompute `subscription` against `snapshot`. Blocking.
    pub fn recompute(
        &self,
        subscription: &Subscription,
        snapshot: &dyn Snapshot,
        mode: RecomputeMode,
    ) -> RecomputeOutcome {
        if subscription.is_removed() {
            self.metrics.increment_recomputes_discarded();
            return RecomputeOutcome::Discarded;
        }

        let executed = self.tracker.execute(subscription.descriptor(), snapshot);

        let mut state = subscription.lock();
        if state.removed || snapshot.seq() < state.watermark {
            self.metrics.increment_recomputes_discarded();
            debug!(
                subscription = %subscription.id(),
                snapshot = %snapshot.seq(),
                watermark = %state.watermark,
                "recompute discarded"
            );
            return RecomputeOutcome::Discarded;
        }

        match executed {
            Ok(execution) => {
                self.metrics.increment_recomputes_executed();
                self.apply(subscription, &mut state, execution, mode)
            }
            Err(TrackerError::Store(e)) => {
                state.degraded = true;
                warn!(
                    event = %Event::SubscriptionDegraded,
                    subscription = %subscription.id(),
                    code = e.code(),
                    error = %e
                );
                RecomputeOutcome::Retry
            }
            Err(e) => {
                self.metrics.increment_recomputes_failed();
                self.fail(subscription, &mut state, e)
            }
        }
    }

    fn apply(
        &self,
        subscription: &Subscription,
        state: &mut SubscriptionState,
        execution: Execution,
        mode: RecomputeMode,
    ) -> RecomputeOutcome {
        let id = subscription.id();
        if state.degraded {
            debug!(event = %Event::SubscriptionRecovered, subscription = %id);
        }
        state.degraded = false;
        state.consecutive_failures = 0;
        state.watermark = execution.seq;

        if execution.read_set != state.read_set {
            self.index.register(id, execution.read_set.clone());
            state.read_set = execution.read_set;
        }

        let sender = subscription.sender();
        let queued = match mode {
            RecomputeMode::Incremental => {
                if execution.hash == state.hash {
                    self.metrics.increment_deltas_suppressed();
                    return RecomputeOutcome::Suppressed;
                }
                let delta = Delta::between(&state.result, &execution.result);
                state.result = Arc::clone(&execution.result);
                state.hash = execution.hash;
                sender.send_change(id, execution.seq, delta, execution.result)
            }
            RecomputeMode::Resync => {
                state.result = Arc::clone(&execution.result);
                state.hash = execution.hash;
                sender.send_initial(id, None, execution.seq, execution.result)
            }
        };

        match queued {
            Ok(Enqueued::Queued) => {
                self.metrics.increment_deltas_delivered();
                RecomputeOutcome::Delivered
            }
            Ok(Enqueued::Coalesced) => {
                self.metrics.increment_deltas_delivered();
                self.metrics.increment_deltas_coalesced();
                RecomputeOutcome::Delivered
            }
            Err(e) => undeliverable(id, e),
        }
    }

    fn fail(
        &self,
        subscription: &Subscription,
        state: &mut SubscriptionState,
        failure: TrackerError,
    ) -> RecomputeOutcome {
        let id = subscription.id();
        state.consecutive_failures += 1;
        state.degraded = true;

        if state.consecutive_failures >= self.max_consecutive_failures {
            error!(
                event = %Event::SubscriptionTerminated,
                subscription = %id,
                failures = state.consecutive_failures,
                code = failure.code(),
                error = %failure
            );
            let terminal = ServerMessage::terminal(
                id,
                failure.code(),
                format!(
                    "{} (after {} consecutive failures)",
                    failure, state.consecutive_failures
                ),
            );
            return match subscription.sender().send(terminal) {
                Err(DeliveryError::Overflow { connection, .. }) => RecomputeOutcome::Overflow(connection),
                _ => RecomputeOutcome::Terminated,
            };
        }

        warn!(
            event = %Event::SubscriptionDegraded,
            subscription = %id,
            failures = state.consecutive_failures,
            code = failure.code(),
            error = %failure
        );
        let message = ServerMessage::error(Some(id), failure.code(), failure.to_string());
        match subscription.sender().send(message) {
            Ok(_) => RecomputeOutcome::Failed,
            Err(e) => undeliverable(id, e),
        }
    }
}

fn undeliverable(id: SubscriptionId, error: DeliveryError) -> RecomputeOutcome {
    match error {
        DeliveryError::Overflow { connection, .. } => RecomputeOutcome::Overflow(connection),
        DeliveryError::Closed(connection) => {
            debug!(subscription = %id, connection = %connection, "connection closed, result dropped");
            RecomputeOutcome::Discarded
        }
    }
}
