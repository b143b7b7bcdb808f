//! # Invalidation & Recompute Scheduler
//!
//! Pulls change batches from the feed listener one at a time and, per
//! batch:
//!
//! 1. resolves the affected subscriptions through the dependency index
//!    (plus every degraded subscription, for retry)
//! 2. recomputes them against a snapshot at the batch's last commit
//! 3. suppresses unchanged results by content hash
//! 4. applies and delivers changed results
//!
//! Recomputes within a batch run concurrently on the blocking pool, bounded
//! by `recompute_workers`. Per-subscription ordering comes from the
//! watermark rule in `Recomputer`. A feed gap triggers a full resync.

mod recompute;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub use recompute::{RecomputeMode, RecomputeOutcome, Recomputer};

use crate::errors::{EngineError, EngineResult};
use crate::feed::{ChangeBatch, ChangeFeedListener, FeedError};
use crate::ids::{ConnectionId, SubscriptionId};
use crate::observability::{Event, MetricsRegistry};
use crate::registry::{Subscription, SubscriptionRegistry};
use crate::store::{ChangeLog, CommitSeq, Snapshot};

const RESYNC_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Recomputes allowed to run at once
    pub recompute_workers: usize,
    /// Consecutive recompute failures before a subscription is torn down
    pub max_consecutive_failures: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            recompute_workers: 8,
            max_consecutive_failures: 3,
        }
    }
}

/// Counts for one processed batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub through: CommitSeq,
    pub events: usize,
    pub recomputed: usize,
    pub delivered: usize,
    pub suppressed: usize,
    pub discarded: usize,
    pub failed: usize,
    pub terminated: usize,
    pub connections_closed: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: RecomputeOutcome) {
        self.recomputed += 1;
        match outcome {
            RecomputeOutcome::Delivered => self.delivered += 1,
            RecomputeOutcome::Suppressed => self.suppressed += 1,
            RecomputeOutcome::Discarded => self.discarded += 1,
            RecomputeOutcome::Failed | RecomputeOutcome::Retry => self.failed += 1,
            RecomputeOutcome::Terminated => self.terminated += 1,
            RecomputeOutcome::Overflow(_) => {}
        }
    }
}

pub struct RecomputeScheduler {
    config: SchedulerConfig,
    registry: Arc<SubscriptionRegistry>,
    recomputer: Recomputer,
    metrics: Arc<MetricsRegistry>,
    workers: Arc<Semaphore>,
    applied: watch::Sender<CommitSeq>,
}

impl RecomputeScheduler {
    pub fn new(config: SchedulerConfig, registry: Arc<SubscriptionRegistry>) -> Self {
        let metrics = Arc::clone(registry.metrics());
        let recomputer = Recomputer::new(
            registry.tracker().clone(),
            Arc::clone(registry.index()),
            Arc::clone(&metrics),
            config.max_consecutive_failures,
        );
        let workers = Arc::new(Semaphore::new(config.recompute_workers.max(1)));
        let (applied, _) = watch::channel(CommitSeq::ZERO);
        Self {
            config,
            registry,
            recomputer,
            metrics,
            workers,
            applied,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Last commit whose batch has been fully applied
    pub fn applied(&self) -> CommitSeq {
        *self.applied.borrow()
    }

    pub fn watch_applied(&self) -> watch::Receiver<CommitSeq> {
        self.applied.subscribe()
    }

    /// Wait until every commit up to `seq` has been applied by `run`.
    ///
    /// `refresh` does not publish: a caller that refreshes a subscription
    /// already holds its outcome when the call returns.
    pub async fn wait_until_applied(&self, seq: CommitSeq) -> EngineResult<()> {
        let mut applied = self.applied.subscribe();
        applied
            .wait_for(|current| *current >= seq)
            .await
            .map(|_| ())
            .map_err(|_| EngineError::ShuttingDown)
    }

    fn publish(&self, seq: CommitSeq) {
        self.applied.send_if_modified(|current| {
            if seq > *current {
                *current = seq;
                true
            } else {
                false
            }
        });
    }

    /// Scheduler loop. Returns when `shutdown` flips to true or its sender
    /// is dropped, or on a non-recoverable feed error.
    pub async fn run<L>(
        self: Arc<Self>,
        mut listener: ChangeFeedListener<L>,
        mut shutdown: watch::Receiver<bool>,
    ) -> EngineResult<()>
    where
        L: ChangeLog + ?Sized,
    {
        self.publish(listener.acknowledged());

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let next = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    continue;
                }
                next = listener.next_batch() => next,
            };

            match next {
                Ok(batch) => {
                    let through = batch.through();
                    self.process_batch(batch).await;
                    if let Err(e) = listener.acknowledge(through) {
                        error!(code = e.code(), error = %e, "checkpoint write failed");
                    }
                    self.publish(through);
                }
                Err(FeedError::Gap {
                    after,
                    next_available,
                }) => {
                    warn!(
                        event = %Event::FeedGap,
                        after = %after,
                        next_available = %next_available,
                        "change feed gap, resyncing all subscriptions"
                    );
                    let Some(head) = self.resync_until_done(&mut shutdown).await else {
                        return Ok(());
                    };
                    if let Err(e) = listener.reset_to(head) {
                        error!(code = e.code(), error = %e, "checkpoint write failed");
                    }
                    self.publish(head);
                }
                Err(e) => {
                    error!(code = e.code(), error = %e, "change feed failed");
                    return Err(e.into());
                }
            }
        }
    }

    async fn resync_until_done(&self, shutdown: &mut watch::Receiver<bool>) -> Option<CommitSeq> {
        loop {
            match self.resync().await {
                Ok(head) => return Some(head),
                Err(e) => {
                    error!(code = e.code(), error = %e, "resync failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(RESYNC_RETRY_DELAY) => {}
                        _ = shutdown.changed() => return None,
                    }
                }
            }
        }
    }

    /// Apply one batch.
    pub async fn process_batch(&self, batch: ChangeBatch) -> BatchReport {
        let through = batch.through();
        let mut report = BatchReport {
            through,
            events: batch.len(),
            ..BatchReport::default()
        };

        let mut ids = self.registry.index().affected_batch(batch.events());
        ids.extend(self.registry.degraded().iter().map(|s| s.id()));
        let subscriptions = self.registry.resolve(&ids);

        if !subscriptions.is_empty() {
            match self.registry.store().snapshot_at(through) {
                Ok(snapshot) => {
                    let outcomes = self
                        .recompute_all(subscriptions, snapshot, RecomputeMode::Incremental)
                        .await;
                    self.settle(outcomes, &mut report);
                }
                Err(e) => {
                    error!(seq = %through, code = e.code(), error = %e, "snapshot unavailable");
                    for subscription in &subscriptions {
                        subscription.lock().degraded = true;
                    }
                    report.failed = subscriptions.len();
                }
            }
        }

        self.metrics.add_events_applied(report.events as u64);
        self.metrics.increment_batches_applied();
        debug!(
            event = %Event::BatchApplied,
            seq = %through,
            events = report.events,
            recomputed = report.recomputed,
            delivered = report.delivered,
            suppressed = report.suppressed
        );
        report
    }

    /// Recompute every subscription against a fresh snapshot at the store
    /// head and deliver each result as a new initial snapshot.
    pub async fn resync(&self) -> EngineResult<CommitSeq> {
        let subscriptions = self.registry.snapshot_all();
        warn!(event = %Event::ResyncStart, subscriptions = subscriptions.len());
        self.metrics.increment_resyncs();

        let store = self.registry.store();
        let head = store.head();
        let snapshot = store.snapshot_at(head)?;

        let outcomes = self
            .recompute_all(subscriptions, snapshot, RecomputeMode::Resync)
            .await;
        let mut report = BatchReport {
            through: head,
            ..BatchReport::default()
        };
        self.settle(outcomes, &mut report);

        info!(
            event = %Event::ResyncComplete,
            seq = %head,
            delivered = report.delivered,
            failed = report.failed
        );
        Ok(head)
    }

    /// Recompute one subscription at the current head. Used after
    /// subscribing to cover commits that landed while it was being set up.
    pub async fn refresh(&self, subscription: Arc<Subscription>) -> EngineResult<RecomputeOutcome> {
        let snapshot = self.registry.store().snapshot()?;
        let id = subscription.id();
        let mut outcomes = self
            .recompute_all(vec![subscription], snapshot, RecomputeMode::Incremental)
            .await;
        let outcome = outcomes
            .pop()
            .map(|(_, outcome)| outcome)
            .ok_or_else(|| EngineError::Internal(format!("refresh of {} did not complete", id)))?;
        let mut report = BatchReport::default();
        self.settle(vec![(id, outcome)], &mut report);
        Ok(outcome)
    }

    async fn recompute_all(
        &self,
        subscriptions: Vec<Arc<Subscription>>,
        snapshot: Arc<dyn Snapshot>,
        mode: RecomputeMode,
    ) -> Vec<(SubscriptionId, RecomputeOutcome)> {
        let mut tasks = JoinSet::new();
        let mut outcomes = Vec::with_capacity(subscriptions.len());

        for subscription in subscriptions {
            let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
                break;
            };
            let recomputer = self.recomputer.clone();
            let snapshot = Arc::clone(&snapshot);
            tasks.spawn_blocking(move || {
                let _permit = permit;
                let outcome = recomputer.recompute(&subscription, snapshot.as_ref(), mode);
                (subscription.id(), outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "recompute task failed"),
            }
        }
        outcomes
    }

    /// Carry out removals the outcomes call for. Runs with no subscription
    /// lock held.
    fn settle(&self, outcomes: Vec<(SubscriptionId, RecomputeOutcome)>, report: &mut BatchReport) {
        let mut overflowed: HashSet<ConnectionId> = HashSet::new();

        for (id, outcome) in outcomes {
            report.record(outcome);
            match outcome {
                RecomputeOutcome::Terminated => {
                    if self.registry.unsubscribe(id) {
                        self.metrics.increment_subscriptions_terminated();
                    }
                }
                RecomputeOutcome::Overflow(connection) => {
                    overflowed.insert(connection);
                }
                _ => {}
            }
        }

        for connection in overflowed {
            if self.registry.close_overflowed(connection).is_some() {
                report.connections_closed += 1;
            }
        }
    }
}
