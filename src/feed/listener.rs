//! Change feed listener
//!
//! Turns the store's at-least-once change log into an effectively-once,
//! ordered sequence of batches.
//!
//! # Guarantees
//!
//! - Events are delivered in commit order, each at most once per listener
//! - A commit is never split across batches
//! - A truncated log or a hole in the sequence fails with `FeedError::Gap`
//! - Transient read failures are retried with exponential backoff plus
//!   jitter; reading resumes from the last acknowledged commit and
//!   already-delivered events are dropped
//!
//! Idle waiting is on the store's commit watch channel, not a poll timer.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::checkpoint::CheckpointStore;
use super::errors::{FeedError, FeedResult};
use crate::observability::Event;
use crate::store::{ChangeEvent, ChangeLog, CommitSeq, StoreError};

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Window after the first new commit during which more are collected
    pub debounce_ms: u64,
    /// Batch size target; whole commits may overshoot it
    pub max_batch_events: usize,
    /// First reconnect delay
    pub reconnect_initial_backoff_ms: u64,
    /// Reconnect delay cap
    pub reconnect_max_backoff_ms: u64,
    /// Give up after this many consecutive failed reads (`None` = never)
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 20,
            max_batch_events: 512,
            reconnect_initial_backoff_ms: 50,
            reconnect_max_backoff_ms: 5_000,
            max_reconnect_attempts: None,
        }
    }
}

impl FeedConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Delay before reconnect attempt `attempt` (1-based), jittered by up
    /// to half the base delay.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .reconnect_initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.reconnect_max_backoff_ms);
        let jitter = if base >= 2 {
            rand::thread_rng().gen_range(0..=base / 2)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }
}

/// Events of one or more whole commits, in order
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    events: Vec<ChangeEvent>,
}

impl ChangeBatch {
    pub fn new(events: Vec<ChangeEvent>) -> Self {
        Self { events }
    }

    pub fn events(&self) -> &[ChangeEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<ChangeEvent> {
        self.events
    }

    /// Highest commit sequence number in the batch
    pub fn through(&self) -> CommitSeq {
        self.events.last().map(|e| e.seq).unwrap_or(CommitSeq::ZERO)
    }

    /// Lowest commit sequence number in the batch
    pub fn first(&self) -> CommitSeq {
        self.events.first().map(|e| e.seq).unwrap_or(CommitSeq::ZERO)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub struct ChangeFeedListener<L: ?Sized> {
    log: Arc<L>,
    checkpoint: Arc<dyn CheckpointStore>,
    config: FeedConfig,
    commits: watch::Receiver<CommitSeq>,
    /// Last sequence number handed out by `next_batch`
    delivered: CommitSeq,
    /// Last sequence number persisted by `acknowledge`
    acknowledged: CommitSeq,
    /// Set after a transient failure; the next read starts at `acknowledged`
    reconnecting: bool,
}

impl<L: ChangeLog + ?Sized> ChangeFeedListener<L> {
    /// Open at the checkpoint's resume point, or at `fallback` when the
    /// checkpoint is empty.
    pub fn open(
        log: Arc<L>,
        checkpoint: Arc<dyn CheckpointStore>,
        config: FeedConfig,
        fallback: CommitSeq,
    ) -> FeedResult<Self> {
        let resume = checkpoint.load()?.unwrap_or(fallback);
        let commits = log.watch_commits();
        info!(event = %Event::FeedOpened, resume = %resume);
        Ok(Self {
            log,
            checkpoint,
            config,
            commits,
            delivered: resume,
            acknowledged: resume,
            reconnecting: false,
        })
    }

    pub fn delivered(&self) -> CommitSeq {
        self.delivered
    }

    pub fn acknowledged(&self) -> CommitSeq {
        self.acknowledged
    }

    /// Persist `seq` as fully applied.
    pub fn acknowledge(&mut self, seq: CommitSeq) -> FeedResult<()> {
        if seq <= self.acknowledged {
            return Ok(());
        }
        self.checkpoint.store(seq)?;
        self.acknowledged = seq;
        debug!(event = %Event::CheckpointWritten, seq = %seq);
        Ok(())
    }

    /// Rebase after a resync: everything up to `seq` counts as applied.
    pub fn reset_to(&mut self, seq: CommitSeq) -> FeedResult<()> {
        self.checkpoint.store(seq)?;
        self.delivered = seq;
        self.acknowledged = seq;
        self.reconnecting = false;
        Ok(())
    }

    /// Wait for and return the next batch of unseen events.
    pub async fn next_batch(&mut self) -> FeedResult<ChangeBatch> {
        loop {
            let backlog = *self.commits.borrow() > self.delivered;
            if !backlog {
                let delivered = self.delivered;
                self.commits
                    .wait_for(|head| *head > delivered)
                    .await
                    .map_err(|_| FeedError::Closed)?;
                if !self.config.debounce().is_zero() {
                    tokio::time::sleep(self.config.debounce()).await;
                }
            }

            let batch = self.read_fresh().await?;
            if !batch.is_empty() {
                self.delivered = batch.through();
                return Ok(batch);
            }

            // Head moved but the log had nothing new for us yet.
            tokio::time::sleep(self.config.debounce().max(Duration::from_millis(1))).await;
        }
    }

    async fn read_fresh(&mut self) -> FeedResult<ChangeBatch> {
        let mut cursor = if self.reconnecting {
            self.acknowledged
        } else {
            self.delivered
        };

        loop {
            let events = self.read_with_retry(cursor).await?;
            let Some(last) = events.last().map(|e| e.seq) else {
                return Ok(ChangeBatch::new(Vec::new()));
            };

            let fresh = self.in_order_after_delivered(events)?;
            if !fresh.is_empty() || last <= cursor {
                return Ok(ChangeBatch::new(fresh));
            }
            // Only redelivered events so far; keep reading forward.
            cursor = last;
        }
    }

    /// Drop events at or before `delivered` and check the rest continue
    /// the sequence without holes.
    fn in_order_after_delivered(&self, events: Vec<ChangeEvent>) -> FeedResult<Vec<ChangeEvent>> {
        let mut previous = self.delivered;
        let mut fresh = Vec::with_capacity(events.len());

        for event in events {
            if event.seq <= self.delivered {
                continue;
            }
            if event.seq != previous && event.seq != previous.next() {
                warn!(event = %Event::FeedGap, after = %previous, found = %event.seq);
                return Err(FeedError::Gap {
                    after: previous,
                    next_available: event.seq,
                });
            }
            previous = event.seq;
            fresh.push(event);
        }
        Ok(fresh)
    }

    async fn read_with_retry(&mut self, after: CommitSeq) -> FeedResult<Vec<ChangeEvent>> {
        let mut attempts = 0u32;
        let mut from = after;

        loop {
            match self.log.read_after(from, self.config.max_batch_events) {
                Ok(events) => {
                    if attempts > 0 {
                        info!(event = %Event::FeedReconnected, attempts, resume = %from);
                    }
                    self.reconnecting = false;
                    return Ok(events);
                }
                Err(StoreError::Truncated { requested, oldest }) => {
                    warn!(event = %Event::FeedGap, requested = %requested, oldest = %oldest);
                    return Err(FeedError::Gap {
                        after: requested,
                        next_available: oldest,
                    });
                }
                Err(e) if e.is_transient() => {
                    attempts += 1;
                    self.reconnecting = true;
                    from = self.acknowledged.min(from);

                    if let Some(max) = self.config.max_reconnect_attempts {
                        if attempts > max {
                            return Err(FeedError::Unreachable {
                                attempts,
                                last_error: e.to_string(),
                            });
                        }
                    }

                    let delay = self.config.backoff(attempts);
                    warn!(
                        event = %Event::FeedReconnecting,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(FeedError::Store(e)),
            }
        }
    }
}
