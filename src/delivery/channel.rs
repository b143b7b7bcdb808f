//! # Delivery Channel
//!
//! One ordered, backpressured message queue per connection.
//!
//! ## Ordering
//! Messages leave in the order they were queued, except that coalescing
//! moves a merged result to the tail. Per subscription, results are
//! always in commit order.
//!
//! ## Backpressure
//! - Below `soft_bound` every message is queued as-is
//! - At or above it, a result for a subscription whose most recent queued
//!   message is also a result replaces that message with the latest value
//! - Above `hard_ceiling` for longer than `overflow_grace` the channel
//!   fails with `DeliveryOverflow` and drops its queue

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

use super::diff::Delta;
use super::errors::{DeliveryError, DeliveryResult};
use super::message::ServerMessage;
use crate::ids::{ConnectionId, SubscriptionId};
use crate::store::CommitSeq;

/// Delivery channel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Queue length at which results start coalescing
    pub soft_bound: usize,
    /// Queue length the channel may not exceed for long
    pub hard_ceiling: usize,
    /// How long the queue may stay above `hard_ceiling`, in milliseconds
    pub overflow_grace_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            soft_bound: 256,
            hard_ceiling: 1024,
            overflow_grace_ms: 1_000,
        }
    }
}

impl DeliveryConfig {
    pub fn overflow_grace(&self) -> Duration {
        Duration::from_millis(self.overflow_grace_ms)
    }
}

/// What happened to a queued message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// Merged into a previously queued result for the same subscription
    Coalesced,
}

/// Why a channel stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by either side; queued messages still drain
    Closed,
    /// Failed with `DeliveryOverflow`; queued messages were dropped
    Overflow,
}

struct Entry {
    message: ServerMessage,
    /// Full value after this message, for results
    latest: Option<Arc<Value>>,
}

struct State {
    queue: VecDeque<Entry>,
    closed: Option<CloseReason>,
    over_ceiling_since: Option<Instant>,
}

struct Shared {
    connection: ConnectionId,
    config: DeliveryConfig,
    state: Mutex<State>,
    notify: Notify,
}

/// Create a connected sender/receiver pair.
pub fn channel(connection: ConnectionId, config: DeliveryConfig) -> (DeliverySender, DeliveryReceiver) {
    let shared = Arc::new(Shared {
        connection,
        config,
        state: Mutex::new(State {
            queue: VecDeque::new(),
            closed: None,
            over_ceiling_since: None,
        }),
        notify: Notify::new(),
    });
    (
        DeliverySender {
            shared: Arc::clone(&shared),
        },
        DeliveryReceiver { shared },
    )
}

/// Producing half, shared by everything that talks to one connection
#[derive(Clone)]
pub struct DeliverySender {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for DeliverySender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliverySender")
            .field("connection", &self.shared.connection)
            .field("queued", &self.len())
            .finish()
    }
}

impl DeliverySender {
    pub fn connection(&self) -> ConnectionId {
        self.shared.connection
    }

    /// Queue the full result of a subscription.
    pub fn send_initial(
        &self,
        subscription_id: SubscriptionId,
        request_id: Option<String>,
        seq: CommitSeq,
        value: Arc<Value>,
    ) -> DeliveryResult<Enqueued> {
        let message = ServerMessage::Initial {
            subscription_id,
            request_id,
            seq,
            value: Arc::clone(&value),
        };
        self.push(message, Some(value))
    }

    /// Queue a change to a subscription's result; `value` is the new full
    /// result the delta leads to.
    pub fn send_change(
        &self,
        subscription_id: SubscriptionId,
        seq: CommitSeq,
        delta: Delta,
        value: Arc<Value>,
    ) -> DeliveryResult<Enqueued> {
        let message = ServerMessage::Delta {
            subscription_id,
            seq,
            delta,
        };
        self.push(message, Some(value))
    }

    /// Queue a message that is never coalesced.
    pub fn send(&self, message: ServerMessage) -> DeliveryResult<Enqueued> {
        self.push(message, None)
    }

    fn push(&self, message: ServerMessage, latest: Option<Arc<Value>>) -> DeliveryResult<Enqueued> {
        let shared = &self.shared;
        let mut state = shared.state.lock();

        if state.closed.is_some() {
            return Err(DeliveryError::Closed(shared.connection));
        }

        let mut outcome = Enqueued::Queued;
        let entry = match latest {
            Some(value) if state.queue.len() >= shared.config.soft_bound => {
                match take_coalescable(&mut state.queue, &message) {
                    Some(previous) => {
                        outcome = Enqueued::Coalesced;
                        merge(previous, message, value)
                    }
                    None => Entry {
                        message,
                        latest: Some(value),
                    },
                }
            }
            latest => Entry { message, latest },
        };
        state.queue.push_back(entry);

        if state.queue.len() > shared.config.hard_ceiling {
            let now = Instant::now();
            let since = *state.over_ceiling_since.get_or_insert(now);
            if now.duration_since(since) >= shared.config.overflow_grace() {
                let queued = state.queue.len();
                state.queue.clear();
                state.closed = Some(CloseReason::Overflow);
                drop(state);
                shared.notify.notify_one();
                return Err(DeliveryError::Overflow {
                    connection: shared.connection,
                    queued,
                    ceiling: shared.config.hard_ceiling,
                });
            }
        } else {
            state.over_ceiling_since = None;
        }

        drop(state);
        shared.notify.notify_one();
        Ok(outcome)
    }

    /// Close the channel. Already queued messages still drain.
    pub fn close(&self) {
        close(&self.shared, CloseReason::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed.is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Consuming half, owned by the connection's writer task
pub struct DeliveryReceiver {
    shared: Arc<Shared>,
}

impl DeliveryReceiver {
    pub fn connection(&self) -> ConnectionId {
        self.shared.connection
    }

    /// Next message, or `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        loop {
            match self.poll_state() {
                Polled::Message(message) => return Some(message),
                Polled::Closed => return None,
                Polled::Empty => self.shared.notify.notified().await,
            }
        }
    }

    /// Next message without waiting.
    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        match self.poll_state() {
            Polled::Message(message) => Some(message),
            Polled::Closed | Polled::Empty => None,
        }
    }

    /// Every message currently queued.
    pub fn drain(&mut self) -> Vec<ServerMessage> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    fn poll_state(&self) -> Polled {
        let mut state = self.shared.state.lock();
        if let Some(entry) = state.queue.pop_front() {
            if state.queue.len() <= self.shared.config.hard_ceiling {
                state.over_ceiling_since = None;
            }
            return Polled::Message(entry.message);
        }
        if state.closed.is_some() {
            Polled::Closed
        } else {
            Polled::Empty
        }
    }

    pub fn close(&self) {
        close(&self.shared, CloseReason::Closed);
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.state.lock().closed
    }
}

impl Drop for DeliveryReceiver {
    fn drop(&mut self) {
        close(&self.shared, CloseReason::Closed);
    }
}

enum Polled {
    Message(ServerMessage),
    Empty,
    Closed,
}

fn close(shared: &Shared, reason: CloseReason) {
    {
        let mut state = shared.state.lock();
        if state.closed.is_none() {
            state.closed = Some(reason);
        }
    }
    shared.notify.notify_one();
}

/// Remove the most recent queued message of the same subscription if it is
/// a result. A non-result message in between pins the order.
fn take_coalescable(queue: &mut VecDeque<Entry>, incoming: &ServerMessage) -> Option<Entry> {
    let subscription = incoming.subscription_id()?;
    let position = queue
        .iter()
        .rposition(|entry| entry.message.subscription_id() == Some(subscription))?;
    if queue[position].latest.is_none() {
        return None;
    }
    queue.remove(position)
}

fn merge(previous: Entry, incoming: ServerMessage, value: Arc<Value>) -> Entry {
    let seq = incoming.seq().unwrap_or(CommitSeq::ZERO);
    let message = match (previous.message, incoming) {
        (
            ServerMessage::Initial {
                subscription_id,
                request_id,
                ..
            },
            _,
        ) => ServerMessage::Initial {
            subscription_id,
            request_id,
            seq,
            value: Arc::clone(&value),
        },
        (
            _,
            ServerMessage::Initial {
                subscription_id,
                request_id,
                ..
            },
        ) => ServerMessage::Initial {
            subscription_id,
            request_id,
            seq,
            value: Arc::clone(&value),
        },
        (_, incoming) => ServerMessage::Update {
            subscription_id: incoming
                .subscription_id()
                .unwrap_or_default(),
            seq,
            value: Arc::clone(&value),
        },
    };
    Entry {
        message,
        latest: Some(value),
    }
}
