//! # Subscriptions
//!
//! A live query owned by one connection. Mutable state sits behind a
//! per-subscription mutex; every result applied and every message queued
//! for the subscription happens while holding it, so deliveries for one
//! subscription leave in the order results were applied.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;

use crate::delivery::DeliverySender;
use crate::ids::{ConnectionId, SubscriptionId};
use crate::store::CommitSeq;
use crate::tracker::{ContentHash, Execution, QueryDescriptor, ReadSet};

/// Mutable part of a subscription
#[derive(Debug, Clone)]
pub struct SubscriptionState {
    /// Read-set of the last applied execution
    pub read_set: ReadSet,
    /// Last applied result
    pub result: Arc<Value>,
    /// Content hash of `result`
    pub hash: ContentHash,
    /// Snapshot sequence number of the last applied execution
    pub watermark: CommitSeq,
    /// Failed recomputes since the last success
    pub consecutive_failures: u32,
    /// Last recompute failed; retried on the next cycle
    pub degraded: bool,
    /// Torn down; results computed for it are discarded
    pub removed: bool,
}

impl SubscriptionState {
    fn from_execution(execution: Execution) -> Self {
        Self {
            read_set: execution.read_set,
            result: execution.result,
            hash: execution.hash,
            watermark: execution.seq,
            consecutive_failures: 0,
            degraded: false,
            removed: false,
        }
    }
}

#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    descriptor: QueryDescriptor,
    connection: ConnectionId,
    created_at: DateTime<Utc>,
    sender: DeliverySender,
    state: Mutex<SubscriptionState>,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        descriptor: QueryDescriptor,
        sender: DeliverySender,
        initial: Execution,
    ) -> Self {
        Self {
            id,
            descriptor,
            connection: sender.connection(),
            created_at: Utc::now(),
            sender,
            state: Mutex::new(SubscriptionState::from_execution(initial)),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn sender(&self) -> &DeliverySender {
        &self.sender
    }

    /// Lock the mutable state.
    pub fn lock(&self) -> MutexGuard<'_, SubscriptionState> {
        self.state.lock()
    }

    /// Copy of the current state
    pub fn state(&self) -> SubscriptionState {
        self.state.lock().clone()
    }

    pub fn result(&self) -> Arc<Value> {
        Arc::clone(&self.state.lock().result)
    }

    pub fn watermark(&self) -> CommitSeq {
        self.state.lock().watermark
    }

    pub fn is_degraded(&self) -> bool {
        self.state.lock().degraded
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    /// Mark removed. Returns false if it already was.
    pub(crate) fn mark_removed(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.removed, true)
    }
}
