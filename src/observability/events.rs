//! Observability events for reflux
//!
//! Every lifecycle transition of the engine has exactly one event name.
//! Events are explicit and typed; log lines carry the name in their
//! `event` field.

use std::fmt;

use tracing::Level;

/// Observable events in reflux
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Boot & Lifecycle
    /// Engine startup begins
    BootStart,
    /// Engine started, scheduler running
    BootComplete,
    /// Shutdown initiated
    ShutdownStart,
    /// Shutdown complete
    ShutdownComplete,
    /// Configuration loaded
    ConfigLoaded,
    /// Server accepting connections
    Serving,

    // Connections
    /// Connection opened
    ConnectionOpened,
    /// Connection closed, subscriptions torn down
    ConnectionClosed,
    /// Connection failed with `DeliveryOverflow`
    DeliveryOverflow,

    // Subscriptions
    /// Subscription created and initial snapshot queued
    SubscriptionCreated,
    /// Subscription request rejected
    SubscriptionRejected,
    /// Subscription removed
    SubscriptionRemoved,
    /// Recompute failed; subscription degraded
    SubscriptionDegraded,
    /// Degraded subscription recomputed successfully
    SubscriptionRecovered,
    /// Subscription torn down after repeated failures
    SubscriptionTerminated,

    // Change feed
    /// Listener opened at a resume point
    FeedOpened,
    /// Change log read failed transiently; retrying
    FeedReconnecting,
    /// Listener resumed after a transient failure
    FeedReconnected,
    /// Change log truncated or discontinuous
    FeedGap,
    /// Checkpoint persisted
    CheckpointWritten,

    // Scheduler
    /// Batch applied
    BatchApplied,
    /// Full resync started
    ResyncStart,
    /// Full resync complete
    ResyncComplete,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::BootStart => "REFLUX_STARTUP_BEGIN",
            Event::BootComplete => "REFLUX_STARTUP_COMPLETE",
            Event::ShutdownStart => "SHUTDOWN_START",
            Event::ShutdownComplete => "SHUTDOWN_COMPLETE",
            Event::ConfigLoaded => "CONFIG_LOADED",
            Event::Serving => "REFLUX_SERVING",

            Event::ConnectionOpened => "CONNECTION_OPENED",
            Event::ConnectionClosed => "CONNECTION_CLOSED",
            Event::DeliveryOverflow => "DELIVERY_OVERFLOW",

            Event::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            Event::SubscriptionRejected => "SUBSCRIPTION_REJECTED",
            Event::SubscriptionRemoved => "SUBSCRIPTION_REMOVED",
            Event::SubscriptionDegraded => "SUBSCRIPTION_DEGRADED",
            Event::SubscriptionRecovered => "SUBSCRIPTION_RECOVERED",
            Event::SubscriptionTerminated => "SUBSCRIPTION_TERMINATED",

            Event::FeedOpened => "FEED_OPENED",
            Event::FeedReconnecting => "FEED_RECONNECTING",
            Event::FeedReconnected => "FEED_RECONNECTED",
            Event::FeedGap => "FEED_GAP",
            Event::CheckpointWritten => "CHECKPOINT_WRITTEN",

            Event::BatchApplied => "BATCH_APPLIED",
            Event::ResyncStart => "RESYNC_BEGIN",
            Event::ResyncComplete => "RESYNC_COMPLETE",
        }
    }

    /// Level the event is logged at
    pub fn level(&self) -> Level {
        match self {
            Event::FeedGap | Event::DeliveryOverflow | Event::SubscriptionTerminated => Level::ERROR,
            Event::SubscriptionDegraded
            | Event::SubscriptionRejected
            | Event::FeedReconnecting
            | Event::ResyncStart => Level::WARN,
            Event::BatchApplied | Event::CheckpointWritten => Level::DEBUG,
            _ => Level::INFO,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
