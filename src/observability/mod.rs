//! Observability subsystem for reflux
//!
//! This module provides:
//! - Structured logging through `tracing` (JSON or text)
//! - Lifecycle event names
//! - Counters for the recompute and delivery pipeline
//!
//! Counters and log lines never feed back into scheduling decisions. A
//! logging setup failure is reported to the caller and the engine keeps
//! running without it.
//!
//! # Usage
//!
//! ```ignore
//! use reflux::observability::{log_event, Event, MetricsRegistry};
//!
//! log_event(Event::BootStart);
//! tracing::info!(event = %Event::SubscriptionCreated, subscription = %id);
//!
//! let metrics = MetricsRegistry::new();
//! metrics.increment_recomputes_executed();
//! ```

mod events;
mod logger;
mod metrics;

pub use events::Event;
pub use logger::{init_logging, LogFormat};
pub use metrics::{MetricsRegistry, MetricsSnapshot};

use std::fmt;

use tracing::Level;

/// Observability error
///
/// Never fatal: callers report it and carry on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilityError {
    message: String,
}

impl ObservabilityError {
    /// Create a new observability error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        "REFLUX_OBSERVABILITY_FAILED"
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ObservabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message)
    }
}

impl std::error::Error for ObservabilityError {}

/// Result type for observability operations
pub type ObservabilityResult<T> = Result<T, ObservabilityError>;

/// Log a lifecycle event with no extra fields
pub fn log_event(event: Event) {
    let name = event.as_str();
    let level = event.level();
    if level == Level::ERROR {
        tracing::error!(event = name);
    } else if level == Level::WARN {
        tracing::warn!(event = name);
    } else if level == Level::INFO {
        tracing::info!(event = name);
    } else {
        tracing::debug!(event = name);
    }
}
