//! # Engine Errors
//!
//! Every module error converges here. Codes are stable strings sent on the
//! wire and written to logs.

use thiserror::Error;

use crate::delivery::DeliveryError;
use crate::feed::FeedError;
use crate::functions::FunctionError;
use crate::ids::ConnectionId;
use crate::store::StoreError;
use crate::tracker::TrackerError;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Function(#[from] FunctionError),

    /// The connection already hosts its maximum number of subscriptions
    #[error("connection {connection} already has {limit} subscriptions")]
    TooManySubscriptions {
        connection: ConnectionId,
        limit: usize,
    },

    /// The connection is not open
    #[error("unknown or closed connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Client transport failure (handshake, framing)
    #[error("transport error: {0}")]
    Transport(String),

    /// Engine is shutting down
    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Store(e) => e.code(),
            EngineError::Tracker(e) => e.code(),
            EngineError::Feed(e) => e.code(),
            EngineError::Delivery(e) => e.code(),
            EngineError::Function(e) => e.code(),
            EngineError::TooManySubscriptions { .. } => "REFLUX_TOO_MANY_SUBSCRIPTIONS",
            EngineError::UnknownConnection(_) => "REFLUX_UNKNOWN_CONNECTION",
            EngineError::Config(_) => "REFLUX_CONFIG_INVALID",
            EngineError::Io(_) => "REFLUX_IO_ERROR",
            EngineError::Transport(_) => "REFLUX_TRANSPORT",
            EngineError::ShuttingDown => "REFLUX_SHUTTING_DOWN",
            EngineError::Internal(_) => "REFLUX_INTERNAL",
        }
    }

    /// Error caused by the client's request rather than the engine
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::Tracker(
                TrackerError::UnknownFunction(_)
                    | TrackerError::InvalidQueryEffect { .. }
                    | TrackerError::QueryFailed { .. }
            ) | EngineError::TooManySubscriptions { .. }
        )
    }
}
