//! # Delivery Errors

use thiserror::Error;

use crate::ids::ConnectionId;

/// Result type for delivery operations
pub type DeliveryResult<T> = Result<T, DeliveryError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The connection is already closed
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    /// The buffer stayed above its hard ceiling past the grace period
    #[error("connection {connection} overflowed: {queued} messages queued, ceiling {ceiling}")]
    Overflow {
        connection: ConnectionId,
        queued: usize,
        ceiling: usize,
    },
}

impl DeliveryError {
    pub fn code(&self) -> &'static str {
        match self {
            DeliveryError::Closed(_) => "REFLUX_DELIVERY_CLOSED",
            DeliveryError::Overflow { .. } => "REFLUX_DELIVERY_OVERFLOW",
        }
    }

    pub fn connection(&self) -> ConnectionId {
        match self {
            DeliveryError::Closed(connection) | DeliveryError::Overflow { connection, .. } => {
                *connection
            }
        }
    }
}
