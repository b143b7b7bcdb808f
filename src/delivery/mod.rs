//! # Delivery
//!
//! Per-connection ordered transport of subscription messages, with
//! coalescing under backpressure and a hard ceiling.

mod channel;
mod diff;
mod errors;
mod message;

pub use channel::{channel, CloseReason, DeliveryConfig, DeliveryReceiver, DeliverySender, Enqueued};
pub use diff::Delta;
pub use errors::{DeliveryError, DeliveryResult};
pub use message::{ClientMessage, ServerMessage};
