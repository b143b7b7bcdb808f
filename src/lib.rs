//! reflux - reactive query subscriptions
//!
//! Clients subscribe to read queries and receive pushed updates when, and
//! only when, the data a query read changes.
//!
//! Flow: store commit → `feed` listener → `scheduler` asks the dependency
//! `index` which subscriptions are affected → `tracker` re-executes them on
//! a fresh snapshot → content-hash diff → `delivery` channel per connection.
//! The `registry` owns every subscription.

pub mod cli;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod errors;
pub mod feed;
pub mod functions;
pub mod ids;
pub mod index;
pub mod observability;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod tracker;

pub use config::EngineConfig;
pub use engine::Engine;
pub use errors::{EngineError, EngineResult};
pub use ids::{ConnectionId, SubscriptionId};
