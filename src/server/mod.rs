//! Client-facing transport

mod websocket;

pub use websocket::{ServerConfig, WebSocketServer};
