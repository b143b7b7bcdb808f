//! # WebSocket Server
//!
//! Network layer for the client protocol: one delivery channel per socket,
//! JSON text frames in both directions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::delivery::{ClientMessage, ServerMessage};
use crate::engine::Engine;
use crate::errors::{EngineError, EngineResult};
use crate::ids::ConnectionId;
use crate::observability::Event;
use crate::tracker::QueryDescriptor;

/// WebSocket server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub bind_addr: String,

    /// Open sockets accepted at once
    pub max_connections: usize,

    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,

    /// Close a socket that sent nothing for this long, in seconds
    pub connection_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4000".to_string(),
            max_connections: 1_000,
            heartbeat_interval_secs: 30,
            connection_timeout_secs: 90,
        }
    }
}

pub struct WebSocketServer {
    config: ServerConfig,
    engine: Arc<Engine>,
    shutdown_tx: broadcast::Sender<()>,
    open: Arc<AtomicUsize>,
}

impl WebSocketServer {
    pub fn new(config: ServerConfig, engine: Arc<Engine>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            engine,
            shutdown_tx,
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> EngineResult<TcpListener> {
        let addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .map_err(|e| EngineError::Config(format!("invalid bind address: {}", e)))?;
        Ok(TcpListener::bind(&addr).await?)
    }

    /// Bind and serve until `shutdown` is called.
    pub async fn run(&self) -> EngineResult<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until `shutdown` is called.
    pub async fn serve(&self, listener: TcpListener) -> EngineResult<()> {
        let addr = listener.local_addr()?;
        info!(event = %Event::Serving, addr = %addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if self.open.load(Ordering::SeqCst) >= self.config.max_connections {
                                warn!(peer = %peer, "connection limit reached, refusing");
                                drop(stream);
                                continue;
                            }
                            self.open.fetch_add(1, Ordering::SeqCst);

                            let engine = Arc::clone(&self.engine);
                            let config = self.config.clone();
                            let open = Arc::clone(&self.open);
                            let shutdown = self.shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, engine, config, shutdown).await {
                                    warn!(peer = %peer, code = e.code(), error = %e, "connection failed");
                                }
                                open.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed");
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("websocket server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Sockets currently open
    pub fn connection_count(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<Engine>,
    config: ServerConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> EngineResult<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| EngineError::Transport(format!("websocket handshake failed: {}", e)))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let mut outbound = engine.connect()?;
    let connection = outbound.connection();
    debug!(connection = %connection, peer = %peer, "websocket accepted");

    engine.send(connection, ServerMessage::System {
        message: format!("connected: {}", connection),
    });

    let heartbeat_every = Duration::from_secs(config.heartbeat_interval_secs.max(1));
    let idle_limit = Duration::from_secs(config.connection_timeout_secs);
    let mut heartbeat =
        tokio::time::interval_at(tokio::time::Instant::now() + heartbeat_every, heartbeat_every);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => process_client_message(&engine, connection, message).await,
                            Err(e) => {
                                engine.send(connection, ServerMessage::error(
                                    None,
                                    "REFLUX_INVALID_MESSAGE",
                                    format!("invalid message format: {}", e),
                                ));
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        last_seen = Instant::now();
                        engine.send(connection, ServerMessage::error(
                            None,
                            "REFLUX_UNSUPPORTED",
                            "binary messages are not supported",
                        ));
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                            debug!(connection = %connection, error = %e, "pong failed");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(connection = %connection, error = %e, "receive failed");
                        break;
                    }
                    Some(Ok(_)) => {
                        last_seen = Instant::now();
                    }
                }
            }

            outgoing = outbound.recv() => {
                let Some(message) = outgoing else {
                    // Closed by the engine: overflow, shutdown or teardown.
                    break;
                };
                match serde_json::to_string(&message) {
                    Ok(json) => {
                        if let Err(e) = ws_sender.send(Message::Text(json)).await {
                            debug!(connection = %connection, error = %e, "send failed");
                            break;
                        }
                    }
                    Err(e) => error!(connection = %connection, error = %e, "serialize failed"),
                }
            }

            _ = heartbeat.tick() => {
                if !idle_limit.is_zero() && last_seen.elapsed() > idle_limit {
                    debug!(connection = %connection, "idle timeout");
                    break;
                }
                engine.send(connection, ServerMessage::heartbeat(None));
            }

            _ = shutdown.recv() => break,
        }
    }

    engine.close_connection(connection);
    let _ = ws_sender.close().await;
    Ok(())
}

async fn process_client_message(
    engine: &Engine,
    connection: ConnectionId,
    message: ClientMessage,
) {
    match message {
        ClientMessage::Subscribe {
            request_id,
            function,
            args,
        } => {
            let descriptor = QueryDescriptor::new(function, args);
            if let Err(e) = engine
                .subscribe(connection, descriptor, request_id.clone())
                .await
            {
                engine.send(connection, ServerMessage::Error {
                    subscription_id: None,
                    request_id,
                    code: e.code().to_string(),
                    message: e.to_string(),
                });
            }
        }

        ClientMessage::Unsubscribe { subscription_id } => {
            engine.unsubscribe(connection, subscription_id);
        }

        ClientMessage::Heartbeat { ref_id } => {
            engine.send(connection, ServerMessage::heartbeat(ref_id));
        }
    }
}
