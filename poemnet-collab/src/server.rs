//! WebSocket ingress for collaboration traffic.
//!
//! ```text
//! GET /api/ws ──▶ upgrade check ──426──▶ (no websocket, no server touch)
//!                      │101
//!                      ▼
//!               CollabServer::handle_socket
//!                      │  first valid `join` picks the room
//!                      ▼
//!        ChannelRegistry ── poem:{id} channel ── fan-out to peers
//! ```
//!
//! The upgrade handler is a pure protocol bridge: no authentication,
//! no message parsing. Frame validation happens in the socket loop via
//! the message schema; invalid frames are logged and dropped without
//! closing the connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::channel::{poem_channel_name, ChannelRegistry};
use crate::message::CollaborationMessage;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast buffer capacity per poem channel
    pub channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            channel_capacity: 256,
        }
    }
}

/// Server-wide counters.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

impl AtomicServerStats {
    fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
        }
    }
}

/// Routes collaboration sockets onto per-poem channels.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<ChannelRegistry>,
    stats: AtomicServerStats,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ChannelRegistry::new(config.channel_capacity));
        Self {
            config,
            registry,
            stats: AtomicServerStats::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// The channel registry this server fans out through.
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
        }
    }

    /// Bind and serve until the task is cancelled.
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collaboration server listening on {}", self.config.bind_addr);
        axum::serve(listener, router(self)).await
    }

    /// Take ownership of an upgraded socket and route its traffic.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        self.socket_loop(socket).await;
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    async fn socket_loop(&self, mut socket: WebSocket) {
        // The first valid frame must be a join; it selects the room.
        // Invalid frames are dropped, anything else valid closes us.
        let (poem_id, user_id) = loop {
            match socket.recv().await {
                Some(Ok(Message::Text(text))) => {
                    self.count_frame(text.len());
                    match CollaborationMessage::from_json(text.as_str()) {
                        Ok(CollaborationMessage::Join { poem_id, user_id }) => {
                            break (poem_id, user_id)
                        }
                        Ok(other) => {
                            log::warn!("socket sent `{}` before join; closing", other.kind());
                            return;
                        }
                        Err(e) => log::warn!("dropping invalid frame: {e}"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("socket error before join: {e}");
                    return;
                }
            }
        };

        let channel = self.registry.acquire(&poem_channel_name(poem_id)).await;
        let mut room_rx = channel.receiver();
        let _ = channel.publish(&CollaborationMessage::Join { poem_id, user_id });
        log::info!("user {user_id} joined poem {poem_id}");

        let (mut sink, mut stream) = socket.split();
        loop {
            tokio::select! {
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        self.count_frame(text.len());
                        match CollaborationMessage::from_json(text.as_str()) {
                            Ok(msg) => {
                                let _ = channel.publish(&msg);
                            }
                            Err(e) => {
                                log::warn!("dropping invalid frame from {user_id}: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("socket error from {user_id}: {e}");
                        break;
                    }
                },
                outbound = room_rx.recv() => match outbound {
                    Ok(frame) => {
                        if frame_sender(&frame) == Some(user_id) {
                            // Presence echo back to its own sender. Edits
                            // carry no sender and fan out to everyone.
                            continue;
                        }
                        if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("socket for {user_id} lagged by {n} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        // Best-effort: peers learn of the drop even without a clean leave.
        let _ = channel.publish(&CollaborationMessage::Leave { poem_id, user_id });
        log::info!("user {user_id} left poem {poem_id}");
    }

    fn count_frame(&self, bytes: usize) {
        self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
        self.stats.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Attributable sender of an already-validated room frame.
fn frame_sender(frame: &str) -> Option<Uuid> {
    serde_json::from_str::<CollaborationMessage>(frame)
        .ok()
        .and_then(|msg| msg.sender_id())
}

/// Build the ingress router: `GET /api/ws`.
pub fn router(server: Arc<CollabServer>) -> Router {
    Router::new()
        .route("/api/ws", get(ws_upgrade))
        .with_state(server)
}

/// `GET /api/ws`: WebSocket upgrade or 426, nothing else.
async fn ws_upgrade(
    State(server): State<Arc<CollabServer>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(upgrade) => upgrade.on_upgrade(move |socket| server.handle_socket(socket)),
        Err(rejection) => {
            // Not a WebSocket handshake; the collaboration server is
            // never touched.
            log::debug!("rejected non-upgrade request to /api/ws: {rejection}");
            (StatusCode::UPGRADE_REQUIRED, "websocket upgrade required").into_response()
        }
    }
}
