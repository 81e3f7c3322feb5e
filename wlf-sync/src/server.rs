//! WebSocket room server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── Room "lobby" ──┐
//!            ├── RoomDirectory ────┤                  ├── PersistQueue ── RoomStore
//! Client B ──┘     (key → Room)    └── Room "vault" ──┘                   (Memory / RocksDB)
//! ```
//!
//! Each connection runs two tasks:
//! - a reader that decodes inbound frames and applies them to the joined
//!   room while holding its lock
//! - a writer that drains the session's outbound queue onto the socket
//!
//! The upgrade request must carry the `ident` and `name` tokens (query
//! string or cookies); anything else is refused with 401 before a session
//! exists.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::ServerConfig;
use crate::directory::{RoomDirectory, RoomHandle};
use crate::identity::{normalize_room_key, IdentityTokens};
use crate::protocol::{ClientCommand, JoinRequest};
use crate::session::{Outbound, Session};
use crate::storage::{MemoryStore, RocksStore, RoomStore, StoreConfig, StoreError};

/// How long a closing connection waits to queue its close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Upgrades refused for missing identity tokens
    pub refused_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_messages: u64,
}

/// The room server.
pub struct SyncServer {
    config: ServerConfig,
    directory: Arc<RoomDirectory>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening RocksDB if a storage path is configured.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn RoomStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig::at(path))?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn RoomStore>) -> Self {
        let directory = RoomDirectory::new(store, config.room.clone(), config.persist.clone());
        Self {
            config,
            directory,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Default configuration, in-memory store.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.config.bind_addr).await
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` forever.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!("Room server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let directory = self.directory.clone();
            let stats = self.stats.clone();
            let capacity = self.config.outbound_capacity;

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, directory, stats, capacity).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn directory(&self) -> &Arc<RoomDirectory> {
        &self.directory
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    directory: Arc<RoomDirectory>,
    stats: Arc<RwLock<ServerStats>>,
    outbound_capacity: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut tokens: Option<IdentityTokens> = None;
    let check_identity = |request: &Request, response: Response| {
        let query = request.uri().query();
        let cookie = request
            .headers()
            .get(header::COOKIE)
            .and_then(|value| value.to_str().ok());
        match IdentityTokens::from_request_parts(query, cookie) {
            Some(found) => {
                tokens = Some(found);
                Ok(response)
            }
            None => {
                let mut refusal = ErrorResponse::new(Some("missing identity tokens".to_string()));
                *refusal.status_mut() = StatusCode::UNAUTHORIZED;
                Err(refusal)
            }
        }
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, check_identity).await {
        Ok(ws) => ws,
        Err(e) => {
            stats.write().await.refused_connections += 1;
            log::info!("Refused connection from {addr}: {e}");
            return Ok(());
        }
    };
    let Some(tokens) = tokens else {
        return Ok(());
    };

    let (session, outbound_rx) = Session::channel(tokens.into_identity(), outbound_capacity);
    let session = Arc::new(session);
    let (ws_sender, mut ws_receiver) = ws_stream.split();
    let mut writer = tokio::spawn(write_outbound(ws_sender, outbound_rx, addr));

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }
    log::info!(
        "WebSocket connection established from {addr} as {}",
        session.display_name()
    );

    // Echo the bootstrap identity before any room is joined.
    session.send_ident("");
    session.send_name("");

    let mut room: Option<RoomHandle> = None;

    loop {
        tokio::select! {
            _ = session.closed() => {
                log::info!("Session {} closed by the server, closing {addr}", session.conn_id());
                break;
            }

            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += text.len() as u64;
                        }

                        match ClientCommand::decode(text.as_str()) {
                            Ok(ClientCommand::JoinRoom(request)) => {
                                if !join_room(&directory, &session, &mut room, request).await {
                                    break;
                                }
                            }
                            Ok(command) => match &room {
                                Some(handle) => handle.lock().await.handle_command(&session, command),
                                None => log::debug!("{} from {addr} before joining a room", command.name()),
                            },
                            Err(e) => {
                                stats.write().await.malformed_messages += 1;
                                log::debug!("Malformed frame from {addr}: {e}");
                            }
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }

                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break;
                    }

                    _ => {}
                }
            }
        }
    }

    // Cleanup: leave the room, then flush and close the socket.
    if let Some(handle) = room.take() {
        handle.lock().await.leave(&session);
    }
    if tokio::time::timeout(CLOSE_GRACE, session.finish()).await.is_err() {
        writer.abort();
    }
    if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }

    stats.write().await.active_connections -= 1;
    Ok(())
}

/// Handle `joinRoom`. Returns `false` when the connection must close.
async fn join_room(
    directory: &RoomDirectory,
    session: &Arc<Session>,
    room: &mut Option<RoomHandle>,
    request: JoinRequest,
) -> bool {
    let key = normalize_room_key(&request.room);
    if key.is_empty() {
        log::debug!("Ignoring join with empty room key from {}", session.conn_id());
        return true;
    }

    // One room per session.
    if session.room_key().as_deref() != Some(key.as_str()) {
        if let Some(current) = room.take() {
            current.lock().await.leave(session);
        }
    }

    match directory.join(&key, session, request.pass.as_deref()).await {
        Some(handle) => {
            *room = Some(handle);
            true
        }
        None => false,
    }
}

/// Drain the outbound queue onto the socket until the close marker.
async fn write_outbound(mut sink: WsSink, mut rx: mpsc::Receiver<Outbound>, addr: SocketAddr) {
    while let Some(item) = rx.recv().await {
        let encoded = match item {
            Outbound::Event(event) => event.encode(),
            Outbound::Close => break,
        };
        match encoded {
            Ok(text) => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    log::debug!("Write to {addr} failed: {e}");
                    return;
                }
            }
            Err(e) => log::warn!("Dropping unencodable outbound to {addr}: {e}"),
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}
