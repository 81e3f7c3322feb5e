//! WebSocket client for the room server.
//!
//! Provides:
//! - Connection lifecycle with the identity handshake
//! - Room join that resolves on `joinRoom` or fails on `passwordFailed`
//! - A local mirror of the room ([`Reconciler`]) and a typed [`EventBus`]
//! - The full command set (data writes, grants, passwords, relay)
//!
//! ```text
//!   socket ── reader task ──► Reconciler ──► EventBus listeners
//!                                  │
//!                                  └──────► SyncEvent channel
//!   commands ── mpsc ── writer task ──► socket
//! ```

pub mod bus;
pub mod reconciler;

pub use bus::{EventBus, SubscriptionId, Topic, ALL};
pub use reconciler::{ReconcileEvent, Reconciler};

use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::identity::{normalize_room_key, IdentityTokens};
use crate::protocol::{
    ClientCommand, DataPart, GrantRequest, JoinRequest, ProfileUpdate, ProtocolError, ServerEvent,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Identity acknowledged by the server
    Connected,
    /// Connection lost
    Disconnected,
    /// Reconciled change
    Update(ReconcileEvent),
}

/// Client errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("join rejected for room {0}")]
    JoinRejected(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("connect failed: {0}")]
    Connect(String),
}

type JoinReply = oneshot::Sender<Result<String, ClientError>>;

/// State shared with the reader task.
#[derive(Default)]
struct Shared {
    mirror: Mutex<Reconciler>,
    bus: Mutex<EventBus>,
    pending_join: Mutex<Option<JoinReply>>,
    pending_pass: Mutex<Option<oneshot::Sender<String>>>,
}

/// The room client.
///
/// Listeners run on the reader task. They may read the mirror through
/// [`SyncClient::document`] and friends but must not subscribe or
/// unsubscribe from inside a callback.
pub struct SyncClient {
    server_url: String,
    tokens: IdentityTokens,
    state: Arc<RwLock<ConnectionState>>,
    shared: Arc<Shared>,
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// Create a client with freshly generated identity tokens.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_tokens(server_url, IdentityTokens::generate())
    }

    /// Create a client presenting the given identity tokens.
    pub fn with_tokens(server_url: impl Into<String>, tokens: IdentityTokens) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            tokens,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            shared: Arc::new(Shared::default()),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once). Events are
    /// dropped while the channel is full.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and wait for the server to acknowledge the identity.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!("{}?{}", self.server_url, self.tokens.to_query());
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_writer.send(message).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });
        self.outgoing_tx = Some(out_tx);

        // Reader task: reconcile pushes and fan them out
        let (ident_tx, ident_rx) = oneshot::channel::<()>();
        let shared = self.shared.clone();
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut ident_tx = Some(ident_tx);
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            if matches!(event, ServerEvent::SetIdent(_)) {
                                if let Some(tx) = ident_tx.take() {
                                    let _ = tx.send(());
                                }
                            }
                            dispatch(&shared, &event_tx, event);
                        }
                        Err(e) => log::debug!("Ignoring undecodable push: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            fail_pending(&shared);
            let _ = event_tx.try_send(SyncEvent::Disconnected);
        });

        if ident_rx.await.is_err() {
            self.outgoing_tx = None;
            return Err(ClientError::ConnectionClosed);
        }
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.try_send(SyncEvent::Connected);
        Ok(())
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Join a room. Resolves with the normalized key once the server
    /// confirms; a rejected password fails with [`ClientError::JoinRejected`]
    /// and the server then closes the connection.
    pub async fn join_room(&self, room: &str, pass: Option<&str>) -> Result<String, ClientError> {
        if normalize_room_key(room).is_empty() {
            return Err(ClientError::InvalidArgument(format!("room key {room:?}")));
        }

        let (tx, rx) = oneshot::channel();
        *lock(&self.shared.pending_join) = Some(tx);
        self.send(ClientCommand::JoinRoom(JoinRequest {
            room: room.to_string(),
            pass: pass.map(str::to_string),
        }))
        .await?;

        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Set one top-level key.
    pub async fn set_value(&self, key: &str, value: Value) -> Result<(), ClientError> {
        let mut patch = Map::new();
        patch.insert(key.to_string(), value);
        self.set_data(patch).await
    }

    /// Shallow merge into the document.
    pub async fn set_data(&self, patch: Map<String, Value>) -> Result<(), ClientError> {
        self.send(ClientCommand::SetData(Value::Object(patch))).await
    }

    /// Replace the whole document.
    pub async fn replace_data(&self, document: Map<String, Value>) -> Result<(), ClientError> {
        self.send(ClientCommand::ReplaceData(Value::Object(document))).await
    }

    pub async fn set_data_part(&self, part: &str, data: Value) -> Result<(), ClientError> {
        if part.is_empty() {
            return Err(ClientError::InvalidArgument("empty part path".to_string()));
        }
        self.send(ClientCommand::SetDataPart(DataPart {
            part: part.to_string(),
            data,
        }))
        .await
    }

    pub async fn remove_keys<I, S>(&self, keys: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys = keys.into_iter().map(|k| Value::String(k.into())).collect();
        self.send(ClientCommand::RemoveData(Value::Array(keys))).await
    }

    /// Set the rank of the member with pseudonym `ident`: `admin`, `write`
    /// or `join`. Lowering a rank revokes the ones above it; other ranks are
    /// ignored by the server.
    pub async fn grant_user(&self, ident: &str, rank: &str) -> Result<(), ClientError> {
        self.send(ClientCommand::GrantUser(GrantRequest {
            ident: ident.to_string(),
            rank: rank.to_string(),
        }))
        .await
    }

    /// Set or clear the room password (admins only).
    pub async fn set_password(&self, password: Option<&str>) -> Result<(), ClientError> {
        self.send(ClientCommand::SetPassword(password.map(str::to_string)))
            .await
    }

    /// Ask for a one-time credential and wait for it. Non-admins never get
    /// an answer, so callers should bound this with a timeout.
    pub async fn request_one_time_pass(&self) -> Result<String, ClientError> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.shared.pending_pass) = Some(tx);
        self.send(ClientCommand::GetOneTimePass).await?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)
    }

    /// Relay an opaque payload to every member, sender included.
    pub async fn relay(&self, data: Value) -> Result<(), ClientError> {
        self.send(ClientCommand::Relay(data)).await
    }

    /// Change the display name.
    pub async fn update_user(&self, name: &str) -> Result<(), ClientError> {
        self.send(ClientCommand::UpdateUser(ProfileUpdate {
            name: Value::String(name.to_string()),
        }))
        .await
    }

    /// Request a room dump (admins only); it arrives as [`Topic::Debug`].
    pub async fn debug(&self) -> Result<(), ClientError> {
        self.send(ClientCommand::Debug).await
    }

    async fn send(&self, command: ClientCommand) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        let encoded = command.encode()?;
        tx.send(Message::Text(encoded.into()))
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    // ─── Listeners ─────────────────────────────────────────

    pub fn subscribe(
        &self,
        topic: Topic,
        key: impl Into<String>,
        listener: impl FnMut(&ReconcileEvent) + Send + 'static,
    ) -> SubscriptionId {
        lock(&self.shared.bus).subscribe(topic, key, listener)
    }

    pub fn subscribe_all(
        &self,
        topic: Topic,
        listener: impl FnMut(&ReconcileEvent) + Send + 'static,
    ) -> SubscriptionId {
        lock(&self.shared.bus).subscribe_all(topic, listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock(&self.shared.bus).unsubscribe(id)
    }

    // ─── Mirror ────────────────────────────────────────────

    pub fn document(&self) -> Map<String, Value> {
        lock(&self.shared.mirror).document().clone()
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        lock(&self.shared.mirror).document().get(key).cloned()
    }

    pub fn roster(&self) -> Map<String, Value> {
        lock(&self.shared.mirror).roster().clone()
    }

    pub fn own_profile(&self) -> Option<Value> {
        lock(&self.shared.mirror).own_profile().cloned()
    }

    pub fn room(&self) -> Option<String> {
        lock(&self.shared.mirror).room().map(str::to_string)
    }

    /// Stable id as echoed by the server.
    pub fn ident(&self) -> Option<String> {
        lock(&self.shared.mirror).ident().map(str::to_string)
    }

    pub fn name(&self) -> Option<String> {
        lock(&self.shared.mirror).name().map(str::to_string)
    }

    pub fn tokens(&self) -> &IdentityTokens {
        &self.tokens
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reconcile one push, resolve waiters, then notify listeners.
fn dispatch(shared: &Shared, event_tx: &mpsc::Sender<SyncEvent>, event: ServerEvent) {
    match &event {
        ServerEvent::JoinRoom(env) => {
            if let Some(tx) = lock(&shared.pending_join).take() {
                let _ = tx.send(Ok(env.data.clone()));
            }
        }
        ServerEvent::PasswordFailed(env) => {
            if let Some(tx) = lock(&shared.pending_join).take() {
                let _ = tx.send(Err(ClientError::JoinRejected(env.data.clone())));
            }
        }
        ServerEvent::OneTimePass(env) => {
            if let Some(tx) = lock(&shared.pending_pass).take() {
                let _ = tx.send(env.data.clone());
            }
        }
        _ => {}
    }

    // Mirror lock is released before listeners run.
    let changes = lock(&shared.mirror).apply(event);

    let mut bus = lock(&shared.bus);
    for change in changes {
        bus.publish(&change);
        if event_tx.try_send(SyncEvent::Update(change)).is_err() {
            log::trace!("Event channel full or closed, dropping update");
        }
    }
}

fn fail_pending(shared: &Shared) {
    if let Some(tx) = lock(&shared.pending_join).take() {
        let _ = tx.send(Err(ClientError::ConnectionClosed));
    }
    lock(&shared.pending_pass).take();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Envelope;
    use serde_json::json;

    #[test]
    fn test_client_creation() {
        let client = SyncClient::new("ws://localhost:8080");
        assert_eq!(client.server_url(), "ws://localhost:8080");
        assert!(!client.tokens().ident.is_empty());
        assert!(client.document().is_empty());
        assert!(client.room().is_none());
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("ws://localhost:8080");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_commands_require_connection() {
        let client = SyncClient::new("ws://localhost:8080");
        assert!(matches!(
            client.set_value("a", json!(1)).await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.join_room("lobby", None).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_join_rejects_empty_key() {
        let client = SyncClient::new("ws://localhost:8080");
        assert!(matches!(
            client.join_room("!!!", None).await,
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let mut client = SyncClient::new("ws://127.0.0.1:1");
        assert!(matches!(client.connect().await, Err(ClientError::Connect(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new("ws://localhost:8080");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_dispatch_updates_mirror_and_listeners() {
        let shared = Shared::default();
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        lock(&shared.bus).subscribe(Topic::DataChanged, "score", move |event| {
            if let ReconcileEvent::DataChanged { value, .. } = event {
                s.lock().unwrap().push(value.clone());
            }
        });

        let mut data = Map::new();
        data.insert("score".into(), json!(3));
        dispatch(&shared, &event_tx, ServerEvent::SetData(Envelope::new("lobby", data)));

        assert_eq!(*seen.lock().unwrap(), vec![json!(3)]);
        assert_eq!(lock(&shared.mirror).document()["score"], json!(3));
        assert!(matches!(
            event_rx.recv().await,
            Some(SyncEvent::Update(ReconcileEvent::DataChanged { .. }))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_resolves_pending_join() {
        let shared = Shared::default();
        let (event_tx, _event_rx) = mpsc::channel(8);

        let (tx, rx) = oneshot::channel();
        *lock(&shared.pending_join) = Some(tx);
        dispatch(
            &shared,
            &event_tx,
            ServerEvent::PasswordFailed(Envelope::new("vault", "vault".to_string())),
        );
        assert!(matches!(rx.await.unwrap(), Err(ClientError::JoinRejected(room)) if room == "vault"));

        let (tx, rx) = oneshot::channel();
        *lock(&shared.pending_join) = Some(tx);
        dispatch(
            &shared,
            &event_tx,
            ServerEvent::JoinRoom(Envelope::new("lobby", "lobby".to_string())),
        );
        assert_eq!(rx.await.unwrap().unwrap(), "lobby");
    }
}
