//! One connected participant.
//!
//! A `Session` is shared between its connection task (which owns the
//! socket) and the room it joined (which pushes events to it). Pushes go
//! through a bounded queue drained by the connection's writer task; a room
//! never waits on a slow peer. A peer whose queue fills up is disconnected
//! and resynchronizes when it rejoins.
//!
//! ```text
//! Room ──push──► [ outbound queue ] ──writer task──► WebSocket
//!   ▲
//!   └── commands ◄── reader task ◄──────────────────── WebSocket
//! ```

use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::identity::{Identity, StableId};
use crate::protocol::{DataPart, Envelope, RelayPayload, ServerEvent};

/// Items on a session's outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    /// Last item: the writer closes the socket after it.
    Close,
}

/// A connected participant bound to at most one room.
#[derive(Debug)]
pub struct Session {
    /// Distinguishes two connections under the same identity
    conn_id: Uuid,
    stable_id: StableId,
    display_name: RwLock<String>,
    room_key: RwLock<Option<String>>,
    outbound: mpsc::Sender<Outbound>,
    closed: AtomicBool,
    close_signal: Notify,
}

impl Session {
    pub fn new(identity: Identity, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            stable_id: identity.stable_id,
            display_name: RwLock::new(identity.display_name),
            room_key: RwLock::new(None),
            outbound,
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }
    }

    /// Session plus the receiving end of its outbound queue.
    pub fn channel(identity: Identity, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(identity, tx), rx)
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub fn stable_id(&self) -> &StableId {
        &self.stable_id
    }

    pub fn display_name(&self) -> String {
        self.display_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn identity(&self) -> Identity {
        Identity::new(self.stable_id.clone(), self.display_name())
    }

    pub fn room_key(&self) -> Option<String> {
        self.room_key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_room_key(&self, key: Option<String>) {
        *self.room_key.write().unwrap_or_else(PoisonError::into_inner) = key;
    }

    /// Accept a new display name if it is a string longer than two
    /// characters. Returns `true` only when the name actually changed, which
    /// is when the room should be told.
    pub fn update_profile(&self, candidate: &Value) -> bool {
        let Value::String(name) = candidate else {
            return false;
        };
        if name.chars().count() <= 2 {
            return false;
        }
        let mut current = self
            .display_name
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if *current == *name {
            return false;
        }
        *current = name.clone();
        true
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Ask the connection to drop. Used when the same identity joins again
    /// or the outbound queue overflows.
    pub fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_signal.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`disconnect`](Self::disconnect) has been called.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close_signal.notified().await;
    }

    /// Queue the close marker behind everything already pushed, waiting for
    /// room in the queue if necessary.
    pub async fn finish(&self) {
        let _ = self.outbound.send(Outbound::Close).await;
    }

    // ─── Outbound pushes ──────────────────────────────────────────────

    fn enqueue(&self, item: Outbound) {
        match self.outbound.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(item)) => {
                // The peer's mirror is stale from here; it resyncs on rejoin.
                log::warn!(
                    "Session {} ({}) lagging at {:?}, disconnecting",
                    self.conn_id,
                    self.display_name(),
                    outbound_name(&item)
                );
                self.disconnect();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::trace!("Session {} gone, outbound dropped", self.conn_id);
            }
        }
    }

    pub fn push(&self, event: ServerEvent) {
        self.enqueue(Outbound::Event(event));
    }

    pub fn send_data(&self, room: &str, data: Map<String, Value>) {
        self.push(ServerEvent::SetData(Envelope::new(room, data)));
    }

    pub fn send_data_part(&self, room: &str, part: &str, data: Value) {
        self.push(ServerEvent::SetDataPart(Envelope::new(
            room,
            DataPart {
                part: part.to_string(),
                data,
            },
        )));
    }

    pub fn send_removed(&self, room: &str, keys: Vec<String>) {
        self.push(ServerEvent::RemoveData(Envelope::new(room, keys)));
    }

    pub fn send_roster(&self, room: &str, roster: Map<String, Value>) {
        self.push(ServerEvent::SetUsers(Envelope::new(room, roster)));
    }

    pub fn send_own_profile(&self, room: &str, profile: Value) {
        self.push(ServerEvent::YourUser(Envelope::new(room, profile)));
    }

    pub fn send_relay(&self, room: &str, sender: &str, data: Value) {
        self.push(ServerEvent::Relay(Envelope::new(
            room,
            RelayPayload {
                sender: sender.to_string(),
                data,
            },
        )));
    }

    pub fn send_one_time_pass(&self, room: &str, token: &str) {
        self.push(ServerEvent::OneTimePass(Envelope::new(room, token.to_string())));
    }

    pub fn send_joined(&self, room: &str) {
        self.push(ServerEvent::JoinRoom(Envelope::new(room, room.to_string())));
    }

    pub fn send_password_failed(&self, room: &str) {
        self.push(ServerEvent::PasswordFailed(Envelope::new(room, room.to_string())));
    }

    pub fn send_name(&self, room: &str) {
        self.push(ServerEvent::SetName(Envelope::new(room, self.display_name())));
    }

    pub fn send_ident(&self, room: &str) {
        self.push(ServerEvent::SetIdent(Envelope::new(
            room,
            self.stable_id.to_string(),
        )));
    }

    pub fn send_debug(&self, room: &str, dump: Value) {
        self.push(ServerEvent::Debug(Envelope::new(room, dump)));
    }
}

fn outbound_name(item: &Outbound) -> String {
    match item {
        Outbound::Event(event) => event
            .encode()
            .ok()
            .and_then(|text| {
                serde_json::from_str::<Value>(&text)
                    .ok()
                    .and_then(|v| v["event"].as_str().map(str::to_string))
            })
            .unwrap_or_else(|| "event".to_string()),
        Outbound::Close => "close".to_string(),
    }
}
