//! JSON wire protocol between participants and rooms.
//!
//! Wire format (one WebSocket text frame per message):
//! ```text
//! inbound   { "event": "setData", "data": { "score": 3 } }
//! outbound  { "event": "setData", "data": { "room": "lobby", "data": { "score": 3 } } }
//! ```
//!
//! Every outbound event is wrapped in an [`Envelope`] carrying the room key,
//! so a client can tell which room a push belongs to.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outbound payload wrapper: `{room, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub room: String,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn new(room: impl Into<String>, data: T) -> Self {
        Self {
            room: room.into(),
            data,
        }
    }
}

/// `joinRoom` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub room: String,
    #[serde(default)]
    pub pass: Option<String>,
}

/// Path-addressed write, `part` being a dotted path into the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPart {
    pub part: String,
    pub data: Value,
}

/// `grantUser` request: `ident` is the target's pseudonym.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantRequest {
    pub ident: String,
    pub rank: String,
}

/// `updateUser` request. The name is validated by the session, so any value
/// is accepted on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub name: Value,
}

/// Relay payload tagged with the sender's pseudonym.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayPayload {
    pub sender: String,
    pub data: Value,
}

/// What other participants see of a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub write: bool,
    pub admin: bool,
    pub owner: bool,
    /// Per-room pseudonym
    pub ident: String,
}

/// Participant → room commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientCommand {
    JoinRoom(JoinRequest),
    /// Shallow top-level merge.
    SetData(Value),
    /// Whole-document replacement.
    ReplaceData(Value),
    SetDataPart(DataPart),
    RemoveData(Value),
    GrantUser(GrantRequest),
    SetPassword(Option<String>),
    GetOneTimePass,
    Relay(Value),
    UpdateUser(ProfileUpdate),
    Debug,
}

impl ClientCommand {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Wire name of the command, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom(_) => "joinRoom",
            Self::SetData(_) => "setData",
            Self::ReplaceData(_) => "replaceData",
            Self::SetDataPart(_) => "setDataPart",
            Self::RemoveData(_) => "removeData",
            Self::GrantUser(_) => "grantUser",
            Self::SetPassword(_) => "setPassword",
            Self::GetOneTimePass => "getOneTimePass",
            Self::Relay(_) => "relay",
            Self::UpdateUser(_) => "updateUser",
            Self::Debug => "debug",
        }
    }
}

/// Room → participant pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Values for the carried top-level keys (full document or changed keys).
    SetData(Envelope<Map<String, Value>>),
    SetDataPart(Envelope<DataPart>),
    RemoveData(Envelope<Vec<String>>),
    /// Roster: pseudonym → profile.
    SetUsers(Envelope<Map<String, Value>>),
    YourUser(Envelope<Value>),
    OneTimePass(Envelope<String>),
    Relay(Envelope<RelayPayload>),
    JoinRoom(Envelope<String>),
    PasswordFailed(Envelope<String>),
    SetName(Envelope<String>),
    SetIdent(Envelope<String>),
    Debug(Envelope<Value>),
}

impl ServerEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Room key the event is tagged with.
    pub fn room(&self) -> &str {
        match self {
            Self::SetData(e) => &e.room,
            Self::SetDataPart(e) => &e.room,
            Self::RemoveData(e) => &e.room,
            Self::SetUsers(e) => &e.room,
            Self::YourUser(e) => &e.room,
            Self::OneTimePass(e) => &e.room,
            Self::Relay(e) => &e.room,
            Self::JoinRoom(e) => &e.room,
            Self::PasswordFailed(e) => &e.room,
            Self::SetName(e) => &e.room,
            Self::SetIdent(e) => &e.room,
            Self::Debug(e) => &e.room,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}
