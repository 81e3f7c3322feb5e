//! Client-side mirror of a room.
//!
//! The server pushes snapshots without sequence numbers. The reconciler
//! keeps the last document, roster and own profile it saw and turns each
//! push into granular events:
//!
//! ```text
//! setUsers {u1, u2}   prior {u1', u3}
//!     u2       → MemberJoined
//!     u1 ≠ u1' → MemberChanged (old u1', new u1)
//!     u3       → MemberLeft
//! ```
//!
//! Roster entries are compared with [`structural_eq`], which only checks
//! nested containers at type level.

use serde_json::{Map, Value};

use crate::protocol::ServerEvent;
use crate::value::{set_path, structural_eq};

/// What changed after applying one server push.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileEvent {
    DataChanged {
        key: String,
        value: Value,
        old: Option<Value>,
    },
    DataRemoved {
        key: String,
        old: Option<Value>,
    },
    DataPartChanged {
        part: String,
        value: Value,
    },
    MemberJoined {
        ident: String,
        profile: Value,
    },
    MemberChanged {
        ident: String,
        profile: Value,
        old: Value,
    },
    MemberLeft {
        ident: String,
        profile: Value,
    },
    OwnProfile {
        profile: Value,
        old: Option<Value>,
    },
    RoomJoined(String),
    JoinRejected(String),
    Identified(String),
    NameChanged(String),
    OneTimePass(String),
    Relay {
        sender: String,
        data: Value,
    },
    Debug(Value),
}

/// Local mirror of {document, roster, own profile}.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    room: Option<String>,
    ident: Option<String>,
    name: Option<String>,
    document: Map<String, Value>,
    roster: Map<String, Value>,
    own_profile: Option<Value>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn ident(&self) -> Option<&str> {
        self.ident.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn document(&self) -> &Map<String, Value> {
        &self.document
    }

    pub fn roster(&self) -> &Map<String, Value> {
        &self.roster
    }

    pub fn own_profile(&self) -> Option<&Value> {
        self.own_profile.as_ref()
    }

    /// Apply one server push.
    pub fn apply(&mut self, event: ServerEvent) -> Vec<ReconcileEvent> {
        match event {
            ServerEvent::SetData(env) => self.apply_document(env.data),
            ServerEvent::SetDataPart(env) => self.apply_data_part(&env.data.part, env.data.data),
            ServerEvent::RemoveData(env) => self.apply_removed(env.data),
            ServerEvent::SetUsers(env) => self.apply_roster(env.data),
            ServerEvent::YourUser(env) => {
                let old = self.own_profile.replace(env.data.clone());
                vec![ReconcileEvent::OwnProfile {
                    profile: env.data,
                    old,
                }]
            }
            ServerEvent::JoinRoom(env) => {
                if self.room.as_deref() != Some(env.data.as_str()) {
                    self.document.clear();
                    self.roster.clear();
                    self.own_profile = None;
                    self.room = Some(env.data.clone());
                }
                vec![ReconcileEvent::RoomJoined(env.data)]
            }
            ServerEvent::PasswordFailed(env) => vec![ReconcileEvent::JoinRejected(env.data)],
            ServerEvent::SetIdent(env) => {
                self.ident = Some(env.data.clone());
                vec![ReconcileEvent::Identified(env.data)]
            }
            ServerEvent::SetName(env) => {
                self.name = Some(env.data.clone());
                vec![ReconcileEvent::NameChanged(env.data)]
            }
            ServerEvent::OneTimePass(env) => vec![ReconcileEvent::OneTimePass(env.data)],
            ServerEvent::Relay(env) => vec![ReconcileEvent::Relay {
                sender: env.data.sender,
                data: env.data.data,
            }],
            ServerEvent::Debug(env) => vec![ReconcileEvent::Debug(env.data)],
        }
    }

    /// Adopt the carried keys, one change event per key. The server sends
    /// both full documents and changed-key patches this way.
    pub fn apply_document(&mut self, data: Map<String, Value>) -> Vec<ReconcileEvent> {
        data.into_iter()
            .map(|(key, value)| {
                let old = self.document.insert(key.clone(), value.clone());
                ReconcileEvent::DataChanged { key, value, old }
            })
            .collect()
    }

    pub fn apply_removed(&mut self, keys: Vec<String>) -> Vec<ReconcileEvent> {
        keys.into_iter()
            .map(|key| {
                let old = self.document.remove(&key);
                ReconcileEvent::DataRemoved { key, old }
            })
            .collect()
    }

    pub fn apply_data_part(&mut self, part: &str, value: Value) -> Vec<ReconcileEvent> {
        set_path(&mut self.document, part, value.clone());
        vec![ReconcileEvent::DataPartChanged {
            part: part.to_string(),
            value,
        }]
    }

    /// Diff a roster snapshot against the prior one, then adopt it.
    pub fn apply_roster(&mut self, roster: Map<String, Value>) -> Vec<ReconcileEvent> {
        let mut events = Vec::new();

        for (ident, profile) in &roster {
            match self.roster.get(ident) {
                None => events.push(ReconcileEvent::MemberJoined {
                    ident: ident.clone(),
                    profile: profile.clone(),
                }),
                Some(old) if !structural_eq(old, profile) => {
                    events.push(ReconcileEvent::MemberChanged {
                        ident: ident.clone(),
                        profile: profile.clone(),
                        old: old.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        for (ident, old) in &self.roster {
            if !roster.contains_key(ident) {
                events.push(ReconcileEvent::MemberLeft {
                    ident: ident.clone(),
                    profile: old.clone(),
                });
            }
        }

        self.roster = roster;
        events
    }
}
