//! A keyed, collaboratively edited document with its members and rights.
//!
//! ```text
//!            ┌──────────────────────── Room ─────────────────────────┐
//! join ────► │ AccessControl   password   one-time credentials       │
//!            │ document (map)  pseudonyms sessions   idle timer      │
//! command ─► │   authorize ─► mutate ─► broadcast ─► persist hook    │
//!            └───────────────────────────────────────────────┬───────┘
//!                                                            ▼
//!                                       RoomHooks (persist / idle)
//! ```
//!
//! A room is mutated only through `&mut self`, so each command is applied
//! to completion before the next one is looked at. The owning directory
//! wraps it in a mutex; nothing in here awaits.
//!
//! Authorization failures are silent no-ops. Validation failures resend the
//! authoritative document to the requester only.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::access::{AccessControl, AccessSnapshot};
use crate::config::RoomConfig;
use crate::identity::StableId;
use crate::protocol::{ClientCommand, DataPart, GrantRequest, Profile, ProfileUpdate};
use crate::session::Session;
use crate::value::{serialized_size, set_path};

/// Called with the room key and its exportable state after every accepted
/// mutation or grant change.
pub type PersistHook = Arc<dyn Fn(&str, RoomRecord) + Send + Sync>;

/// Called with the room key and the idle epoch when the idle timer expires.
pub type IdleHook = Arc<dyn Fn(&str, u64) + Send + Sync>;

/// Called with the room key when a room with suspended persistence wants to
/// write. The owner re-checks the store and calls back through
/// [`Room::resume_persistence`] or [`Room::end_recovery`].
pub type RecoverHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Callbacks injected by whoever owns the room.
#[derive(Clone)]
pub struct RoomHooks {
    pub persist: PersistHook,
    pub idle: IdleHook,
    pub recover: RecoverHook,
}

impl RoomHooks {
    /// Hooks that do nothing, for a room nobody owns.
    pub fn detached() -> Self {
        Self {
            persist: Arc::new(|_, _| {}),
            idle: Arc::new(|_, _| {}),
            recover: Arc::new(|_| {}),
        }
    }
}

impl std::fmt::Debug for RoomHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHooks").finish_non_exhaustive()
    }
}

/// Persisted form of a room: `{password, access, identMap, data}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomRecord {
    pub password: Option<String>,
    pub access: AccessSnapshot,
    /// stable id → pseudonym
    #[serde(rename = "identMap")]
    pub ident_map: BTreeMap<StableId, String>,
    pub data: Map<String, Value>,
}

/// Single-use admin-issued alternative to the room password.
#[derive(Debug, Clone)]
struct OneTimeCredential {
    token: String,
    expires_at: Instant,
}

/// `true` if `candidate` is a map whose encoded size fits within
/// `max_bytes`. A bound of zero or less means unlimited.
pub fn validate_document(candidate: &Value, max_bytes: i64) -> bool {
    let Value::Object(map) = candidate else {
        return false;
    };
    fits(map, max_bytes)
}

fn fits(document: &Map<String, Value>, max_bytes: i64) -> bool {
    max_bytes <= 0 || serialized_size(document) as u128 <= max_bytes as u128
}

/// One room.
#[derive(Debug)]
pub struct Room {
    key: String,
    password: Option<String>,
    document: Map<String, Value>,
    access: AccessControl,
    pseudonyms: HashMap<StableId, String>,
    /// At most one session per identity
    sessions: HashMap<StableId, Arc<Session>>,
    one_time: Vec<OneTimeCredential>,
    config: RoomConfig,
    hooks: RoomHooks,
    /// Bumped whenever a pending eviction is cancelled
    idle_epoch: u64,
    idle_timer: Option<JoinHandle<()>>,
    evicted: bool,
    /// Cleared when the stored state could not be read, so defaults never
    /// overwrite it
    durable: bool,
    /// Set while a store re-check for a suspended room is outstanding
    recovering: AtomicBool,
}

impl Room {
    /// A room that has never been persisted.
    pub fn new(key: impl Into<String>, config: RoomConfig, hooks: RoomHooks) -> Self {
        let password = config.default_password.clone();
        Self {
            key: key.into(),
            password,
            document: Map::new(),
            access: AccessControl::new(),
            pseudonyms: HashMap::new(),
            sessions: HashMap::new(),
            one_time: Vec::new(),
            config,
            hooks,
            idle_epoch: 0,
            idle_timer: None,
            evicted: false,
            durable: true,
            recovering: AtomicBool::new(false),
        }
    }

    /// A room rebuilt from its persisted record.
    pub fn from_record(
        key: impl Into<String>,
        record: RoomRecord,
        config: RoomConfig,
        hooks: RoomHooks,
    ) -> Self {
        let mut room = Self::new(key, config, hooks);
        room.password = record.password;
        room.access = AccessControl::from_snapshot(record.access);
        room.pseudonyms = record.ident_map.into_iter().collect();
        room.document = record.data;
        room
    }

    /// Exportable state.
    pub fn record(&self) -> RoomRecord {
        RoomRecord {
            password: self.password.clone(),
            access: self.access.snapshot(),
            ident_map: self
                .pseudonyms
                .iter()
                .map(|(id, pseudonym)| (id.clone(), pseudonym.clone()))
                .collect(),
            data: self.document.clone(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn document(&self) -> &Map<String, Value> {
        &self.document
    }

    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn pseudonym_of(&self, id: &StableId) -> Option<&str> {
        self.pseudonyms.get(id).map(String::as_str)
    }

    pub fn idle_epoch(&self) -> u64 {
        self.idle_epoch
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    pub(crate) fn mark_evicted(&mut self) {
        self.evicted = true;
        self.cancel_idle_timer();
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub(crate) fn suspend_persistence(&mut self) {
        self.durable = false;
    }

    /// The store answered and holds nothing for this key: writes resume.
    pub(crate) fn resume_persistence(&mut self) {
        self.durable = true;
        self.recovering.store(false, Ordering::SeqCst);
    }

    /// The store re-check failed; the next write asks again.
    pub(crate) fn end_recovery(&self) {
        self.recovering.store(false, Ordering::SeqCst);
    }

    /// Drop every member, closing their connections.
    pub(crate) fn disconnect_all(&mut self) {
        for (id, session) in self.sessions.drain() {
            self.pseudonyms.remove(&id);
            session.set_room_key(None);
            session.disconnect();
        }
    }

    /// `true` if `session` is the connection currently registered for its
    /// identity.
    pub fn is_member(&self, session: &Session) -> bool {
        self.sessions
            .get(session.stable_id())
            .is_some_and(|current| current.conn_id() == session.conn_id())
    }

    /// `validate` as configured for this room.
    pub fn validate(&self, candidate: &Value) -> bool {
        validate_document(candidate, self.config.max_document_bytes)
    }

    // ─── Membership ───────────────────────────────────────────────────

    /// Admit `session` if it may join, knows the password or holds an
    /// unexpired one-time credential. Returns whether it was admitted.
    pub fn join(&mut self, session: &Arc<Session>, password: Option<&str>) -> bool {
        let id = session.stable_id().clone();

        if self.access.attempt_claim(&id) {
            log::info!("Room {} claimed by {}", self.key, session.display_name());
        }

        // Same identity on another connection: drop the old one first.
        let replaced = self
            .sessions
            .get(&id)
            .is_some_and(|current| current.conn_id() != session.conn_id());
        let stale = if replaced { self.sessions.remove(&id) } else { None };
        if let Some(stale) = &stale {
            log::info!(
                "Disconnecting stale session {} of {} in room {}",
                stale.conn_id(),
                stale.display_name(),
                self.key
            );
            self.pseudonyms.remove(&id);
            stale.set_room_key(None);
            stale.disconnect();
        }

        let admitted = self.access.can_join(&id)
            || self.password_matches(password)
            || self.redeem_one_time(password);

        if !admitted {
            log::info!(
                "Join to room {} rejected for {}",
                self.key,
                session.display_name()
            );
            session.send_password_failed(&self.key);
            if stale.is_some() {
                self.broadcast_roster();
            }
            self.arm_idle_timer();
            return false;
        }

        self.cancel_idle_timer();
        self.pseudonyms
            .entry(id.clone())
            .or_insert_with(|| Uuid::new_v4().simple().to_string());
        self.access.add_read(&id);
        self.sessions.insert(id, Arc::clone(session));
        session.set_room_key(Some(self.key.clone()));

        session.send_joined(&self.key);
        session.send_data(&self.key, self.document.clone());
        self.send_own_profile(session);
        self.broadcast_roster();
        self.persist();

        log::info!(
            "{} joined room {} ({} members)",
            session.display_name(),
            self.key,
            self.sessions.len()
        );
        true
    }

    /// Remove `session` if it is the registered connection for its
    /// identity. The pseudonym goes with it.
    pub fn leave(&mut self, session: &Session) -> bool {
        if !self.is_member(session) {
            return false;
        }
        let id = session.stable_id();
        self.sessions.remove(id);
        self.pseudonyms.remove(id);
        session.set_room_key(None);

        log::info!(
            "{} left room {} ({} members)",
            session.display_name(),
            self.key,
            self.sessions.len()
        );
        self.broadcast_roster();
        self.arm_idle_timer();
        true
    }

    fn password_matches(&self, supplied: Option<&str>) -> bool {
        match &self.password {
            None => true,
            Some(password) => supplied == Some(password.as_str()),
        }
    }

    /// Check-and-remove. Expired credentials are purged first.
    fn redeem_one_time(&mut self, supplied: Option<&str>) -> bool {
        let now = Instant::now();
        self.one_time.retain(|credential| credential.expires_at > now);

        let Some(supplied) = supplied else {
            return false;
        };
        match self.one_time.iter().position(|c| c.token == supplied) {
            Some(index) => {
                self.one_time.swap_remove(index);
                log::info!("One-time credential redeemed in room {}", self.key);
                true
            }
            None => false,
        }
    }

    // ─── Commands ─────────────────────────────────────────────────────

    /// Dispatch a command from a member. `joinRoom` is handled by the
    /// directory and ignored here.
    pub fn handle_command(&mut self, session: &Session, command: ClientCommand) {
        if !self.is_member(session) {
            log::debug!(
                "Ignoring {} from non-member {} in room {}",
                command.name(),
                session.conn_id(),
                self.key
            );
            return;
        }
        log::trace!("{} from {} in room {}", command.name(), session.conn_id(), self.key);

        match command {
            ClientCommand::JoinRoom(_) => {}
            ClientCommand::SetData(partial) => self.patch_document(partial, session),
            ClientCommand::ReplaceData(candidate) => self.set_document(candidate, session),
            ClientCommand::SetDataPart(part) => self.set_data_part(part, session),
            ClientCommand::RemoveData(keys) => self.remove_keys(keys, session),
            ClientCommand::GrantUser(GrantRequest { ident, rank }) => {
                self.grant_user(&ident, &rank, session)
            }
            ClientCommand::SetPassword(password) => self.set_password(password, session),
            ClientCommand::GetOneTimePass => {
                self.issue_one_time_credential(session);
            }
            ClientCommand::Relay(payload) => self.relay(payload, session),
            ClientCommand::UpdateUser(update) => self.update_user(update, session),
            ClientCommand::Debug => self.debug(session),
        }
    }

    fn may_write(&self, session: &Session) -> bool {
        self.is_member(session) && self.access.can_write(session.stable_id())
    }

    fn may_admin(&self, session: &Session) -> bool {
        self.is_member(session) && self.access.can_admin(session.stable_id())
    }

    /// Replace the whole document. Peers see the dropped keys removed, then
    /// the new document.
    pub fn set_document(&mut self, candidate: Value, requester: &Session) {
        if !self.may_write(requester) {
            return;
        }
        let next = match candidate {
            Value::Object(next) if fits(&next, self.config.max_document_bytes) => next,
            _ => {
                self.resend_document(requester);
                return;
            }
        };

        let dropped: Vec<String> = self
            .document
            .keys()
            .filter(|key| !next.contains_key(*key))
            .cloned()
            .collect();
        self.document = next;

        if !dropped.is_empty() {
            self.broadcast(|s, key| s.send_removed(key, dropped.clone()));
        }
        let document = self.document.clone();
        self.broadcast(|s, key| s.send_data(key, document.clone()));
        self.persist();
    }

    /// Shallow top-level merge. Only keys whose value actually changes are
    /// applied and broadcast.
    pub fn patch_document(&mut self, partial: Value, requester: &Session) {
        if !self.may_write(requester) {
            return;
        }
        let Value::Object(partial) = partial else {
            log::debug!("Ignoring non-map patch in room {}", self.key);
            return;
        };

        let changed: Map<String, Value> = partial
            .into_iter()
            .filter(|(key, value)| self.document.get(key) != Some(value))
            .collect();
        if changed.is_empty() {
            return;
        }

        let mut candidate = self.document.clone();
        for (key, value) in &changed {
            candidate.insert(key.clone(), value.clone());
        }
        if !fits(&candidate, self.config.max_document_bytes) {
            self.resend_document(requester);
            return;
        }

        self.document = candidate;
        self.broadcast(|s, key| s.send_data(key, changed.clone()));
        self.persist();
    }

    /// Path-addressed write; `part` is a dotted path.
    pub fn set_data_part(&mut self, part: DataPart, requester: &Session) {
        if !self.may_write(requester) || part.part.is_empty() {
            return;
        }
        let mut candidate = self.document.clone();
        set_path(&mut candidate, &part.part, part.data.clone());
        if !fits(&candidate, self.config.max_document_bytes) {
            self.resend_document(requester);
            return;
        }

        self.document = candidate;
        self.broadcast(|s, key| s.send_data_part(key, &part.part, part.data.clone()));
        self.persist();
    }

    /// Delete top-level keys. `keys` must be a list of strings; the keys
    /// actually present are broadcast.
    pub fn remove_keys(&mut self, keys: Value, requester: &Session) {
        if !self.may_write(requester) {
            return;
        }
        let Value::Array(items) = keys else {
            return;
        };
        let Some(names) = items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect::<Option<Vec<String>>>()
        else {
            return;
        };

        let mut candidate = self.document.clone();
        let mut removed = Vec::new();
        for name in names {
            if candidate.remove(&name).is_some() {
                removed.push(name);
            }
        }
        if removed.is_empty() {
            return;
        }
        if !fits(&candidate, self.config.max_document_bytes) {
            self.resend_document(requester);
            return;
        }

        self.document = candidate;
        self.broadcast(|s, key| s.send_removed(key, removed.clone()));
        self.persist();
    }

    /// Change the rank of the member behind `target` (a pseudonym).
    ///
    /// `admin` grants admin, `write` drops admin and grants write, `join`
    /// drops both. Self-grants are refused, and only the owner may touch
    /// another admin.
    pub fn grant_user(&mut self, target: &str, rank: &str, requester: &Session) {
        if !self.may_admin(requester) {
            return;
        }
        let actor = requester.stable_id().clone();
        let Some(target_id) = self
            .pseudonyms
            .iter()
            .find(|(_, pseudonym)| pseudonym.as_str() == target)
            .map(|(id, _)| id.clone())
        else {
            return;
        };
        if target_id == actor {
            return;
        }
        if self.access.can_admin(&target_id) && !self.access.is_owner(&actor) {
            return;
        }

        let before = self.access.clone();
        match rank.to_ascii_lowercase().as_str() {
            "admin" => {
                self.access.add_admin(&target_id, &actor);
            }
            "write" => {
                self.access.rem_admin(&target_id, &actor);
                self.access.add_write(&target_id, &actor);
            }
            "join" => {
                self.access.rem_admin(&target_id, &actor);
                self.access.rem_write(&target_id, &actor);
                self.access.add_read(&target_id);
            }
            other => {
                log::debug!("Unknown rank {other:?} in room {}", self.key);
                return;
            }
        }
        if self.access == before {
            return;
        }

        log::info!("Rank of {target} in room {} set to {rank}", self.key);
        if let Some(session) = self.sessions.get(&target_id).cloned() {
            self.send_own_profile(&session);
        }
        self.broadcast_roster();
        self.persist();
    }

    /// Set or clear (`None`) the room password. Admin only.
    pub fn set_password(&mut self, password: Option<String>, requester: &Session) {
        if !self.may_admin(requester) {
            return;
        }
        self.password = password;
        log::info!(
            "Password of room {} {}",
            self.key,
            if self.password.is_some() { "set" } else { "cleared" }
        );
        self.persist();
    }

    /// Mint a single-use join token and send it to the requester only.
    pub fn issue_one_time_credential(&mut self, requester: &Session) -> Option<String> {
        if !self.may_admin(requester) {
            return None;
        }
        let token = Uuid::new_v4().simple().to_string();
        self.one_time.push(OneTimeCredential {
            token: token.clone(),
            expires_at: Instant::now() + self.config.one_time_pass_ttl,
        });
        requester.send_one_time_pass(&self.key, &token);
        Some(token)
    }

    /// Forward `payload` to every member, tagged with the sender's pseudonym.
    pub fn relay(&self, payload: Value, sender: &Session) {
        if !self.is_member(sender) {
            return;
        }
        let pseudonym = self
            .pseudonym_of(sender.stable_id())
            .unwrap_or_default()
            .to_string();
        self.broadcast(|s, key| s.send_relay(key, &pseudonym, payload.clone()));
    }

    /// Rename the member. Nothing is sent unless the name actually changed.
    pub fn update_user(&mut self, update: ProfileUpdate, session: &Session) {
        if !self.is_member(session) || !session.update_profile(&update.name) {
            return;
        }
        session.send_name(&self.key);
        self.send_own_profile(session);
        self.broadcast_roster();
    }

    /// Admin-only dump of the room state. The password is masked.
    pub fn debug(&self, requester: &Session) {
        if !self.may_admin(requester) {
            return;
        }
        requester.send_debug(&self.key, self.debug_dump());
    }

    /// Members appear under their pseudonyms only. Grants held by
    /// identities without a pseudonym are counted, not listed.
    fn debug_dump(&self) -> Value {
        let members: Map<String, Value> = self
            .pseudonyms
            .iter()
            .map(|(id, pseudonym)| {
                let rights = json!({
                    "write": self.access.can_write(id),
                    "admin": self.access.can_admin(id),
                    "owner": self.access.is_owner(id),
                    "online": self.sessions.contains_key(id),
                });
                (pseudonym.clone(), rights)
            })
            .collect();

        let snapshot = self.access.snapshot();
        let granted: BTreeSet<&StableId> = snapshot
            .owner
            .iter()
            .chain(&snapshot.read)
            .chain(&snapshot.write)
            .chain(&snapshot.admin)
            .collect();
        let offline_grants = granted
            .into_iter()
            .filter(|id| !self.pseudonyms.contains_key(*id))
            .count();

        json!({
            "key": self.key,
            "password": self.password.as_ref().map(|_| "********"),
            "members": members,
            "offlineGrants": offline_grants,
            "data": self.document,
            "sessions": self.sessions.len(),
            "oneTimePasses": self.one_time.len(),
        })
    }

    // ─── Roster ───────────────────────────────────────────────────────

    fn profile_of(&self, session: &Session) -> Profile {
        let id = session.stable_id();
        Profile {
            name: session.display_name(),
            write: self.access.can_write(id),
            admin: self.access.can_admin(id),
            owner: self.access.is_owner(id),
            ident: self.pseudonym_of(id).unwrap_or_default().to_string(),
        }
    }

    /// Pseudonym → profile for every member.
    pub fn roster(&self) -> Map<String, Value> {
        self.sessions
            .values()
            .filter_map(|session| {
                let profile = self.profile_of(session);
                let value = serde_json::to_value(&profile).ok()?;
                Some((profile.ident, value))
            })
            .collect()
    }

    fn send_own_profile(&self, session: &Session) {
        if let Ok(profile) = serde_json::to_value(self.profile_of(session)) {
            session.send_own_profile(&self.key, profile);
        }
    }

    fn broadcast_roster(&self) {
        let roster = self.roster();
        self.broadcast(|s, key| s.send_roster(key, roster.clone()));
    }

    fn broadcast(&self, push: impl Fn(&Session, &str)) {
        for session in self.sessions.values() {
            push(session, &self.key);
        }
    }

    fn resend_document(&self, requester: &Session) {
        log::debug!(
            "Rejected document change in room {}, resending to {}",
            self.key,
            requester.conn_id()
        );
        requester.send_data(&self.key, self.document.clone());
    }

    /// Hand the exportable state to the persist hook.
    pub fn persist(&self) {
        if !self.durable {
            log::debug!("Persistence of room {} suspended", self.key);
            if !self.recovering.swap(true, Ordering::SeqCst) {
                (self.hooks.recover)(&self.key);
            }
            return;
        }
        (self.hooks.persist)(&self.key, self.record());
    }

    // ─── Idle timer ───────────────────────────────────────────────────

    /// Start the idle timer if the room is empty and none is pending.
    fn arm_idle_timer(&mut self) {
        if !self.sessions.is_empty() || self.evicted {
            return;
        }
        if self.idle_timer.as_ref().is_some_and(|timer| !timer.is_finished()) {
            return;
        }

        let epoch = self.idle_epoch;
        let grace = self.config.idle_grace;
        let key = self.key.clone();
        let hook = Arc::clone(&self.hooks.idle);
        log::debug!("Room {} idle, eviction in {:?}", self.key, grace);

        self.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            hook(&key, epoch);
        }));
    }

    fn cancel_idle_timer(&mut self) {
        self.idle_epoch = self.idle_epoch.wrapping_add(1);
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
            log::debug!("Idle timer of room {} cancelled", self.key);
        }
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::protocol::ServerEvent;
    use crate::session::Outbound;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn member(id: &str) -> (Arc<Session>, mpsc::Receiver<Outbound>) {
        let (session, rx) = Session::channel(Identity::new(id, format!("{id}-name")), 64);
        (Arc::new(session), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Event(event) = item {
                events.push(event);
            }
        }
        events
    }

    fn data_events(events: &[ServerEvent]) -> Vec<Map<String, Value>> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::SetData(env) => Some(env.data.clone()),
                _ => None,
            })
            .collect()
    }

    fn open_room() -> Room {
        Room::new("lobby", RoomConfig::default(), RoomHooks::detached())
    }

    fn locked_room(password: &str) -> Room {
        let config = RoomConfig {
            default_password: Some(password.to_string()),
            ..RoomConfig::default()
        };
        Room::new("vault", config, RoomHooks::detached())
    }

    fn counting_hooks() -> (RoomHooks, Arc<Mutex<Vec<RoomRecord>>>, Arc<Mutex<Vec<u64>>>) {
        let persisted = Arc::new(Mutex::new(Vec::new()));
        let idled = Arc::new(Mutex::new(Vec::new()));
        let p = Arc::clone(&persisted);
        let i = Arc::clone(&idled);
        let hooks = RoomHooks {
            persist: Arc::new(move |_, record| p.lock().unwrap().push(record)),
            idle: Arc::new(move |_, epoch| i.lock().unwrap().push(epoch)),
            recover: Arc::new(|_| {}),
        };
        (hooks, persisted, idled)
    }

    #[tokio::test]
    async fn test_first_join_claims_and_receives_state() {
        let mut room = open_room();
        let (alice, mut rx) = member("alice");

        assert!(room.join(&alice, None));
        assert!(room.access().is_owner(alice.stable_id()));
        assert_eq!(alice.room_key().as_deref(), Some("lobby"));

        let events = drain(&mut rx);
        assert!(matches!(&events[0], ServerEvent::JoinRoom(env) if env.data == "lobby"));
        assert!(matches!(&events[1], ServerEvent::SetData(env) if env.data.is_empty()));
        match &events[2] {
            ServerEvent::YourUser(env) => {
                assert_eq!(env.data["owner"], json!(true));
                assert_eq!(env.data["name"], json!("alice-name"));
                // Stable id is never exposed.
                assert_ne!(env.data["ident"], json!("alice"));
            }
            other => panic!("expected yourUser, got {other:?}"),
        }
        assert!(matches!(&events[3], ServerEvent::SetUsers(env) if env.data.len() == 1));
    }

    #[tokio::test]
    async fn test_patch_broadcasts_only_changed_keys() {
        let mut room = open_room();
        let (alice, mut rx) = member("alice");
        room.join(&alice, None);
        drain(&mut rx);

        room.patch_document(json!({"a": 1}), &alice);
        room.patch_document(json!({"a": 2}), &alice);
        assert_eq!(room.document(), json!({"a": 2}).as_object().unwrap());

        let sent = data_events(&drain(&mut rx));
        assert_eq!(sent.len(), 2);
        assert_eq!(Value::Object(sent[1].clone()), json!({"a": 2}));

        // Unchanged value: nothing is broadcast.
        room.patch_document(json!({"a": 2}), &alice);
        assert!(drain(&mut rx).is_empty());

        room.patch_document(json!({"a": 2, "b": 3}), &alice);
        let sent = data_events(&drain(&mut rx));
        assert_eq!(Value::Object(sent[0].clone()), json!({"b": 3}));
    }

    #[tokio::test]
    async fn test_patch_rejects_lists() {
        let mut room = open_room();
        let (alice, mut rx) = member("alice");
        room.join(&alice, None);
        drain(&mut rx);

        room.patch_document(json!([1, 2]), &alice);
        assert!(room.document().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_remove_keys_broadcasts_removed_list() {
        let mut room = open_room();
        let (alice, mut rx) = member("alice");
        let (bob, mut bob_rx) = member("bob");
        room.join(&alice, None);
        room.join(&bob, None);
        room.patch_document(json!({"a": 1, "b": 2}), &alice);
        drain(&mut rx);
        drain(&mut bob_rx);

        room.remove_keys(json!(["a"]), &alice);
        assert_eq!(room.document(), json!({"b": 2}).as_object().unwrap());

        let events = drain(&mut bob_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ServerEvent::RemoveData(env) if env.data == vec!["a".to_string()]));

        // Non-string keys: ignored wholesale.
        room.remove_keys(json!(["b", 1]), &alice);
        assert!(room.document().contains_key("b"));
    }

    #[test]
    fn test_validate_size_bound() {
        let doc = json!({"text": "x".repeat(100)});
        assert!(!validate_document(&doc, 50));
        assert!(validate_document(&doc, 500));
        assert!(validate_document(&doc, 0));
        assert!(validate_document(&doc, -1));
        assert!(!validate_document(&json!([1]), 0));
        assert!(!validate_document(&json!("text"), 0));
    }

    #[tokio::test]
    async fn test_oversized_patch_resends_document_to_requester_only() {
        let config = RoomConfig {
            max_document_bytes: 40,
            ..RoomConfig::default()
        };
        let mut room = Room::new("lobby", config, RoomHooks::detached());
        let (alice, mut rx) = member("alice");
        let (bob, mut bob_rx) = member("bob");
        room.join(&alice, None);
        room.join(&bob, None);
        room.patch_document(json!({"a": 1}), &alice);
        drain(&mut rx);
        drain(&mut bob_rx);

        room.patch_document(json!({"big": "y".repeat(100)}), &alice);
        assert_eq!(room.document(), json!({"a": 1}).as_object().unwrap());

        let sent = data_events(&drain(&mut rx));
        assert_eq!(sent.len(), 1);
        assert_eq!(Value::Object(sent[0].clone()), json!({"a": 1}));
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_readers_cannot_write() {
        let mut room = locked_room("pw");
        let (alice, _rx) = member("alice");
        let (bob, mut bob_rx) = member("bob");
        assert!(room.join(&alice, None));
        assert!(room.join(&bob, Some("pw")));
        drain(&mut bob_rx);

        room.patch_document(json!({"a": 1}), &bob);
        room.set_document(json!({"a": 1}), &bob);
        room.remove_keys(json!(["a"]), &bob);
        assert!(room.document().is_empty());
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_wrong_password_is_refused() {
        let mut room = locked_room("pw");
        let (alice, _rx) = member("alice");
        let (bob, mut bob_rx) = member("bob");
        room.join(&alice, None);

        assert!(!room.join(&bob, Some("nope")));
        assert!(!room.join(&bob, None));
        assert_eq!(room.session_count(), 1);

        let events = drain(&mut bob_rx);
        assert!(matches!(&events[0], ServerEvent::PasswordFailed(env) if env.data == "vault"));
    }

    #[tokio::test]
    async fn test_one_time_credential_redeems_once() {
        let mut room = locked_room("pw");
        let (alice, mut rx) = member("alice");
        room.join(&alice, None);
        drain(&mut rx);

        let token = room.issue_one_time_credential(&alice).unwrap();
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ServerEvent::OneTimePass(env) if env.data == token)));

        let (bob, _bob_rx) = member("bob");
        assert!(room.join(&bob, Some(&token)));

        let (carol, _carol_rx) = member("carol");
        assert!(!room.join(&carol, Some(&token)));
        // Falls back to the password.
        assert!(room.join(&carol, Some("pw")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_time_credential_expires() {
        let mut room = locked_room("pw");
        let (alice, _rx) = member("alice");
        room.join(&alice, None);
        let token = room.issue_one_time_credential(&alice).unwrap();

        tokio::time::advance(RoomConfig::default().one_time_pass_ttl + Duration::from_secs(1)).await;

        let (bob, _bob_rx) = member("bob");
        assert!(!room.join(&bob, Some(&token)));
    }

    #[tokio::test]
    async fn test_only_admins_mint_credentials() {
        let mut room = open_room();
        let (alice, _rx) = member("alice");
        let (bob, mut bob_rx) = member("bob");
        room.join(&alice, None);
        room.join(&bob, None);
        drain(&mut bob_rx);

        assert!(room.issue_one_time_credential(&bob).is_none());
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_self_grant_is_noop() {
        let (hooks, persisted, _) = counting_hooks();
        let mut room = Room::new("lobby", RoomConfig::default(), hooks);
        let (alice, _rx) = member("alice");
        room.join(&alice, None);
        let before = room.access().clone();
        let writes = persisted.lock().unwrap().len();

        let own = room.pseudonym_of(alice.stable_id()).unwrap().to_string();
        room.grant_user(&own, "admin", &alice);

        assert_eq!(room.access(), &before);
        assert_eq!(persisted.lock().unwrap().len(), writes);
    }

    #[tokio::test]
    async fn test_grant_ranks() {
        let (hooks, persisted, _) = counting_hooks();
        let mut room = Room::new("lobby", RoomConfig::default(), hooks);
        let (alice, _rx) = member("alice");
        let (bob, mut bob_rx) = member("bob");
        room.join(&alice, None);
        room.join(&bob, None);
        drain(&mut bob_rx);
        let bob_pseudonym = room.pseudonym_of(bob.stable_id()).unwrap().to_string();

        let writes = persisted.lock().unwrap().len();
        room.grant_user(&bob_pseudonym, "WRITE", &alice);
        assert!(room.access().can_write(bob.stable_id()));
        assert!(!room.access().can_admin(bob.stable_id()));
        assert_eq!(persisted.lock().unwrap().len(), writes + 1);

        let events = drain(&mut bob_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::YourUser(env) if env.data["write"] == json!(true))));
        assert!(events.iter().any(|e| matches!(e, ServerEvent::SetUsers(_))));

        room.grant_user(&bob_pseudonym, "admin", &alice);
        assert!(room.access().can_admin(bob.stable_id()));

        room.grant_user(&bob_pseudonym, "join", &alice);
        assert!(!room.access().can_write(bob.stable_id()));
        assert!(room.access().can_join(bob.stable_id()));
    }

    #[tokio::test]
    async fn test_admin_cannot_demote_admin_or_owner() {
        let mut room = open_room();
        let (alice, _a) = member("alice");
        let (bob, _b) = member("bob");
        let (carol, _c) = member("carol");
        room.join(&alice, None);
        room.join(&bob, None);
        room.join(&carol, None);
        let bob_p = room.pseudonym_of(bob.stable_id()).unwrap().to_string();
        let carol_p = room.pseudonym_of(carol.stable_id()).unwrap().to_string();
        let alice_p = room.pseudonym_of(alice.stable_id()).unwrap().to_string();

        room.grant_user(&bob_p, "admin", &alice);
        room.grant_user(&carol_p, "admin", &alice);

        room.grant_user(&carol_p, "join", &bob);
        assert!(room.access().can_admin(carol.stable_id()));
        room.grant_user(&alice_p, "join", &bob);
        assert!(room.access().can_admin(alice.stable_id()));
    }

    #[tokio::test]
    async fn test_rejoin_disconnects_stale_session() {
        let mut room = open_room();
        let (first, _rx1) = member("alice");
        let (second, _rx2) = member("alice");
        room.join(&first, None);

        assert!(room.join(&second, None));
        assert!(first.is_closed());
        assert_eq!(first.room_key(), None);
        assert_eq!(room.session_count(), 1);
        assert!(room.is_member(&second));
        assert!(!room.is_member(&first));

        // The stale connection's late leave must not evict the new one.
        assert!(!room.leave(&first));
        assert_eq!(room.session_count(), 1);
    }

    #[tokio::test]
    async fn test_pseudonym_is_reminted_after_leave() {
        let mut room = open_room();
        let (alice, _rx) = member("alice");
        room.join(&alice, None);
        let first = room.pseudonym_of(alice.stable_id()).unwrap().to_string();

        room.leave(&alice);
        assert!(room.pseudonym_of(alice.stable_id()).is_none());

        room.join(&alice, None);
        let second = room.pseudonym_of(alice.stable_id()).unwrap().to_string();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_relay_carries_pseudonym() {
        let mut room = open_room();
        let (alice, _a) = member("alice");
        let (bob, mut bob_rx) = member("bob");
        room.join(&alice, None);
        room.join(&bob, None);
        drain(&mut bob_rx);

        room.relay(json!({"ping": 1}), &alice);
        let pseudonym = room.pseudonym_of(alice.stable_id()).unwrap();
        let events = drain(&mut bob_rx);
        assert!(matches!(
            &events[0],
            ServerEvent::Relay(env) if env.data.sender == pseudonym && env.data.data == json!({"ping": 1})
        ));
    }

    #[tokio::test]
    async fn test_replace_removes_dropped_keys_first() {
        let mut room = open_room();
        let (alice, mut rx) = member("alice");
        room.join(&alice, None);
        room.patch_document(json!({"a": 1, "b": 2}), &alice);
        drain(&mut rx);

        room.set_document(json!({"b": 3, "c": 4}), &alice);
        let events = drain(&mut rx);
        assert!(matches!(&events[0], ServerEvent::RemoveData(env) if env.data == vec!["a".to_string()]));
        assert!(matches!(&events[1], ServerEvent::SetData(env) if Value::Object(env.data.clone()) == json!({"b": 3, "c": 4})));

        // A non-map is corrected, not applied.
        room.set_document(json!([1]), &alice);
        assert_eq!(room.document(), json!({"b": 3, "c": 4}).as_object().unwrap());
    }

    #[tokio::test]
    async fn test_set_data_part() {
        let mut room = open_room();
        let (alice, mut rx) = member("alice");
        room.join(&alice, None);
        drain(&mut rx);

        room.set_data_part(
            DataPart {
                part: "board.cell".into(),
                data: json!("x"),
            },
            &alice,
        );
        assert_eq!(room.document()["board"], json!({"cell": "x"}));
        let events = drain(&mut rx);
        assert!(matches!(&events[0], ServerEvent::SetDataPart(env) if env.data.part == "board.cell"));
    }

    #[tokio::test]
    async fn test_update_user_renames() {
        let mut room = open_room();
        let (alice, mut rx) = member("alice");
        room.join(&alice, None);
        drain(&mut rx);

        room.update_user(ProfileUpdate { name: json!("xy") }, &alice);
        assert!(drain(&mut rx).is_empty());

        room.update_user(ProfileUpdate { name: json!("Alice") }, &alice);
        let events = drain(&mut rx);
        assert!(matches!(&events[0], ServerEvent::SetName(env) if env.data == "Alice"));
        assert!(events.iter().any(|e| matches!(e, ServerEvent::SetUsers(_))));
    }

    #[tokio::test]
    async fn test_debug_is_admin_only_and_masks_password() {
        let mut room = locked_room("hunter2");
        let (alice, mut rx) = member("alice");
        let (bob, mut bob_rx) = member("bob");
        room.join(&alice, None);
        room.join(&bob, Some("hunter2"));
        drain(&mut rx);
        drain(&mut bob_rx);

        room.debug(&bob);
        assert!(drain(&mut bob_rx).is_empty());

        room.debug(&alice);
        let events = drain(&mut rx);
        match &events[0] {
            ServerEvent::Debug(env) => {
                assert_ne!(env.data["password"], json!("hunter2"));
                assert_eq!(env.data["sessions"], json!(2));
            }
            other => panic!("expected debug, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_debug_dump_hides_stable_ids() {
        let mut room = open_room();
        let (owner, _owner_rx) = member("owner-secret-id");
        let (admin, mut admin_rx) = member("admin-id");
        room.join(&owner, None);
        room.join(&admin, None);
        let admin_pseudonym = room.pseudonym_of(admin.stable_id()).unwrap().to_string();
        room.grant_user(&admin_pseudonym, "admin", &owner);
        drain(&mut admin_rx);

        room.debug(&admin);
        let dump = drain(&mut admin_rx)
            .into_iter()
            .find_map(|e| match e {
                ServerEvent::Debug(env) => Some(env.data),
                _ => None,
            })
            .expect("admin receives a dump");

        let text = serde_json::to_string(&dump).unwrap();
        assert!(!text.contains("owner-secret-id"));
        assert!(!text.contains("admin-id"));
        assert!(dump.get("identMap").is_none());
        assert!(dump.get("access").is_none());

        let owner_pseudonym = room.pseudonym_of(owner.stable_id()).unwrap();
        assert_eq!(dump["members"][owner_pseudonym]["owner"], json!(true));
        assert_eq!(dump["members"][&admin_pseudonym]["admin"], json!(true));
        assert_eq!(dump["members"][&admin_pseudonym]["owner"], json!(false));
        assert_eq!(dump["offlineGrants"], json!(0));

        // A departed grantee is counted, never named.
        room.leave(&owner);
        room.debug(&admin);
        let dump = drain(&mut admin_rx)
            .into_iter()
            .find_map(|e| match e {
                ServerEvent::Debug(env) => Some(env.data),
                _ => None,
            })
            .unwrap();
        assert_eq!(dump["offlineGrants"], json!(1));
        assert!(!serde_json::to_string(&dump).unwrap().contains("owner-secret-id"));
    }

    #[tokio::test]
    async fn test_unknown_rank_is_ignored() {
        let (hooks, persisted, _) = counting_hooks();
        let mut room = Room::new("lobby", RoomConfig::default(), hooks);
        let (alice, _a) = member("alice");
        let (bob, _b) = member("bob");
        room.join(&alice, None);
        room.join(&bob, None);
        let bob_pseudonym = room.pseudonym_of(bob.stable_id()).unwrap().to_string();
        room.grant_user(&bob_pseudonym, "write", &alice);

        let before = room.access().clone();
        let writes = persisted.lock().unwrap().len();
        room.grant_user(&bob_pseudonym, "-write", &alice);
        assert_eq!(room.access(), &before);
        assert!(room.access().can_write(bob.stable_id()));
        assert_eq!(persisted.lock().unwrap().len(), writes);
    }

    #[tokio::test]
    async fn test_suspended_room_asks_for_recovery_once() {
        let asked = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&asked);
        let (hooks, persisted, _) = counting_hooks();
        let hooks = RoomHooks {
            recover: Arc::new(move |key| a.lock().unwrap().push(key.to_string())),
            ..hooks
        };
        let mut room = Room::new("lobby", RoomConfig::default(), hooks);
        room.suspend_persistence();
        let (alice, _rx) = member("alice");
        room.join(&alice, None);

        room.patch_document(json!({"a": 1}), &alice);
        room.patch_document(json!({"b": 2}), &alice);
        assert_eq!(*asked.lock().unwrap(), vec!["lobby".to_string()]);
        assert!(persisted.lock().unwrap().is_empty());

        // A failed re-check lets the next write ask again.
        room.end_recovery();
        room.patch_document(json!({"c": 3}), &alice);
        assert_eq!(asked.lock().unwrap().len(), 2);

        room.resume_persistence();
        room.patch_document(json!({"d": 4}), &alice);
        let persisted = persisted.lock().unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].data.len(), 4);
        assert_eq!(asked.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_record_round_trip() {
        let mut room = locked_room("pw");
        let (alice, _rx) = member("alice");
        room.join(&alice, None);
        room.patch_document(json!({"a": [1, 2]}), &alice);

        let record = room.record();
        let encoded = serde_json::to_value(&record).unwrap();
        assert!(encoded.get("identMap").is_some());

        let restored = Room::from_record("vault", record.clone(), RoomConfig::default(), RoomHooks::detached());
        assert_eq!(restored.record(), record);
        assert!(restored.access().is_owner(alice.stable_id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_fires_after_grace() {
        let (hooks, _, idled) = counting_hooks();
        let mut room = Room::new("lobby", RoomConfig::default(), hooks);
        let (alice, _rx) = member("alice");
        room.join(&alice, None);
        room.leave(&alice);
        let epoch = room.idle_epoch();

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(idled.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*idled.lock().unwrap(), vec![epoch]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_before_expiry_cancels_timer() {
        let (hooks, _, idled) = counting_hooks();
        let mut room = Room::new("lobby", RoomConfig::default(), hooks);
        let (alice, _rx) = member("alice");
        room.join(&alice, None);
        room.leave(&alice);
        let armed_epoch = room.idle_epoch();

        tokio::time::sleep(Duration::from_secs(9)).await;
        room.join(&alice, None);
        assert_ne!(room.idle_epoch(), armed_epoch);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(idled.lock().unwrap().is_empty());
    }
}
