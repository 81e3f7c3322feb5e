//! Permission lattice for one room.
//!
//! ```text
//!   owner ──► admin ──► write ──► join (read)
//! ```
//!
//! Each tier is derived from the one above it plus its own set, so
//! `can_admin(x) ⟹ can_write(x) ⟹ can_join(x)` holds for every identity
//! without a separate consistency check.
//!
//! Every mutator fails closed: an unauthorized call changes nothing and
//! returns `false`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::identity::StableId;

/// Flat, persistable form of [`AccessControl`].
///
/// Missing fields deserialize to null / empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessSnapshot {
    pub owner: Option<StableId>,
    pub read: Vec<StableId>,
    pub write: Vec<StableId>,
    pub admin: Vec<StableId>,
}

/// Read/write/admin/owner rights for one room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessControl {
    owner: Option<StableId>,
    read: BTreeSet<StableId>,
    write: BTreeSet<StableId>,
    admin: BTreeSet<StableId>,
}

impl AccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: AccessSnapshot) -> Self {
        Self {
            owner: snapshot.owner,
            read: snapshot.read.into_iter().collect(),
            write: snapshot.write.into_iter().collect(),
            admin: snapshot.admin.into_iter().collect(),
        }
    }

    pub fn snapshot(&self) -> AccessSnapshot {
        AccessSnapshot {
            owner: self.owner.clone(),
            read: self.read.iter().cloned().collect(),
            write: self.write.iter().cloned().collect(),
            admin: self.admin.iter().cloned().collect(),
        }
    }

    pub fn owner(&self) -> Option<&StableId> {
        self.owner.as_ref()
    }

    /// Claim ownership if the room has no owner yet. First claim wins.
    pub fn attempt_claim(&mut self, id: &StableId) -> bool {
        if self.owner.is_some() {
            return false;
        }
        self.owner = Some(id.clone());
        true
    }

    // ─── Queries ──────────────────────────────────────────────────────

    pub fn is_owner(&self, id: &StableId) -> bool {
        self.owner.as_ref() == Some(id)
    }

    pub fn can_admin(&self, id: &StableId) -> bool {
        self.is_owner(id) || self.admin.contains(id)
    }

    pub fn can_write(&self, id: &StableId) -> bool {
        self.can_admin(id) || self.write.contains(id)
    }

    pub fn can_join(&self, id: &StableId) -> bool {
        self.can_write(id) || self.read.contains(id)
    }

    /// Same as [`can_join`](Self::can_join); joining a room is reading it.
    pub fn can_read(&self, id: &StableId) -> bool {
        self.can_join(id)
    }

    // ─── Grants ───────────────────────────────────────────────────────

    /// Grant read access. Needs no actor: admission to the room already
    /// passed the room's own checks.
    pub fn add_read(&mut self, target: &StableId) -> bool {
        if self.can_read(target) {
            return false;
        }
        self.read.insert(target.clone())
    }

    /// Grant write access. Actor must be an admin; target must not already
    /// be able to write.
    pub fn add_write(&mut self, target: &StableId, actor: &StableId) -> bool {
        if !self.can_admin(actor) || self.can_write(target) {
            return false;
        }
        self.write.insert(target.clone())
    }

    /// Grant admin. Only the owner may do this.
    pub fn add_admin(&mut self, target: &StableId, actor: &StableId) -> bool {
        if !self.is_owner(actor) || self.can_admin(target) {
            return false;
        }
        self.admin.insert(target.clone())
    }

    // ─── Revocations ──────────────────────────────────────────────────

    pub fn rem_read(&mut self, target: &StableId, actor: &StableId) -> bool {
        self.can_admin(actor) && self.read.remove(target)
    }

    pub fn rem_write(&mut self, target: &StableId, actor: &StableId) -> bool {
        self.can_admin(actor) && self.write.remove(target)
    }

    /// Revoke admin. Owner only. The owner's own admin right comes from
    /// ownership, not from the admin set, so it cannot be revoked.
    pub fn rem_admin(&mut self, target: &StableId, actor: &StableId) -> bool {
        self.is_owner(actor) && self.admin.remove(target)
    }
}
