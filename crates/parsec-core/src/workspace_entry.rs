//! `WorkspaceEntry` and the realm role model (spec §3 "WorkspaceEntry",
//! grounded in `access.py`'s `WorkspaceEntry`/`WorkspaceRole`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::SecretKey;
use crate::ids::EntryID;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Owner,
    Manager,
    Contributor,
    Reader,
}

impl Role {
    pub fn can_manage_roles(self) -> bool {
        matches!(self, Role::Owner | Role::Manager)
    }

    pub fn is_owner(self) -> bool {
        matches!(self, Role::Owner)
    }

    /// Per the realm role certificate replay rule (spec §4.2): an OWNER may
    /// set any role; a MANAGER may only set non-OWNER, non-MANAGER roles.
    pub fn may_grant(self, target: Role) -> bool {
        match self {
            Role::Owner => true,
            Role::Manager => !matches!(target, Role::Owner | Role::Manager),
            _ => false,
        }
    }
}

/// A workspace as known to a single user's user manifest. `role == None`
/// encodes revocation (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceEntry {
    pub name: String,
    pub id: EntryID,
    pub key: SecretKey,
    pub encryption_revision: u32,
    pub encrypted_on: DateTime<Utc>,
    pub role_cached_on: DateTime<Utc>,
    pub role: Option<Role>,
}

impl WorkspaceEntry {
    /// A new entry always starts at revision 1, role OWNER (spec §3).
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            id: EntryID::new(),
            key: SecretKey::generate(),
            encryption_revision: 1,
            encrypted_on: now,
            role_cached_on: now,
            role: Some(Role::Owner),
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.role.is_none()
    }

    pub fn renamed(&self, new_name: impl Into<String>) -> Self {
        Self {
            name: new_name.into(),
            ..self.clone()
        }
    }

    pub fn with_role(&self, role: Option<Role>) -> Self {
        Self {
            role,
            role_cached_on: Utc::now(),
            ..self.clone()
        }
    }

    pub fn with_new_key(&self, key: SecretKey, revision: u32) -> Self {
        Self {
            key,
            encryption_revision: revision,
            encrypted_on: Utc::now(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entry_starts_owner_revision_one() {
        let e = WorkspaceEntry::new("docs");
        assert_eq!(e.encryption_revision, 1);
        assert_eq!(e.role, Some(Role::Owner));
        assert!(!e.is_revoked());
    }

    #[test]
    fn manager_cannot_grant_owner_or_manager() {
        assert!(!Role::Manager.may_grant(Role::Owner));
        assert!(!Role::Manager.may_grant(Role::Manager));
        assert!(Role::Manager.may_grant(Role::Contributor));
        assert!(Role::Owner.may_grant(Role::Owner));
    }

    #[test]
    fn revoked_entry_has_none_role() {
        let e = WorkspaceEntry::new("docs").with_role(None);
        assert!(e.is_revoked());
    }
}
