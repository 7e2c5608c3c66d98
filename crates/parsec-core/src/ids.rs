//! Opaque identifiers used throughout the data model.
//!
//! All identifiers except [`DeviceID`] are random 128-bit values backed by
//! `uuid::Uuid` and serialize as hyphenated strings, mirroring the id
//! conventions already used for `vault_id` and `device_id` elsewhere in the
//! corpus.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

opaque_id!(EntryID);
opaque_id!(BlockID);
opaque_id!(ChunkID);
opaque_id!(RealmID);
opaque_id!(OrganizationID);

/// A realm is keyed by `RealmID`, which is numerically equal to the
/// workspace's `EntryID` (or to the user's `user_manifest_id` for the user
/// realm) — see spec §3 "Realm".
impl From<EntryID> for RealmID {
    fn from(id: EntryID) -> Self {
        RealmID(id.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserID(pub String);

impl fmt::Display for UserID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceName(pub String);

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `UserID @ DeviceName`, e.g. `alice@laptop`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceID {
    pub user_id: UserID,
    pub device_name: DeviceName,
}

impl DeviceID {
    pub fn new(user_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            user_id: UserID(user_id.into()),
            device_name: DeviceName(device_name.into()),
        }
    }
}

impl fmt::Display for DeviceID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.device_name)
    }
}

/// An entry's name within its parent folder. Validated at construction: non
/// empty, at most 256 bytes (mirrors `WorkspaceEntrySchema`'s
/// `validate.Length(min=1, max=256)`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryName(String);

#[derive(Debug, thiserror::Error)]
#[error("invalid entry name")]
pub struct InvalidEntryName;

impl EntryName {
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidEntryName> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > 256 || raw.contains('/') {
            return Err(InvalidEntryName);
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_name_rejects_empty_and_slash() {
        assert!(EntryName::new("").is_err());
        assert!(EntryName::new("a/b").is_err());
        assert!(EntryName::new("a".repeat(257)).is_err());
        assert!(EntryName::new("hello.txt").is_ok());
    }

    #[test]
    fn device_id_display() {
        let id = DeviceID::new("alice", "laptop");
        assert_eq!(id.to_string(), "alice@laptop");
    }

    #[test]
    fn realm_id_from_entry_id() {
        let entry = EntryID::new();
        let realm: RealmID = entry.into();
        assert_eq!(entry.as_uuid(), realm.as_uuid());
    }
}
