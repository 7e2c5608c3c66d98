//! Remote manifest variants (spec §3 "Manifest variants").
//!
//! The source dispatches on a dynamic string-tagged registry; per §9
//! DESIGN NOTES ("Dynamic manifest dispatch") this is replaced with a
//! tagged union and an exhaustive `match` in every consumer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::chunk::BlockAccess;
use crate::ids::{DeviceID, EntryID};
use crate::workspace_entry::WorkspaceEntry;

/// `author` is `None` only for version 0 (placeholders are signed by a
/// device once promoted; a placeholder never leaves the local store as a
/// `RemoteManifest` in the first place, but the field stays optional to
/// make that invariant representable rather than assumed).
pub type Author = Option<DeviceID>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileManifest {
    pub id: EntryID,
    pub parent: EntryID,
    pub author: Author,
    pub version: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub size: u64,
    pub blocksize: u64,
    pub blocks: Vec<BlockAccess>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderManifest {
    pub id: EntryID,
    pub parent: EntryID,
    pub author: Author,
    pub version: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub children: BTreeMap<String, EntryID>,
}

/// No `parent`: it is a realm root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceManifest {
    pub id: EntryID,
    pub author: Author,
    pub version: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub children: BTreeMap<String, EntryID>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserManifest {
    pub id: EntryID,
    pub author: Author,
    pub version: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub last_processed_message: u64,
    pub workspaces: Vec<WorkspaceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RemoteManifest {
    File(FileManifest),
    Folder(FolderManifest),
    Workspace(WorkspaceManifest),
    User(UserManifest),
}

impl RemoteManifest {
    pub fn id(&self) -> EntryID {
        match self {
            RemoteManifest::File(m) => m.id,
            RemoteManifest::Folder(m) => m.id,
            RemoteManifest::Workspace(m) => m.id,
            RemoteManifest::User(m) => m.id,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            RemoteManifest::File(m) => m.version,
            RemoteManifest::Folder(m) => m.version,
            RemoteManifest::Workspace(m) => m.version,
            RemoteManifest::User(m) => m.version,
        }
    }

    pub fn author(&self) -> &Author {
        match self {
            RemoteManifest::File(m) => &m.author,
            RemoteManifest::Folder(m) => &m.author,
            RemoteManifest::Workspace(m) => &m.author,
            RemoteManifest::User(m) => &m.author,
        }
    }
}

impl FileManifest {
    /// spec §3 invariant: `size` equals the sum of block sizes; blocks are
    /// sorted by offset, contiguous, no gaps, no overlaps.
    pub fn check_invariants(&self) -> bool {
        let mut expected_offset = 0u64;
        let mut total = 0u64;
        for block in &self.blocks {
            if block.offset != expected_offset || block.size > self.blocksize {
                return false;
            }
            expected_offset += block.size;
            total += block.size;
        }
        total == self.size
    }
}

pub fn encode_manifest(manifest: &RemoteManifest) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(manifest)
}

pub fn decode_manifest(raw: &[u8]) -> Result<RemoteManifest, serde_json::Error> {
    serde_json::from_slice(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::BlockAccess;
    use crate::crypto::{HashDigest, SecretKey};
    use crate::ids::BlockID;

    fn block(offset: u64, size: u64) -> BlockAccess {
        BlockAccess {
            id: BlockID::new(),
            key: SecretKey::generate(),
            offset,
            size,
            digest: HashDigest::of(b"x"),
        }
    }

    #[test]
    fn file_manifest_invariant_detects_gap() {
        let mut m = FileManifest {
            id: EntryID::new(),
            parent: EntryID::new(),
            author: None,
            version: 1,
            created: Utc::now(),
            updated: Utc::now(),
            size: 20,
            blocksize: 10,
            blocks: vec![block(0, 10), block(10, 10)],
        };
        assert!(m.check_invariants());
        m.blocks = vec![block(0, 10), block(15, 5)];
        assert!(!m.check_invariants());
    }

    #[test]
    fn manifest_roundtrip_through_json() {
        let folder = RemoteManifest::Folder(FolderManifest {
            id: EntryID::new(),
            parent: EntryID::new(),
            author: None,
            version: 1,
            created: Utc::now(),
            updated: Utc::now(),
            children: BTreeMap::new(),
        });
        let encoded = encode_manifest(&folder).unwrap();
        let decoded = decode_manifest(&encoded).unwrap();
        assert_eq!(folder.id(), decoded.id());
    }
}
