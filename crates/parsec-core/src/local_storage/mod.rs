//! Local storage contract (spec §4.1): manifest store + block store,
//! guarded by per-entry locks, all rooted under one device-specific
//! directory on disk.

mod block_store;
mod locking;
mod manifest_store;

pub use block_store::BlockStore;
pub use locking::{EntryLockGuard, EntryLocks};
pub use manifest_store::ManifestStore;

use std::path::Path;

use crate::config::CoreConfig;
use crate::error::LocalStorageError;
use crate::ids::EntryID;

/// Bundles the manifest store, block store and entry locks that make up one
/// device's local data directory. Transactions go through this handle
/// rather than touching the individual stores directly, so lock ordering is
/// enforced in one place (spec §4.1 "Locking").
pub struct LocalStorage {
    pub manifests: ManifestStore,
    pub blocks: BlockStore,
    pub locks: EntryLocks,
}

impl LocalStorage {
    pub fn open(root: impl AsRef<Path>, config: &CoreConfig) -> Result<Self, LocalStorageError> {
        let root = root.as_ref();
        Ok(Self {
            manifests: ManifestStore::open(root)?,
            blocks: BlockStore::open(root, config.clean_cache_max_bytes)?,
            locks: EntryLocks::new(),
        })
    }

    pub async fn lock_entry(&self, id: EntryID) -> EntryLockGuard {
        self.locks.lock(id).await
    }

    pub async fn lock_entries(&self, ids: &[EntryID]) -> Vec<EntryLockGuard> {
        self.locks.lock_many(ids).await
    }
}
