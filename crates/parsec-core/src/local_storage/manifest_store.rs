//! Manifest cache (spec §4.1 "Manifest store").
//!
//! One JSON file per entry id under `<root>/manifests/`, written via
//! write-to-staging-then-rename exactly the way `backup_store.rs` persists
//! its manifest (`store.manifest`) — the rename is what makes `set_manifest`
//! durable-before-return when `need_sync` flips from true to false, per
//! spec's "a crash could hide an acknowledged upload" requirement.
//!
//! A base-version shadow copy is kept alongside so `get_base_manifest` can
//! return the last-synced representation without re-fetching from the
//! remote loader.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::LocalStorageError;
use crate::ids::EntryID;
use crate::local_manifest::LocalManifest;

pub struct ManifestStore {
    root: PathBuf,
    cache: RwLock<HashMap<EntryID, LocalManifest>>,
}

impl ManifestStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, LocalStorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("manifests"))?;
        fs::create_dir_all(root.join("manifests_base"))?;
        Ok(Self {
            root,
            cache: RwLock::new(HashMap::new()),
        })
    }

    fn manifest_path(&self, id: EntryID) -> PathBuf {
        self.root.join("manifests").join(format!("{id}.json"))
    }

    fn base_manifest_path(&self, id: EntryID) -> PathBuf {
        self.root.join("manifests_base").join(format!("{id}.json"))
    }

    pub fn get_manifest(&self, id: EntryID) -> Result<LocalManifest, LocalStorageError> {
        if let Some(m) = self.cache.read().get(&id) {
            return Ok(m.clone());
        }
        let path = self.manifest_path(id);
        if !path.exists() {
            return Err(LocalStorageError::MissingManifest(id.to_string()));
        }
        let raw = fs::read(&path)?;
        let manifest: LocalManifest = serde_json::from_slice(&raw)?;
        self.cache.write().insert(id, manifest.clone());
        Ok(manifest)
    }

    /// Atomically replace the cached/persisted manifest for `id`. Writes to
    /// a staging file in the same directory, then renames over the target —
    /// durable-before-return on POSIX filesystems once the rename syscall
    /// completes.
    pub fn set_manifest(&self, manifest: LocalManifest) -> Result<(), LocalStorageError> {
        let id = manifest.id();
        let path = self.manifest_path(id);
        let staging = self.root.join("manifests").join(format!("{id}.tmp"));
        let serialized = serde_json::to_vec(&manifest)?;
        fs::write(&staging, &serialized)?;
        fs::rename(&staging, &path)?;

        // Whenever a manifest stops needing sync, it just became the new
        // base (last-synced) representation — snapshot it so
        // `get_base_manifest` does not need a round trip to the remote.
        if !manifest.need_sync() {
            let base_path = self.base_manifest_path(id);
            let base_staging = self.root.join("manifests_base").join(format!("{id}.tmp"));
            fs::write(&base_staging, &serialized)?;
            fs::rename(&base_staging, &base_path)?;
        }

        self.cache.write().insert(id, manifest);
        Ok(())
    }

    /// Returns the last-synced representation (the sync engine needs this
    /// when retrying an upload after a conflict, spec §4.1).
    pub fn get_base_manifest(&self, id: EntryID) -> Result<LocalManifest, LocalStorageError> {
        let path = self.base_manifest_path(id);
        if !path.exists() {
            return Err(LocalStorageError::MissingManifest(id.to_string()));
        }
        let raw = fs::read(&path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Drop `id` from the cache. Only legal when the manifest does not
    /// need sync (spec §4.1: "only legal when not dirty").
    pub fn clear_manifest(&self, id: EntryID) -> Result<(), LocalStorageError> {
        if let Ok(m) = self.get_manifest(id) {
            if m.need_sync() {
                return Err(LocalStorageError::StillDirty(id.to_string()));
            }
        }
        self.cache.write().remove(&id);
        let path = self.manifest_path(id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    pub fn has_manifest(&self, id: EntryID) -> bool {
        self.cache.read().contains_key(&id) || self.manifest_path(id).exists()
    }
}
