//! Entry transactions (spec §4.4): path resolution, create/rename/delete
//! of files and folders within one workspace. Every multi-entry operation
//! locks the entries it touches in ascending id order (spec §4.1
//! "Locking"), mutates local manifests only, and leaves `need_sync` set so
//! the sync engine picks the change up later.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use parsec_core::error::{CoreError, CoreResult};
use parsec_core::ids::{DeviceID, EntryID, EntryName};
use parsec_core::local_manifest::{
    LocalFileManifest, LocalFolderManifest, LocalManifest, LocalWorkspaceManifest,
};
use parsec_core::{CoreEvent, EventBus, LocalStorage};

use crate::fs_path::FsPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Folder,
}

#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub id: EntryID,
    pub kind: EntryKind,
    pub size: u64,
    pub need_sync: bool,
    pub base_version: u64,
}

pub struct EntryTransactions {
    root_id: EntryID,
    storage: Arc<LocalStorage>,
    device_id: DeviceID,
    events: Arc<EventBus>,
    default_blocksize: u64,
}

impl EntryTransactions {
    pub fn new(
        root_id: EntryID,
        storage: Arc<LocalStorage>,
        device_id: DeviceID,
        events: Arc<EventBus>,
        default_blocksize: u64,
    ) -> Self {
        Self {
            root_id,
            storage,
            device_id,
            events,
            default_blocksize,
        }
    }

    fn children_of(&self, manifest: &LocalManifest) -> CoreResult<BTreeMap<String, EntryID>> {
        match manifest {
            LocalManifest::Folder(m) => Ok(m.children.clone()),
            LocalManifest::Workspace(m) => Ok(m.children.clone()),
            LocalManifest::File(_) => Err(CoreError::FileNotFound),
            LocalManifest::User(_) => Err(CoreError::FileNotFound),
        }
    }

    /// Walk `path` from the workspace root, resolving one child lookup per
    /// component. Every intermediate component must be a folder.
    pub async fn resolve(&self, path: &FsPath) -> CoreResult<EntryID> {
        let mut current = self.root_id;
        for part in path.parts() {
            let manifest = self.storage.manifests.get_manifest(current)?;
            let children = self.children_of(&manifest)?;
            current = *children
                .get(part.as_str())
                .ok_or(CoreError::FileNotFound)?;
        }
        Ok(current)
    }

    pub async fn entry_info(&self, path: &FsPath) -> CoreResult<EntryInfo> {
        let id = self.resolve(path).await?;
        let manifest = self.storage.manifests.get_manifest(id)?;
        Ok(match manifest {
            LocalManifest::File(m) => EntryInfo {
                id,
                kind: EntryKind::File,
                size: m.size,
                need_sync: m.need_sync,
                base_version: m.base_version,
            },
            LocalManifest::Folder(m) => EntryInfo {
                id,
                kind: EntryKind::Folder,
                size: m.children.len() as u64,
                need_sync: m.need_sync,
                base_version: m.base_version,
            },
            LocalManifest::Workspace(m) => EntryInfo {
                id,
                kind: EntryKind::Folder,
                size: m.children.len() as u64,
                need_sync: m.need_sync,
                base_version: m.base_version,
            },
            LocalManifest::User(_) => return Err(CoreError::FileNotFound),
        })
    }

    /// Insert `name -> child_id` into `parent`'s children map, failing if
    /// the name is already taken (spec §4.4 "path uniqueness invariant").
    async fn link_child(&self, parent: EntryID, name: &EntryName, child: EntryID) -> CoreResult<()> {
        let _guards = self.storage.lock_entries(&[parent, child]).await;
        let manifest = self.storage.manifests.get_manifest(parent)?;
        let children = self.children_of(&manifest)?;
        if children.contains_key(name.as_str()) {
            return Err(CoreError::FileExists);
        }
        let mut changes = BTreeMap::new();
        changes.insert(name.as_str().to_string(), Some(child));
        let updated = evolve(&manifest, changes)?;
        self.storage.manifests.set_manifest(updated)?;
        self.events.publish(CoreEvent::FsEntryUpdated { id: parent });
        Ok(())
    }

    pub async fn folder_create(&self, path: &FsPath) -> CoreResult<EntryID> {
        let parent_path = path.parent().ok_or(CoreError::FileExists)?;
        let name = path.name().ok_or(CoreError::FileExists)?;
        let parent = self.resolve(&parent_path).await?;
        let id = EntryID::new();
        let manifest = LocalManifest::Folder(LocalFolderManifest::new_placeholder(
            id,
            parent,
            self.device_id.clone(),
        ));
        self.storage.manifests.set_manifest(manifest)?;
        self.link_child(parent, name, id).await?;
        Ok(id)
    }

    pub async fn file_create(&self, path: &FsPath) -> CoreResult<EntryID> {
        let parent_path = path.parent().ok_or(CoreError::FileExists)?;
        let name = path.name().ok_or(CoreError::FileExists)?;
        let parent = self.resolve(&parent_path).await?;
        let id = EntryID::new();
        let manifest = LocalManifest::File(LocalFileManifest::new_placeholder(
            id,
            parent,
            self.device_id.clone(),
            self.default_blocksize,
        ));
        self.storage.manifests.set_manifest(manifest)?;
        self.link_child(parent, name, id).await?;
        Ok(id)
    }

    /// Rename within the same parent only (cross-parent moves are a
    /// `folder_create`-then-`file_create`-then-delete composition at the
    /// `WorkspaceFS` level, spec §4.4). `overwrite` controls whether an
    /// existing entry at the destination name is replaced.
    pub async fn entry_rename(
        &self,
        path: &FsPath,
        new_name: EntryName,
        overwrite: bool,
    ) -> CoreResult<()> {
        let parent_path = path.parent().ok_or(CoreError::FileNotFound)?;
        let old_name = path.name().ok_or(CoreError::FileNotFound)?;
        let parent = self.resolve(&parent_path).await?;
        let child = self.resolve(path).await?;

        let _guards = self.storage.lock_entries(&[parent, child]).await;
        let manifest = self.storage.manifests.get_manifest(parent)?;
        let children = self.children_of(&manifest)?;
        if !overwrite && children.contains_key(new_name.as_str()) {
            return Err(CoreError::FileExists);
        }
        let mut changes = BTreeMap::new();
        changes.insert(old_name.as_str().to_string(), None);
        changes.insert(new_name.as_str().to_string(), Some(child));
        let updated = evolve(&manifest, changes)?;
        self.storage.manifests.set_manifest(updated)?;
        self.events.publish(CoreEvent::FsEntryUpdated { id: parent });
        Ok(())
    }

    pub async fn folder_delete(&self, path: &FsPath) -> CoreResult<()> {
        let parent_path = path.parent().ok_or(CoreError::FileNotFound)?;
        let name = path.name().ok_or(CoreError::FileNotFound)?;
        let parent = self.resolve(&parent_path).await?;
        let child = self.resolve(path).await?;

        let child_manifest = self.storage.manifests.get_manifest(child)?;
        match &child_manifest {
            LocalManifest::Folder(m) if !m.children.is_empty() => {
                return Err(CoreError::FileExists);
            }
            LocalManifest::Folder(_) => {}
            _ => return Err(CoreError::FileNotFound),
        }

        let _guards = self.storage.lock_entries(&[parent, child]).await;
        let manifest = self.storage.manifests.get_manifest(parent)?;
        let mut changes = BTreeMap::new();
        changes.insert(name.as_str().to_string(), None);
        let updated = evolve(&manifest, changes)?;
        self.storage.manifests.set_manifest(updated)?;
        self.storage.manifests.clear_manifest(child).ok();
        self.events.publish(CoreEvent::FsEntryUpdated { id: parent });
        Ok(())
    }

    pub async fn file_delete(&self, path: &FsPath) -> CoreResult<()> {
        let parent_path = path.parent().ok_or(CoreError::FileNotFound)?;
        let name = path.name().ok_or(CoreError::FileNotFound)?;
        let parent = self.resolve(&parent_path).await?;
        let child = self.resolve(path).await?;
        if !matches!(self.storage.manifests.get_manifest(child)?, LocalManifest::File(_)) {
            return Err(CoreError::FileNotFound);
        }

        let _guards = self.storage.lock_entries(&[parent, child]).await;
        let manifest = self.storage.manifests.get_manifest(parent)?;
        let mut changes = BTreeMap::new();
        changes.insert(name.as_str().to_string(), None);
        let updated = evolve(&manifest, changes)?;
        self.storage.manifests.set_manifest(updated)?;
        self.storage.manifests.clear_manifest(child).ok();
        self.events.publish(CoreEvent::FsEntryUpdated { id: parent });
        Ok(())
    }
}

fn evolve(manifest: &LocalManifest, changes: BTreeMap<String, Option<EntryID>>) -> CoreResult<LocalManifest> {
    let _ = Utc::now();
    match manifest {
        LocalManifest::Folder(m) => Ok(LocalManifest::Folder(m.evolve_children(changes))),
        LocalManifest::Workspace(m) => Ok(LocalManifest::Workspace(m.evolve_children(changes))),
        _ => Err(CoreError::FileNotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parsec_core::config::CoreConfig;
    use tempfile::tempdir;

    fn device() -> DeviceID {
        DeviceID::new("alice", "laptop")
    }

    async fn fixture() -> (EntryTransactions, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(LocalStorage::open(dir.path(), &CoreConfig::default()).unwrap());
        let root_id = EntryID::new();
        let root = LocalManifest::Workspace(LocalWorkspaceManifest::new_placeholder(
            root_id,
            device(),
        ));
        storage.manifests.set_manifest(root).unwrap();
        let events = Arc::new(EventBus::new(16));
        let txn = EntryTransactions::new(root_id, storage, device(), events, 512 * 1024);
        (txn, dir)
    }

    #[tokio::test]
    async fn creates_and_resolves_nested_folder() {
        let (txn, _dir) = fixture().await;
        txn.folder_create(&FsPath::parse("/docs").unwrap()).await.unwrap();
        let id = txn.resolve(&FsPath::parse("/docs").unwrap()).await.unwrap();
        let info = txn.entry_info(&FsPath::parse("/docs").unwrap()).await.unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.kind, EntryKind::Folder);
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let (txn, _dir) = fixture().await;
        txn.folder_create(&FsPath::parse("/docs").unwrap()).await.unwrap();
        assert!(matches!(
            txn.folder_create(&FsPath::parse("/docs").unwrap()).await,
            Err(CoreError::FileExists)
        ));
    }

    #[tokio::test]
    async fn rename_moves_entry_to_new_name_in_same_parent() {
        let (txn, _dir) = fixture().await;
        txn.file_create(&FsPath::parse("/a.txt").unwrap()).await.unwrap();
        txn.entry_rename(
            &FsPath::parse("/a.txt").unwrap(),
            EntryName::new("b.txt").unwrap(),
            false,
        )
        .await
        .unwrap();
        assert!(txn.resolve(&FsPath::parse("/a.txt").unwrap()).await.is_err());
        assert!(txn.resolve(&FsPath::parse("/b.txt").unwrap()).await.is_ok());
    }

    #[tokio::test]
    async fn folder_delete_refuses_nonempty_folder() {
        let (txn, _dir) = fixture().await;
        txn.folder_create(&FsPath::parse("/docs").unwrap()).await.unwrap();
        txn.file_create(&FsPath::parse("/docs/a.txt").unwrap()).await.unwrap();
        assert!(txn.folder_delete(&FsPath::parse("/docs").unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn file_delete_removes_entry_from_parent() {
        let (txn, _dir) = fixture().await;
        txn.file_create(&FsPath::parse("/a.txt").unwrap()).await.unwrap();
        txn.file_delete(&FsPath::parse("/a.txt").unwrap()).await.unwrap();
        assert!(txn.resolve(&FsPath::parse("/a.txt").unwrap()).await.is_err());
    }
}
