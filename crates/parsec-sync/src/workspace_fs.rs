//! One workspace's filesystem surface (spec §4.3/§4.4): path-based entry
//! and file operations plus `sync`, composed from [`crate::entry_transactions::EntryTransactions`],
//! [`crate::file_transactions::FileTransactions`] and [`crate::sync_engine::SyncTransactions`].
//!
//! Grounded in `original_source/parsec/core/fs/workspacefs/workspacefs.py`'s
//! `WorkspaceFS`: a pathlib-like facade over the transaction layers, plus
//! its `sync` that walks the parent chain root-first so a placeholder
//! child is never uploaded referencing a parent id the server has never
//! seen (`_synchronize_placeholders`).

use std::sync::Arc;

use parsec_core::ids::{DeviceID, EntryID, RealmID};
use parsec_core::local_manifest::{LocalManifest, LocalWorkspaceManifest};
use parsec_core::{CoreEvent, EventBus, LocalStorage};
use parsec_remote::RemoteLoader;

use crate::entry_transactions::{EntryInfo, EntryTransactions};
use crate::file_transactions::FileTransactions;
use crate::fs_path::FsPath;
use crate::sync_engine::{SyncEngineError, SyncTransactions};

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceFsError {
    #[error(transparent)]
    Core(#[from] parsec_core::error::CoreError),
    #[error(transparent)]
    LocalStorage(#[from] parsec_core::error::LocalStorageError),
    #[error(transparent)]
    Sync(#[from] SyncEngineError),
    #[error(transparent)]
    Remote(#[from] parsec_remote::RemoteError),
}

pub struct WorkspaceFS {
    root_id: EntryID,
    storage: Arc<LocalStorage>,
    remote_loader: Arc<RemoteLoader>,
    events: Arc<EventBus>,
    entry_transactions: EntryTransactions,
    file_transactions: FileTransactions,
    sync_transactions: SyncTransactions,
}

impl WorkspaceFS {
    pub fn new(
        root_id: EntryID,
        storage: Arc<LocalStorage>,
        remote_loader: Arc<RemoteLoader>,
        device_id: DeviceID,
        events: Arc<EventBus>,
        default_blocksize: u64,
    ) -> Self {
        let entry_transactions = EntryTransactions::new(
            root_id,
            storage.clone(),
            device_id.clone(),
            events.clone(),
            default_blocksize,
        );
        let file_transactions = FileTransactions::new(storage.clone(), events.clone());
        let sync_transactions = SyncTransactions::new(
            storage.clone(),
            remote_loader.clone(),
            device_id,
            events.clone(),
        );
        Self {
            root_id,
            storage,
            remote_loader,
            events,
            entry_transactions,
            file_transactions,
            sync_transactions,
        }
    }

    /// Bootstrap a brand-new workspace: create its placeholder root
    /// manifest locally and the realm on the server (spec §4.3
    /// "workspace_create").
    pub fn bootstrap_root(id: EntryID, author: DeviceID, storage: &LocalStorage) -> Result<(), WorkspaceFsError> {
        let root = LocalManifest::Workspace(LocalWorkspaceManifest::new_placeholder(id, author));
        storage.manifests.set_manifest(root)?;
        Ok(())
    }

    pub fn realm_id(&self) -> RealmID {
        RealmID::from(self.root_id)
    }

    pub async fn create_realm_if_needed(&self) -> Result<(), WorkspaceFsError> {
        self.remote_loader.create_realm().await?;
        Ok(())
    }

    pub async fn entry_info(&self, path: &FsPath) -> Result<EntryInfo, WorkspaceFsError> {
        Ok(self.entry_transactions.entry_info(path).await?)
    }

    pub async fn resolve(&self, path: &FsPath) -> Result<EntryID, WorkspaceFsError> {
        Ok(self.entry_transactions.resolve(path).await?)
    }

    pub async fn list_folder(&self, path: &FsPath) -> Result<Vec<String>, WorkspaceFsError> {
        let id = self.entry_transactions.resolve(path).await?;
        let manifest = self.storage.manifests.get_manifest(id)?;
        Ok(match manifest {
            LocalManifest::Folder(m) => m.children.keys().cloned().collect(),
            LocalManifest::Workspace(m) => m.children.keys().cloned().collect(),
            _ => return Err(parsec_core::error::CoreError::FileNotFound.into()),
        })
    }

    pub async fn folder_create(&self, path: &FsPath) -> Result<EntryID, WorkspaceFsError> {
        Ok(self.entry_transactions.folder_create(path).await?)
    }

    pub async fn file_create(&self, path: &FsPath) -> Result<EntryID, WorkspaceFsError> {
        Ok(self.entry_transactions.file_create(path).await?)
    }

    pub async fn rename(
        &self,
        path: &FsPath,
        new_name: parsec_core::ids::EntryName,
        overwrite: bool,
    ) -> Result<(), WorkspaceFsError> {
        Ok(self.entry_transactions.entry_rename(path, new_name, overwrite).await?)
    }

    pub async fn folder_delete(&self, path: &FsPath) -> Result<(), WorkspaceFsError> {
        Ok(self.entry_transactions.folder_delete(path).await?)
    }

    pub async fn file_delete(&self, path: &FsPath) -> Result<(), WorkspaceFsError> {
        Ok(self.entry_transactions.file_delete(path).await?)
    }

    pub async fn read(&self, path: &FsPath, offset: u64, size: u64) -> Result<Vec<u8>, WorkspaceFsError> {
        let id = self.entry_transactions.resolve(path).await?;
        Ok(self.file_transactions.fd_read(id, offset, size).await?)
    }

    pub async fn write(&self, path: &FsPath, offset: u64, data: &[u8]) -> Result<(), WorkspaceFsError> {
        let id = self.entry_transactions.resolve(path).await?;
        Ok(self.file_transactions.fd_write(id, offset, data).await?)
    }

    pub async fn truncate(&self, path: &FsPath, size: u64) -> Result<(), WorkspaceFsError> {
        let id = self.entry_transactions.resolve(path).await?;
        Ok(self.file_transactions.fd_resize(id, size).await?)
    }

    /// Sync `path` and every ancestor still `need_sync`, root-first so a
    /// placeholder child is never uploaded while its parent is still a
    /// local-only id (spec §4.6 "`_synchronize_placeholders`").
    pub async fn sync(&self, path: &FsPath) -> Result<(), WorkspaceFsError> {
        let id = self.entry_transactions.resolve(path).await?;
        self.sync_with_ancestors(id).await
    }

    pub async fn sync_root(&self) -> Result<(), WorkspaceFsError> {
        self.sync_with_ancestors(self.root_id).await
    }

    async fn sync_with_ancestors(&self, id: EntryID) -> Result<(), WorkspaceFsError> {
        let mut chain = vec![id];
        let mut current = id;
        loop {
            let manifest = self.storage.manifests.get_manifest(current)?;
            let parent = match &manifest {
                LocalManifest::Folder(m) => Some(m.parent),
                LocalManifest::File(m) => Some(m.parent),
                LocalManifest::Workspace(_) | LocalManifest::User(_) => None,
            };
            match parent {
                Some(p) if p != current => {
                    chain.push(p);
                    current = p;
                }
                _ => break,
            }
        }
        for entry in chain.into_iter().rev() {
            self.sync_transactions.sync_by_id(entry).await?;
        }
        Ok(())
    }

    pub fn subscribe_events(&self) -> parsec_core::EventSubscription {
        self.events.subscribe()
    }

    pub fn root_id(&self) -> EntryID {
        self.root_id
    }

    /// Sync a single entry without walking its ancestor chain (spec §4.8
    /// "sync monitor ... calls `sync_by_id`"). Unlike [`WorkspaceFS::sync`],
    /// the caller is trusted to have already synced any placeholder
    /// ancestors — the monitor only ever sees ids that were already
    /// resolved from a synced path at some point.
    pub async fn sync_entry(&self, id: EntryID) -> Result<(), WorkspaceFsError> {
        self.sync_transactions.sync_by_id(id).await?;
        Ok(())
    }

    /// Walk `id`'s parent chain up to its workspace root, returning whether
    /// it lands on this workspace. Used by the sync monitor to route a bare
    /// entry id (spec §5 "events carry only ids") to the `WorkspaceFS` that
    /// owns it, without needing a reverse index.
    pub fn owns_entry(&self, id: EntryID) -> bool {
        let mut current = id;
        loop {
            if current == self.root_id {
                return true;
            }
            let parent = match self.storage.manifests.get_manifest(current) {
                Ok(LocalManifest::Folder(m)) => m.parent,
                Ok(LocalManifest::File(m)) => m.parent,
                Ok(LocalManifest::Workspace(_)) | Ok(LocalManifest::User(_)) => return false,
                Err(_) => return false,
            };
            if parent == current {
                return false;
            }
            current = parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parsec_core::config::CoreConfig;
    use parsec_core::crypto::SecretKey;
    use parsec_remote::{RealmClient, RemoteDevicesManager};
    use tempfile::tempdir;

    fn device() -> DeviceID {
        DeviceID::new("alice", "laptop")
    }

    struct NullClient;
    #[async_trait::async_trait]
    impl RealmClient for NullClient {
        async fn vlob_create(
            &self,
            _: RealmID,
            _: u32,
            _: EntryID,
            _: chrono::DateTime<chrono::Utc>,
            _: Vec<u8>,
        ) -> Result<(), parsec_remote::RemoteError> {
            Ok(())
        }
        async fn vlob_update(
            &self,
            _: u32,
            _: EntryID,
            _: u64,
            _: chrono::DateTime<chrono::Utc>,
            _: Vec<u8>,
        ) -> Result<(), parsec_remote::RemoteError> {
            Ok(())
        }
        async fn vlob_read(
            &self,
            _: u32,
            _: EntryID,
            _: Option<u64>,
            _: Option<chrono::DateTime<chrono::Utc>>,
        ) -> Result<parsec_remote::client::VlobReadResponse, parsec_remote::RemoteError> {
            Err(parsec_remote::RemoteError::NotFound)
        }
        async fn vlob_poll_changes(
            &self,
            _: RealmID,
            _: u64,
        ) -> Result<(u64, std::collections::BTreeMap<EntryID, u64>), parsec_remote::RemoteError> {
            Ok((0, std::collections::BTreeMap::new()))
        }
        async fn block_create(
            &self,
            _: parsec_core::ids::BlockID,
            _: RealmID,
            _: Vec<u8>,
        ) -> Result<(), parsec_remote::RemoteError> {
            Ok(())
        }
        async fn block_read(&self, _: parsec_core::ids::BlockID) -> Result<Vec<u8>, parsec_remote::RemoteError> {
            Err(parsec_remote::RemoteError::NotFound)
        }
        async fn realm_create(&self, _: Vec<u8>) -> Result<(), parsec_remote::RemoteError> {
            Ok(())
        }
        async fn realm_update_roles(&self, _: Vec<u8>) -> Result<(), parsec_remote::RemoteError> {
            Ok(())
        }
        async fn realm_get_role_certificates(&self, _: RealmID) -> Result<Vec<Vec<u8>>, parsec_remote::RemoteError> {
            Ok(Vec::new())
        }
        async fn realm_start_reencryption_maintenance(&self, _: RealmID, _: u32) -> Result<(), parsec_remote::RemoteError> {
            Ok(())
        }
        async fn realm_finish_reencryption_maintenance(&self, _: RealmID, _: u32) -> Result<(), parsec_remote::RemoteError> {
            Ok(())
        }
        async fn maintenance_get_reencryption_batch(
            &self,
            _: RealmID,
            _: u32,
            _: u32,
        ) -> Result<Vec<parsec_remote::ReencryptionBatchEntry>, parsec_remote::RemoteError> {
            Ok(Vec::new())
        }
        async fn maintenance_save_reencryption_batch(
            &self,
            _: RealmID,
            _: u32,
            _: Vec<parsec_remote::ReencryptionBatchEntry>,
        ) -> Result<(u64, u64), parsec_remote::RemoteError> {
            Ok((0, 0))
        }
        async fn message_get(&self, _: u64) -> Result<Vec<parsec_remote::MessageEntry>, parsec_remote::RemoteError> {
            Ok(Vec::new())
        }
        async fn message_send(
            &self,
            _: parsec_core::ids::UserID,
            _: chrono::DateTime<chrono::Utc>,
            _: Vec<u8>,
        ) -> Result<(), parsec_remote::RemoteError> {
            Ok(())
        }
        async fn get_device_verify_key(
            &self,
            _: &DeviceID,
        ) -> Result<ed25519_dalek::VerifyingKey, parsec_remote::RemoteError> {
            Err(parsec_remote::RemoteError::NotFound)
        }
    }

    struct FixedKeys(SecretKey);
    impl parsec_remote::WorkspaceKeyProvider for FixedKeys {
        fn encryption_revision(&self) -> u32 {
            1
        }
        fn workspace_key(&self) -> SecretKey {
            self.0.clone()
        }
    }

    async fn fixture() -> (WorkspaceFS, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(LocalStorage::open(dir.path(), &CoreConfig::default()).unwrap());
        let root_id = EntryID::new();
        WorkspaceFS::bootstrap_root(root_id, device(), &storage).unwrap();
        let signing_key = parsec_core::crypto::generate_signing_key();
        let client: Arc<dyn RealmClient> = Arc::new(NullClient);
        let devices = Arc::new(RemoteDevicesManager::new(client.clone()));
        devices.seed(device(), signing_key.verifying_key());
        let keys = Arc::new(FixedKeys(SecretKey::generate()));
        let loader = Arc::new(RemoteLoader::new(
            device(),
            signing_key,
            RealmID::from(root_id),
            keys,
            client,
            devices,
            storage.clone(),
        ));
        let events = Arc::new(EventBus::new(16));
        let fs = WorkspaceFS::new(root_id, storage, loader, device(), events, 512 * 1024);
        (fs, dir)
    }

    #[tokio::test]
    async fn create_write_read_round_trips_through_one_workspace() {
        let (fs, _dir) = fixture().await;
        fs.folder_create(&FsPath::parse("/docs").unwrap()).await.unwrap();
        fs.file_create(&FsPath::parse("/docs/a.txt").unwrap()).await.unwrap();
        fs.write(&FsPath::parse("/docs/a.txt").unwrap(), 0, b"hello")
            .await
            .unwrap();
        let data = fs.read(&FsPath::parse("/docs/a.txt").unwrap(), 0, 5).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn sync_walks_ancestor_chain_root_first() {
        let (fs, _dir) = fixture().await;
        fs.folder_create(&FsPath::parse("/docs").unwrap()).await.unwrap();
        fs.file_create(&FsPath::parse("/docs/a.txt").unwrap()).await.unwrap();
        fs.write(&FsPath::parse("/docs/a.txt").unwrap(), 0, b"hello")
            .await
            .unwrap();
        fs.sync(&FsPath::parse("/docs/a.txt").unwrap()).await.unwrap();

        let docs_info = fs.entry_info(&FsPath::parse("/docs").unwrap()).await.unwrap();
        let file_info = fs.entry_info(&FsPath::parse("/docs/a.txt").unwrap()).await.unwrap();
        assert!(!docs_info.need_sync);
        assert!(!file_info.need_sync);
    }
}
