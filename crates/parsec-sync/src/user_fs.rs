//! The user manifest's filesystem surface (spec §4.3): workspace
//! lifecycle (`workspace_create`/`workspace_rename`/`workspace_share`),
//! syncing the user manifest itself, and draining the user's message
//! inbox.
//!
//! Grounded in `original_source/parsec/core/fs/userfs/userfs.py`'s
//! `UserFS`: two separate locks (one serializing message processing, one
//! serializing user-manifest mutation, since a workspace-share can touch
//! both independently), and its rule that an inbound `sharing.granted` or
//! `sharing.revoked` message is never trusted for its role payload alone —
//! the role map is always re-fetched from the realm before being applied.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use parsec_core::error::CoreError;
use parsec_core::ids::{DeviceID, EntryID, RealmID, UserID};
use parsec_core::local_manifest::{LocalManifest, LocalUserManifest};
use parsec_core::workspace_entry::{Role, WorkspaceEntry};
use parsec_core::{CoreEvent, EventBus, LocalStorage};
use parsec_remote::{RealmClient, RemoteDevicesManager, RemoteError, RemoteLoader, WorkspaceKeyProvider};

use crate::sync_engine::{SyncEngineError, SyncTransactions};
use crate::workspace_fs::WorkspaceFS;

#[derive(Debug, thiserror::Error)]
pub enum UserFsError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    LocalStorage(#[from] parsec_core::error::LocalStorageError),
    #[error(transparent)]
    Sync(#[from] SyncEngineError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("message {0} has a malformed or unverifiable envelope")]
    MalformedMessage(u64),
}

/// A fixed symmetric key pinned at one encryption revision, handed to a
/// [`RemoteLoader`] scoped to a single workspace's realm. `UserFS` builds
/// one of these per `workspace_share`/message-processing call from the
/// `WorkspaceEntry` it already has in hand, rather than keeping a loader
/// alive per workspace for the whole process lifetime.
struct EntryKeyProvider {
    key: parsec_core::crypto::SecretKey,
    revision: u32,
}

impl WorkspaceKeyProvider for EntryKeyProvider {
    fn encryption_revision(&self) -> u32 {
        self.revision
    }
    fn workspace_key(&self) -> parsec_core::crypto::SecretKey {
        self.key.clone()
    }
}

/// The signed, wire-format payload of a user message (spec §4.3
/// "sharing.granted"/"sharing.revoked"/"ping"/"reencryption key rotation").
/// Mirrors the shape of `RemoteLoader`'s role certificate envelope: a
/// signed JSON payload plus the claimed author, unverified until the
/// recipient checks the signature against the sender's verify key.
///
/// `pub(crate)` so [`crate::realm::ReencryptionDriver`] can broadcast a key
/// rotation through the exact same signing path rather than a second one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum MessageContent {
    /// `reencryption: true` marks a key rotation (spec §4.7 "the same
    /// format as `sharing.granted` but flagged as reencryption") — the
    /// recipient still re-fetches the role from the realm rather than
    /// trusting either the role or the key/revision carried here.
    SharingGranted {
        entry: WorkspaceEntry,
        reencryption: bool,
    },
    SharingRevoked {
        workspace_id: EntryID,
    },
    Ping {
        ping_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SignedMessage {
    author: DeviceID,
    payload: Vec<u8>,
    signature: Vec<u8>,
}

pub(crate) fn sign_message(
    content: &MessageContent,
    author: &DeviceID,
    signing_key: &ed25519_dalek::SigningKey,
) -> Vec<u8> {
    let raw = serde_json::to_vec(content).expect("message content always serializes");
    let signature = parsec_core::crypto::sign_bytes(signing_key, &raw).to_bytes().to_vec();
    let signed = SignedMessage {
        author: author.clone(),
        payload: raw,
        signature,
    };
    serde_json::to_vec(&signed).expect("envelope always serializes")
}

pub(crate) async fn verify_message(
    raw: &[u8],
    devices: &RemoteDevicesManager,
) -> Result<(DeviceID, MessageContent), UserFsError> {
    let signed: SignedMessage =
        serde_json::from_slice(raw).map_err(|_| UserFsError::MalformedMessage(0))?;
    let verify_key = devices.get_verify_key(&signed.author).await?;
    let sig_bytes: [u8; 64] = signed
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| UserFsError::MalformedMessage(0))?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    parsec_core::crypto::verify_signature(&verify_key, &signed.payload, &signature)
        .map_err(|_| UserFsError::MalformedMessage(0))?;
    let content: MessageContent =
        serde_json::from_slice(&signed.payload).map_err(|_| UserFsError::MalformedMessage(0))?;
    Ok((signed.author, content))
}

pub struct UserFS {
    user_manifest_id: EntryID,
    device_id: DeviceID,
    signing_key: ed25519_dalek::SigningKey,
    client: Arc<dyn RealmClient>,
    devices: Arc<RemoteDevicesManager>,
    storage: Arc<LocalStorage>,
    events: Arc<EventBus>,
    default_blocksize: u64,
    sync_transactions: SyncTransactions,
    /// Serializes `process_last_messages` passes so two concurrent
    /// triggers (a monitor tick and an explicit call) never race on
    /// `last_processed_message`.
    process_messages_lock: AsyncMutex<()>,
    /// Serializes every read-modify-write of the user manifest itself
    /// (`workspace_create`/`rename`/the message handlers), independent of
    /// the message lock above so a long-running sync never blocks a
    /// workspace creation.
    update_user_manifest_lock: AsyncMutex<()>,
}

impl UserFS {
    pub fn new(
        user_manifest_id: EntryID,
        device_id: DeviceID,
        signing_key: ed25519_dalek::SigningKey,
        user_manifest_key: parsec_core::crypto::SecretKey,
        client: Arc<dyn RealmClient>,
        devices: Arc<RemoteDevicesManager>,
        storage: Arc<LocalStorage>,
        events: Arc<EventBus>,
        default_blocksize: u64,
    ) -> Self {
        let keys: Arc<dyn WorkspaceKeyProvider> = Arc::new(EntryKeyProvider {
            key: user_manifest_key,
            revision: 1,
        });
        let user_loader = Arc::new(RemoteLoader::new(
            device_id.clone(),
            signing_key.clone(),
            RealmID::from(user_manifest_id),
            keys,
            client.clone(),
            devices.clone(),
            storage.clone(),
        ));
        let sync_transactions = SyncTransactions::new(
            storage.clone(),
            user_loader,
            device_id.clone(),
            events.clone(),
        );
        Self {
            user_manifest_id,
            device_id,
            signing_key,
            client,
            devices,
            storage,
            events,
            default_blocksize,
            sync_transactions,
            process_messages_lock: AsyncMutex::new(()),
            update_user_manifest_lock: AsyncMutex::new(()),
        }
    }

    pub fn bootstrap(id: EntryID, author: DeviceID, storage: &LocalStorage) -> Result<(), UserFsError> {
        let manifest = LocalManifest::User(LocalUserManifest::new_placeholder(id, author));
        storage.manifests.set_manifest(manifest)?;
        Ok(())
    }

    fn get_user_manifest(&self) -> Result<LocalUserManifest, UserFsError> {
        match self.storage.manifests.get_manifest(self.user_manifest_id)? {
            LocalManifest::User(m) => Ok(m),
            _ => Err(CoreError::FileNotFound.into()),
        }
    }

    pub fn workspaces(&self) -> Result<Vec<WorkspaceEntry>, UserFsError> {
        Ok(self.get_user_manifest()?.workspaces)
    }

    pub fn user_manifest_id(&self) -> EntryID {
        self.user_manifest_id
    }

    pub fn device_id(&self) -> &DeviceID {
        &self.device_id
    }

    /// Push local user manifest changes to the realm (spec §4.6). Folder
    /// and workspace manifests inside each workspace are synced
    /// separately, per workspace, through that workspace's own
    /// [`WorkspaceFS`].
    pub async fn sync(&self) -> Result<(), UserFsError> {
        Ok(self.sync_transactions.sync_by_id(self.user_manifest_id).await?)
    }

    /// Create a brand-new workspace: a placeholder workspace-root manifest
    /// plus a user-manifest entry pointing at it, both left `need_sync` for
    /// the next [`UserFS::sync`] (spec §4.3 "workspace_create").
    pub async fn workspace_create(&self, name: impl Into<String>) -> Result<EntryID, UserFsError> {
        let _guard = self.update_user_manifest_lock.lock().await;
        let entry = WorkspaceEntry::new(name);
        let id = entry.id;
        WorkspaceFS::bootstrap_root(id, self.device_id.clone(), &self.storage)?;

        let manifest = self.get_user_manifest()?;
        let updated = manifest.evolve_workspaces(entry.clone());
        self.storage.manifests.set_manifest(LocalManifest::User(updated))?;
        self.events.publish(CoreEvent::FsWorkspaceCreated { entry });
        Ok(id)
    }

    pub async fn workspace_rename(&self, id: EntryID, new_name: impl Into<String>) -> Result<(), UserFsError> {
        let _guard = self.update_user_manifest_lock.lock().await;
        let manifest = self.get_user_manifest()?;
        let entry = manifest
            .get_workspace_entry(id)
            .ok_or(CoreError::FileNotFound)?
            .renamed(new_name);
        let updated = manifest.evolve_workspaces(entry);
        self.storage.manifests.set_manifest(LocalManifest::User(updated))?;
        Ok(())
    }

    fn workspace_loader(&self, entry: &WorkspaceEntry) -> RemoteLoader {
        let keys: Arc<dyn WorkspaceKeyProvider> = Arc::new(EntryKeyProvider {
            key: entry.key.clone(),
            revision: entry.encryption_revision,
        });
        RemoteLoader::new(
            self.device_id.clone(),
            self.signing_key.clone(),
            RealmID::from(entry.id),
            keys,
            self.client.clone(),
            self.devices.clone(),
            self.storage.clone(),
        )
    }

    /// Grant or revoke `recipient`'s role on workspace `id` (spec §4.7
    /// "sharing"). The caller's own role is re-fetched from the realm
    /// immediately before the grant so a stale cached role never lets a
    /// demoted user keep handing out access.
    pub async fn workspace_share(
        &self,
        id: EntryID,
        recipient: UserID,
        role: Option<Role>,
    ) -> Result<(), UserFsError> {
        let manifest = self.get_user_manifest()?;
        let entry = manifest.get_workspace_entry(id).ok_or(CoreError::FileNotFound)?.clone();
        if entry.is_revoked() {
            return Err(CoreError::NoAccess(entry.name.clone()).into());
        }
        let loader = self.workspace_loader(&entry);
        let roles = loader.load_realm_roles().await?;
        let my_role = roles
            .get(&self.device_id.user_id)
            .copied()
            .ok_or_else(|| CoreError::NoAccess(entry.name.clone()))?;
        let allowed = match role {
            Some(target) => my_role.may_grant(target),
            None => my_role.can_manage_roles(),
        };
        if !allowed {
            return Err(CoreError::SharingNotAllowed(format!(
                "{:?} cannot grant {:?} on {}",
                my_role, role, entry.name
            ))
            .into());
        }
        loader.grant_role(recipient.clone(), role).await?;

        let message = sign_message(
            &MessageContent::SharingGranted {
                entry: entry.with_role(role),
                reencryption: false,
            },
            &self.device_id,
            &self.signing_key,
        );
        self.client.message_send(recipient, Utc::now(), message).await?;
        Ok(())
    }

    /// Sign and send a reencryption key-rotation message to `recipient`
    /// (spec §4.7 "broadcast it to remaining participants via sharing
    /// messages with the same format as `sharing.granted` but flagged as
    /// reencryption"). Called by [`crate::realm::ReencryptionDriver`] once
    /// per remaining participant after a batch reencryption completes.
    pub async fn broadcast_key_rotation(
        &self,
        recipient: UserID,
        entry: &WorkspaceEntry,
    ) -> Result<(), UserFsError> {
        let message = sign_message(
            &MessageContent::SharingGranted {
                entry: entry.clone(),
                reencryption: true,
            },
            &self.device_id,
            &self.signing_key,
        );
        self.client.message_send(recipient, Utc::now(), message).await?;
        Ok(())
    }

    /// Drain every message newer than `last_processed_message`, applying
    /// each to the local user manifest and advancing the checkpoint once
    /// the whole batch is processed (spec §4.3/§4.8).
    pub async fn process_last_messages(&self) -> Result<(), UserFsError> {
        let _process_guard = self.process_messages_lock.lock().await;
        let offset = self.get_user_manifest()?.last_processed_message;
        let messages = self.client.message_get(offset).await?;
        if messages.is_empty() {
            return Ok(());
        }

        let mut highest = offset;
        for message in &messages {
            let (sender, content) = match verify_message(&message.body, &self.devices).await {
                Ok(parsed) => parsed,
                Err(_) => {
                    highest = highest.max(message.index);
                    continue;
                }
            };
            self.apply_message(sender, content).await?;
            highest = highest.max(message.index);
        }

        let _manifest_guard = self.update_user_manifest_lock.lock().await;
        let manifest = self.get_user_manifest()?;
        let mut updated = manifest.clone();
        updated.last_processed_message = highest;
        updated.need_sync = true;
        updated.updated = Utc::now();
        self.storage.manifests.set_manifest(LocalManifest::User(updated))?;
        Ok(())
    }

    async fn apply_message(&self, _sender: DeviceID, content: MessageContent) -> Result<(), UserFsError> {
        match content {
            MessageContent::SharingGranted { entry, reencryption } => {
                let loader = self.workspace_loader(&entry);
                let roles = match loader.load_realm_roles().await {
                    Ok(roles) => roles,
                    Err(_) => return Ok(()),
                };
                let current_role = roles.get(&self.device_id.user_id).copied();
                if current_role.is_none() {
                    // Revoked again before we got to it; do not resurrect access.
                    return Ok(());
                }
                let _guard = self.update_user_manifest_lock.lock().await;
                let manifest = self.get_user_manifest()?;
                let previous_entry = manifest.get_workspace_entry(entry.id).cloned();
                // The role is never trusted from the message, only the
                // key/revision are (and only when this is a reencryption);
                // a plain re-share keeps whatever key/revision is already
                // cached locally.
                let confirmed = match (&previous_entry, reencryption) {
                    (Some(previous), true) => previous
                        .with_new_key(entry.key.clone(), entry.encryption_revision)
                        .with_role(current_role),
                    _ => entry.with_role(current_role),
                };
                let updated = manifest.evolve_workspaces(confirmed.clone());
                self.storage.manifests.set_manifest(LocalManifest::User(updated))?;
                if reencryption {
                    self.events.publish(CoreEvent::SharingUpdated {
                        new_entry: confirmed,
                        previous_entry,
                    });
                } else {
                    self.events.publish(CoreEvent::SharingGranted {
                        new_entry: confirmed.clone(),
                    });
                    self.events.publish(CoreEvent::SharingUpdated {
                        new_entry: confirmed,
                        previous_entry,
                    });
                }
            }
            MessageContent::SharingRevoked { workspace_id } => {
                let _guard = self.update_user_manifest_lock.lock().await;
                let manifest = self.get_user_manifest()?;
                let Some(entry) = manifest.get_workspace_entry(workspace_id).cloned() else {
                    return Ok(());
                };
                if entry.is_revoked() {
                    return Ok(());
                }
                let loader = self.workspace_loader(&entry);
                let roles = match loader.load_realm_roles().await {
                    Ok(roles) => roles,
                    Err(_) => return Ok(()),
                };
                if roles.get(&self.device_id.user_id).is_some() {
                    // Still has a role according to the realm; the
                    // revocation message was stale.
                    return Ok(());
                }
                let revoked = entry.with_role(None);
                let updated = manifest.evolve_workspaces(revoked.clone());
                self.storage.manifests.set_manifest(LocalManifest::User(updated))?;
                self.events.publish(CoreEvent::SharingRevoked {
                    new_entry: revoked,
                    previous_entry: Some(entry),
                });
            }
            MessageContent::Ping { ping_id } => {
                self.events.publish(CoreEvent::Pinged { origin: ping_id });
            }
        }
        Ok(())
    }

    pub fn workspace(&self, entry: &WorkspaceEntry) -> WorkspaceFS {
        let loader = Arc::new(self.workspace_loader(entry));
        WorkspaceFS::new(
            entry.id,
            self.storage.clone(),
            loader,
            self.device_id.clone(),
            self.events.clone(),
            self.default_blocksize,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use parsec_core::config::CoreConfig;
    use parsec_core::crypto::SecretKey;
    use parsec_core::ids::BlockID;
    use parsec_remote::client::{MessageEntry, ReencryptionBatchEntry, VlobReadResponse};
    use std::collections::{BTreeMap, HashMap as StdHashMap};
    use tempfile::tempdir;

    fn device(name: &str) -> DeviceID {
        DeviceID::new("alice", name)
    }

    struct FakeClient {
        vlobs: SyncMutex<StdHashMap<EntryID, (u64, Vec<u8>, DeviceID, chrono::DateTime<Utc>)>>,
        roles: SyncMutex<StdHashMap<RealmID, Vec<u8>>>,
        messages: SyncMutex<Vec<MessageEntry>>,
        role_certs: SyncMutex<StdHashMap<RealmID, Vec<Vec<u8>>>>,
    }

    #[async_trait::async_trait]
    impl RealmClient for FakeClient {
        async fn vlob_create(
            &self,
            _realm_id: RealmID,
            _rev: u32,
            vlob_id: EntryID,
            timestamp: chrono::DateTime<Utc>,
            blob: Vec<u8>,
        ) -> Result<(), RemoteError> {
            let mut vlobs = self.vlobs.lock();
            if vlobs.contains_key(&vlob_id) {
                return Err(RemoteError::AlreadyExists);
            }
            vlobs.insert(vlob_id, (1, blob, device("laptop"), timestamp));
            Ok(())
        }
        async fn vlob_update(
            &self,
            _rev: u32,
            vlob_id: EntryID,
            version: u64,
            timestamp: chrono::DateTime<Utc>,
            blob: Vec<u8>,
        ) -> Result<(), RemoteError> {
            let mut vlobs = self.vlobs.lock();
            let entry = vlobs.get(&vlob_id).ok_or(RemoteError::NotFound)?;
            if entry.0 + 1 != version {
                return Err(RemoteError::BadVersion);
            }
            vlobs.insert(vlob_id, (version, blob, device("laptop"), timestamp));
            Ok(())
        }
        async fn vlob_read(
            &self,
            _rev: u32,
            vlob_id: EntryID,
            _version: Option<u64>,
            _timestamp: Option<chrono::DateTime<Utc>>,
        ) -> Result<VlobReadResponse, RemoteError> {
            let vlobs = self.vlobs.lock();
            let (version, blob, author, timestamp) = vlobs.get(&vlob_id).ok_or(RemoteError::NotFound)?;
            Ok(VlobReadResponse {
                author: author.clone(),
                timestamp: *timestamp,
                version: *version,
                blob: blob.clone(),
            })
        }
        async fn vlob_poll_changes(
            &self,
            _realm_id: RealmID,
            _last_checkpoint: u64,
        ) -> Result<(u64, BTreeMap<EntryID, u64>), RemoteError> {
            Ok((0, BTreeMap::new()))
        }
        async fn block_create(&self, _id: BlockID, _realm: RealmID, _data: Vec<u8>) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn block_read(&self, _id: BlockID) -> Result<Vec<u8>, RemoteError> {
            Err(RemoteError::NotFound)
        }
        async fn realm_create(&self, cert: Vec<u8>) -> Result<(), RemoteError> {
            let _ = cert;
            Ok(())
        }
        async fn realm_update_roles(&self, _cert: Vec<u8>) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn realm_get_role_certificates(&self, realm: RealmID) -> Result<Vec<Vec<u8>>, RemoteError> {
            Ok(self.role_certs.lock().get(&realm).cloned().unwrap_or_default())
        }
        async fn realm_start_reencryption_maintenance(&self, _realm: RealmID, _rev: u32) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn realm_finish_reencryption_maintenance(&self, _realm: RealmID, _rev: u32) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn maintenance_get_reencryption_batch(
            &self,
            _realm: RealmID,
            _rev: u32,
            _size: u32,
        ) -> Result<Vec<ReencryptionBatchEntry>, RemoteError> {
            Ok(Vec::new())
        }
        async fn maintenance_save_reencryption_batch(
            &self,
            _realm: RealmID,
            _rev: u32,
            _batch: Vec<ReencryptionBatchEntry>,
        ) -> Result<(u64, u64), RemoteError> {
            Ok((0, 0))
        }
        async fn message_get(&self, offset: u64) -> Result<Vec<MessageEntry>, RemoteError> {
            Ok(self
                .messages
                .lock()
                .iter()
                .filter(|m| m.index > offset)
                .cloned()
                .collect())
        }
        async fn message_send(&self, _to: UserID, ts: chrono::DateTime<Utc>, body: Vec<u8>) -> Result<(), RemoteError> {
            let mut messages = self.messages.lock();
            let index = messages.len() as u64 + 1;
            messages.push(MessageEntry {
                index,
                sender: device("laptop"),
                timestamp: ts,
                body,
            });
            Ok(())
        }
        async fn get_device_verify_key(&self, _id: &DeviceID) -> Result<ed25519_dalek::VerifyingKey, RemoteError> {
            Err(RemoteError::NotFound)
        }
    }

    async fn fixture() -> (UserFS, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(LocalStorage::open(dir.path(), &CoreConfig::default()).unwrap());
        let id = EntryID::new();
        UserFS::bootstrap(id, device("laptop"), &storage).unwrap();
        let signing_key = parsec_core::crypto::generate_signing_key();
        let client: Arc<dyn RealmClient> = Arc::new(FakeClient {
            vlobs: SyncMutex::new(StdHashMap::new()),
            roles: SyncMutex::new(StdHashMap::new()),
            messages: SyncMutex::new(Vec::new()),
            role_certs: SyncMutex::new(StdHashMap::new()),
        });
        let devices = Arc::new(RemoteDevicesManager::new(client.clone()));
        devices.seed(device("laptop"), signing_key.verifying_key());
        let events = Arc::new(EventBus::new(16));
        let fs = UserFS::new(
            id,
            device("laptop"),
            signing_key,
            SecretKey::generate(),
            client,
            devices,
            storage,
            events,
            512 * 1024,
        );
        (fs, dir)
    }

    #[tokio::test]
    async fn workspace_create_is_visible_locally_before_sync() {
        let (fs, _dir) = fixture().await;
        let id = fs.workspace_create("docs").await.unwrap();
        let workspaces = fs.workspaces().unwrap();
        assert_eq!(workspaces.len(), 1);
        assert_eq!(workspaces[0].id, id);
        assert_eq!(workspaces[0].name, "docs");
    }

    #[tokio::test]
    async fn workspace_rename_updates_entry_in_place() {
        let (fs, _dir) = fixture().await;
        let id = fs.workspace_create("docs").await.unwrap();
        fs.workspace_rename(id, "archive").await.unwrap();
        let workspaces = fs.workspaces().unwrap();
        assert_eq!(workspaces[0].name, "archive");
    }

    #[tokio::test]
    async fn sync_uploads_the_user_manifest() {
        let (fs, _dir) = fixture().await;
        fs.workspace_create("docs").await.unwrap();
        fs.sync().await.unwrap();
        let manifest = fs.get_user_manifest().unwrap();
        assert!(!manifest.need_sync);
        assert_eq!(manifest.base_version, 1);
    }

    #[tokio::test]
    async fn process_last_messages_is_a_no_op_with_an_empty_inbox() {
        let (fs, _dir) = fixture().await;
        fs.process_last_messages().await.unwrap();
        let manifest = fs.get_user_manifest().unwrap();
        assert_eq!(manifest.last_processed_message, 0);
    }
}
