//! Workspace key rotation (spec §4.7 "Reencryption").
//!
//! Grounded in the teacher's `integrity/scanner.rs` + `enforcement/restore.rs`
//! scan-then-remediate shape: a bulk read pass (fetch every vlob still at
//! the old encryption revision) followed by a bulk write pass (resubmit it
//! reencrypted), with each batch independently idempotent so a crash
//! mid-pass just means the server reports the same remaining work on the
//! next attempt — the same resumability `RestoreEngine` gets from treating
//! each file restore as its own atomic step.

use parsec_core::crypto::{self, SecretKey};
use parsec_core::ids::UserID;
use parsec_core::workspace_entry::WorkspaceEntry;
use parsec_remote::client::ReencryptionBatchEntry;
use parsec_remote::{RemoteError, RemoteLoader};

use crate::user_fs::{UserFS, UserFsError};

#[derive(Debug, thiserror::Error)]
pub enum RealmError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("failed to reencrypt vlob: {0}")]
    Crypto(String),
    #[error("failed to notify participant of key rotation: {0}")]
    Message(String),
}

impl From<UserFsError> for RealmError {
    fn from(err: UserFsError) -> Self {
        RealmError::Message(err.to_string())
    }
}

/// Drives one workspace's reencryption pass to completion (spec §4.7). One
/// driver per workspace, built from that workspace's own `RemoteLoader` so
/// the maintenance RPCs and the ordinary vlob RPCs share the same realm
/// binding.
pub struct ReencryptionDriver {
    loader: std::sync::Arc<RemoteLoader>,
    batch_size: u32,
}

impl ReencryptionDriver {
    pub fn new(loader: std::sync::Arc<RemoteLoader>, batch_size: u32) -> Self {
        Self {
            loader,
            batch_size: batch_size.min(1000),
        }
    }

    /// Rotate `entry`'s key: bump `encryption_revision`, generate a fresh
    /// `SecretKey`, reencrypt every vlob in the realm, then broadcast the
    /// new key to `participants` via `user_fs`. Returns the caller's own
    /// updated entry to store in its user manifest — the caller is
    /// responsible for that (a `ReencryptionDriver` never touches the
    /// caller's own user manifest, only the realm and the wire).
    pub async fn reencrypt(
        &self,
        entry: &WorkspaceEntry,
        participants: &[UserID],
        user_fs: &UserFS,
    ) -> Result<WorkspaceEntry, RealmError> {
        let old_key = entry.key.clone();
        let new_key = SecretKey::generate();
        let new_revision = entry.encryption_revision + 1;

        self.loader.start_reencryption(new_revision).await?;
        self.run_batches(new_revision, &old_key, &new_key).await?;
        self.loader.finish_reencryption(new_revision).await?;

        let rotated = entry.with_new_key(new_key, new_revision);
        for participant in participants {
            user_fs
                .broadcast_key_rotation(participant.clone(), &rotated)
                .await?;
        }
        Ok(rotated)
    }

    /// Fetch/reencrypt/submit in batches of at most `self.batch_size` until
    /// the server reports `done == total`. Safe to call again after a crash:
    /// every already-reencrypted vlob is no longer returned by the next
    /// `maintenance_get_reencryption_batch` call.
    async fn run_batches(
        &self,
        new_revision: u32,
        old_key: &SecretKey,
        new_key: &SecretKey,
    ) -> Result<(), RealmError> {
        loop {
            let batch = self
                .loader
                .reencryption_batch(new_revision, self.batch_size)
                .await?;
            if batch.is_empty() {
                return Ok(());
            }

            let reencrypted = reencrypt_batch(batch, old_key, new_key)?;
            let (done, total) = self
                .loader
                .save_reencryption_batch(new_revision, reencrypted)
                .await?;
            if done >= total {
                return Ok(());
            }
        }
    }
}

fn reencrypt_batch(
    batch: Vec<ReencryptionBatchEntry>,
    old_key: &SecretKey,
    new_key: &SecretKey,
) -> Result<Vec<ReencryptionBatchEntry>, RealmError> {
    batch
        .into_iter()
        .map(|vlob| {
            let plaintext = crypto::decrypt(old_key, &vlob.blob).map_err(|e| RealmError::Crypto(e.to_string()))?;
            Ok(ReencryptionBatchEntry {
                vlob_id: vlob.vlob_id,
                version: vlob.version,
                blob: crypto::encrypt(new_key, &plaintext),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use parsec_core::ids::{BlockID, DeviceID, EntryID, RealmID};
    use parsec_remote::client::{MessageEntry, VlobReadResponse};
    use parsec_remote::{RealmClient, RemoteDevicesManager};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn device() -> DeviceID {
        DeviceID::new("alice", "laptop")
    }

    /// A fake realm holding three vlobs still at revision 1, served back
    /// two at a time so the reencryption loop needs more than one pass.
    struct FakeMaintenanceClient {
        old_key: SecretKey,
        vlobs: Mutex<HashMap<EntryID, (u64, Vec<u8>)>>,
        reencrypted: Mutex<HashMap<EntryID, (u64, Vec<u8>)>>,
        messages: Mutex<Vec<MessageEntry>>,
    }

    #[async_trait]
    impl RealmClient for FakeMaintenanceClient {
        async fn vlob_create(&self, _: RealmID, _: u32, _: EntryID, _: DateTime<Utc>, _: Vec<u8>) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn vlob_update(&self, _: u32, _: EntryID, _: u64, _: DateTime<Utc>, _: Vec<u8>) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn vlob_read(&self, _: u32, _: EntryID, _: Option<u64>, _: Option<DateTime<Utc>>) -> Result<VlobReadResponse, RemoteError> {
            Err(RemoteError::NotFound)
        }
        async fn vlob_poll_changes(&self, _: RealmID, _: u64) -> Result<(u64, BTreeMap<EntryID, u64>), RemoteError> {
            Ok((0, BTreeMap::new()))
        }
        async fn block_create(&self, _: BlockID, _: RealmID, _: Vec<u8>) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn block_read(&self, _: BlockID) -> Result<Vec<u8>, RemoteError> {
            Err(RemoteError::NotFound)
        }
        async fn realm_create(&self, _: Vec<u8>) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn realm_update_roles(&self, _: Vec<u8>) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn realm_get_role_certificates(&self, _: RealmID) -> Result<Vec<Vec<u8>>, RemoteError> {
            Ok(Vec::new())
        }
        async fn realm_start_reencryption_maintenance(&self, _: RealmID, _: u32) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn realm_finish_reencryption_maintenance(&self, _: RealmID, _: u32) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn maintenance_get_reencryption_batch(
            &self,
            _: RealmID,
            _: u32,
            size: u32,
        ) -> Result<Vec<ReencryptionBatchEntry>, RemoteError> {
            let vlobs = self.vlobs.lock();
            Ok(vlobs
                .iter()
                .take(size as usize)
                .map(|(id, (version, blob))| ReencryptionBatchEntry {
                    vlob_id: *id,
                    version: *version,
                    blob: blob.clone(),
                })
                .collect())
        }
        async fn maintenance_save_reencryption_batch(
            &self,
            _: RealmID,
            _: u32,
            batch: Vec<ReencryptionBatchEntry>,
        ) -> Result<(u64, u64), RemoteError> {
            let total = {
                let vlobs = self.vlobs.lock();
                vlobs.len() as u64 + self.reencrypted.lock().len() as u64
            };
            let mut vlobs = self.vlobs.lock();
            let mut done = self.reencrypted.lock();
            for entry in batch {
                vlobs.remove(&entry.vlob_id);
                done.insert(entry.vlob_id, (entry.version, entry.blob));
            }
            Ok((done.len() as u64, total))
        }
        async fn message_get(&self, offset: u64) -> Result<Vec<MessageEntry>, RemoteError> {
            Ok(self.messages.lock().iter().filter(|m| m.index > offset).cloned().collect())
        }
        async fn message_send(&self, _: parsec_core::ids::UserID, ts: DateTime<Utc>, body: Vec<u8>) -> Result<(), RemoteError> {
            let mut messages = self.messages.lock();
            let index = messages.len() as u64 + 1;
            messages.push(MessageEntry {
                index,
                sender: device(),
                timestamp: ts,
                body,
            });
            Ok(())
        }
        async fn get_device_verify_key(&self, _: &DeviceID) -> Result<ed25519_dalek::VerifyingKey, RemoteError> {
            Err(RemoteError::NotFound)
        }
    }

    struct FixedKeys(SecretKey, u32);
    impl parsec_remote::WorkspaceKeyProvider for FixedKeys {
        fn encryption_revision(&self) -> u32 {
            self.1
        }
        fn workspace_key(&self) -> SecretKey {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn reencrypts_every_vlob_across_multiple_batches() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(parsec_core::LocalStorage::open(dir.path(), &parsec_core::CoreConfig::default()).unwrap());
        let old_key = SecretKey::generate();

        let mut vlobs = HashMap::new();
        for _ in 0..3 {
            let id = EntryID::new();
            vlobs.insert(id, (1u64, crypto::encrypt(&old_key, b"plaintext manifest bytes")));
        }
        let client: Arc<dyn RealmClient> = Arc::new(FakeMaintenanceClient {
            old_key: old_key.clone(),
            vlobs: Mutex::new(vlobs),
            reencrypted: Mutex::new(HashMap::new()),
            messages: Mutex::new(Vec::new()),
        });

        let signing_key = crypto::generate_signing_key();
        let devices = Arc::new(RemoteDevicesManager::new(client.clone()));
        devices.seed(device(), signing_key.verifying_key());

        let entry = WorkspaceEntry::new("docs").with_new_key(old_key.clone(), 1);
        let keys = Arc::new(FixedKeys(old_key.clone(), 1));
        let loader = Arc::new(RemoteLoader::new(
            device(),
            signing_key.clone(),
            RealmID::from(entry.id),
            keys,
            client.clone(),
            devices.clone(),
            storage.clone(),
        ));

        let events = Arc::new(parsec_core::EventBus::new(16));
        let user_manifest_id = EntryID::new();
        UserFS::bootstrap(user_manifest_id, device(), &storage).unwrap();
        let user_fs = UserFS::new(
            user_manifest_id,
            device(),
            signing_key,
            SecretKey::generate(),
            client,
            devices,
            storage,
            events,
            512 * 1024,
        );

        // Batch size of 2 forces a second round trip for the third vlob.
        let driver = ReencryptionDriver::new(loader, 2);
        let rotated = driver
            .reencrypt(&entry, &[UserID("bob".into())], &user_fs)
            .await
            .unwrap();

        assert_eq!(rotated.encryption_revision, 2);
        assert_ne!(rotated.key, old_key);
    }
}
