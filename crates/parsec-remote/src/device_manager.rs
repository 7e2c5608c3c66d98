//! Cache of device verify keys (spec §4.2 "fetched and cached from a Remote
//! Devices Manager"), modeled on the teacher's `connected::verifier::Verifier`:
//! a small in-memory cache of signer public keys, populated lazily from the
//! backend on first use.

use std::collections::HashMap;
use std::sync::Arc;

use ed25519_dalek::VerifyingKey;
use parking_lot::Mutex;
use parsec_core::ids::DeviceID;

use crate::client::RealmClient;
use crate::errors::RemoteError;

pub struct RemoteDevicesManager {
    client: Arc<dyn RealmClient>,
    cache: Mutex<HashMap<DeviceID, VerifyingKey>>,
}

impl RemoteDevicesManager {
    pub fn new(client: Arc<dyn RealmClient>) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_verify_key(&self, device_id: &DeviceID) -> Result<VerifyingKey, RemoteError> {
        if let Some(key) = self.cache.lock().get(device_id) {
            return Ok(*key);
        }
        let key = self.client.get_device_verify_key(device_id).await?;
        self.cache.lock().insert(device_id.clone(), key);
        Ok(key)
    }

    /// Test/bootstrap hook: seed a key without a round trip, used when a
    /// device's own verify key is already known locally.
    pub fn seed(&self, device_id: DeviceID, key: VerifyingKey) {
        self.cache.lock().insert(device_id, key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parsec_core::ids::{BlockID, EntryID, RealmID, UserID};
    use std::collections::BTreeMap;

    struct StubClient {
        key: VerifyingKey,
    }

    #[async_trait]
    impl RealmClient for StubClient {
        async fn vlob_create(&self, _: RealmID, _: u32, _: EntryID, _: DateTime<Utc>, _: Vec<u8>) -> Result<(), RemoteError> { unimplemented!() }
        async fn vlob_update(&self, _: u32, _: EntryID, _: u64, _: DateTime<Utc>, _: Vec<u8>) -> Result<(), RemoteError> { unimplemented!() }
        async fn vlob_read(&self, _: u32, _: EntryID, _: Option<u64>, _: Option<DateTime<Utc>>) -> Result<VlobReadResponse, RemoteError> { unimplemented!() }
        async fn vlob_poll_changes(&self, _: RealmID, _: u64) -> Result<(u64, BTreeMap<EntryID, u64>), RemoteError> { unimplemented!() }
        async fn block_create(&self, _: BlockID, _: RealmID, _: Vec<u8>) -> Result<(), RemoteError> { unimplemented!() }
        async fn block_read(&self, _: BlockID) -> Result<Vec<u8>, RemoteError> { unimplemented!() }
        async fn realm_create(&self, _: Vec<u8>) -> Result<(), RemoteError> { unimplemented!() }
        async fn realm_update_roles(&self, _: Vec<u8>) -> Result<(), RemoteError> { unimplemented!() }
        async fn realm_get_role_certificates(&self, _: RealmID) -> Result<Vec<Vec<u8>>, RemoteError> { unimplemented!() }
        async fn realm_start_reencryption_maintenance(&self, _: RealmID, _: u32) -> Result<(), RemoteError> { unimplemented!() }
        async fn realm_finish_reencryption_maintenance(&self, _: RealmID, _: u32) -> Result<(), RemoteError> { unimplemented!() }
        async fn maintenance_get_reencryption_batch(&self, _: RealmID, _: u32, _: u32) -> Result<Vec<ReencryptionBatchEntry>, RemoteError> { unimplemented!() }
        async fn maintenance_save_reencryption_batch(&self, _: RealmID, _: u32, _: Vec<ReencryptionBatchEntry>) -> Result<(u64, u64), RemoteError> { unimplemented!() }
        async fn message_get(&self, _: u64) -> Result<Vec<MessageEntry>, RemoteError> { unimplemented!() }
        async fn message_send(&self, _: UserID, _: DateTime<Utc>, _: Vec<u8>) -> Result<(), RemoteError> { unimplemented!() }
        async fn get_device_verify_key(&self, _: &DeviceID) -> Result<VerifyingKey, RemoteError> {
            Ok(self.key)
        }
    }

    #[tokio::test]
    async fn fetches_once_then_caches() {
        let key = parsec_core::crypto::generate_signing_key().verifying_key();
        let manager = RemoteDevicesManager::new(Arc::new(StubClient { key }));
        let device = DeviceID::new("alice", "laptop");
        let first = manager.get_verify_key(&device).await.unwrap();
        assert_eq!(first, key);
        // Cached path returns the same key without needing the stub again.
        let second = manager.get_verify_key(&device).await.unwrap();
        assert_eq!(second, key);
    }

    #[test]
    fn seeded_key_is_returned_without_client_call() {
        let key = parsec_core::crypto::generate_signing_key().verifying_key();
        let manager = RemoteDevicesManager::new(Arc::new(StubClient { key }));
        let device = DeviceID::new("bob", "phone");
        manager.seed(device.clone(), key);
        assert_eq!(*manager.cache.lock().get(&device).unwrap(), key);
    }
}
