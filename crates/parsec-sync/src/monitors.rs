//! The three long-lived background tasks that drive the core end to end
//! (spec §4.8): a message monitor, a sync monitor, and a backend
//! connection monitor. Each is a plain `tokio::spawn`'d loop cancelled by a
//! shared `tokio::sync::watch<bool>` shutdown signal, never by dropping its
//! `JoinHandle` — matching the teacher's own preference for an explicit
//! shutdown flag over relying on drop order.
//!
//! Grounded directly in the teacher: the **message monitor** is
//! `connected::commands::spawn_command_loop`'s shape (fixed-interval
//! `tokio::time::interval`, one dispatch per tick, `warn!` and continue on
//! failure); the **sync monitor** is `integrity::pipeline::spawn_watcher_pipeline`
//! (a `HashMap<Key, Instant>` debounce window flushed on a `select!` between
//! the event channel and a short sleep); the **backend connection monitor**
//! is `connected::heartbeat::spawn_heartbeat_loop` (fixed-interval ping),
//! extended here with the exponential-backoff-with-cap spec §5 adds on top.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};

use parsec_core::ids::{EntryID, RealmID};
use parsec_core::{CoreEvent, EventBus};
use parsec_remote::{RealmClient, RemoteError};

use crate::user_fs::UserFS;
use crate::workspace_fs::WorkspaceFS;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SyncMonitorError(String);

/// Something the sync monitor can route a bare entry id to and ask to sync
/// (spec §5 "events carry only ids; recipients re-read the latest state
/// from local storage"). One target per `UserFS`/`WorkspaceFS` the core has
/// open.
#[async_trait]
pub trait SyncTarget: Send + Sync {
    fn owns_entry(&self, id: EntryID) -> bool;
    async fn sync_entry(&self, id: EntryID) -> Result<(), SyncMonitorError>;
}

#[async_trait]
impl SyncTarget for UserFS {
    fn owns_entry(&self, id: EntryID) -> bool {
        id == self.user_manifest_id()
    }

    async fn sync_entry(&self, _id: EntryID) -> Result<(), SyncMonitorError> {
        self.sync().await.map_err(|e| SyncMonitorError(e.to_string()))
    }
}

#[async_trait]
impl SyncTarget for WorkspaceFS {
    fn owns_entry(&self, id: EntryID) -> bool {
        WorkspaceFS::owns_entry(self, id)
    }

    async fn sync_entry(&self, id: EntryID) -> Result<(), SyncMonitorError> {
        WorkspaceFS::sync_entry(self, id)
            .await
            .map_err(|e| SyncMonitorError(e.to_string()))
    }
}

/// Drains the user's message inbox on a fixed interval (spec §4.3
/// "process_last_messages"/§4.8 "message monitor").
pub fn spawn_message_monitor(
    user_fs: Arc<UserFS>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("message monitor shutting down");
                        return;
                    }
                }
            }
            if let Err(err) = user_fs.process_last_messages().await {
                warn!(error = %err, "message monitor: failed to drain inbox, retrying next tick");
            }
        }
    })
}

/// Debounces `FsEntryUpdated` and `BackendRealmVlobsUpdated` events into at
/// most one `sync_entry` call per entry per debounce window (spec §4.8),
/// skipping any `BackendRealmVlobsUpdated` whose checkpoint is not newer
/// than the last one acted on for that realm (spec §4.8 "Ordering
/// guarantees" (c)).
pub fn spawn_sync_monitor(
    targets: Vec<Arc<dyn SyncTarget>>,
    events: Arc<EventBus>,
    debounce: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut subscription = events.subscribe();
        let mut pending: HashMap<EntryID, Instant> = HashMap::new();
        let mut last_checkpoint: HashMap<RealmID, u64> = HashMap::new();

        loop {
            tokio::select! {
                event = subscription.recv() => {
                    match event {
                        Some((_, CoreEvent::FsEntryUpdated { id })) => {
                            pending.insert(id, Instant::now());
                        }
                        Some((_, CoreEvent::BackendRealmVlobsUpdated { realm_id, checkpoint, src_id, .. })) => {
                            let seen = last_checkpoint.get(&realm_id).copied().unwrap_or(0);
                            if checkpoint > seen {
                                last_checkpoint.insert(realm_id, checkpoint);
                                pending.insert(src_id, Instant::now());
                            }
                        }
                        Some(_) => {}
                        None => {
                            debug!("sync monitor: event bus closed, exiting");
                            return;
                        }
                    }
                }
                _ = sleep(Duration::from_millis(20)) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("sync monitor shutting down");
                        return;
                    }
                }
            }

            let now = Instant::now();
            let ready: Vec<EntryID> = pending
                .iter()
                .filter(|(_, ts)| now.duration_since(**ts) >= debounce)
                .map(|(id, _)| *id)
                .collect();

            for id in ready {
                pending.remove(&id);
                let Some(target) = targets.iter().find(|t| t.owns_entry(id)) else {
                    debug!(id = %id, "sync monitor: no open target owns this entry, skipping");
                    continue;
                };
                if let Err(err) = target.sync_entry(id).await {
                    warn!(id = %id, error = %err, "sync monitor: sync failed, will retry on next trigger");
                }
            }
        }
    })
}

/// Pings the backend on a fixed interval while connected, falling back to
/// exponential backoff (capped) while it isn't (spec §5 "Timeouts"/"Backend
/// connection monitor"). `message_get` is used as the ping: it is the
/// cheapest authenticated call in the realm RPC surface and exercises the
/// same session the other monitors depend on.
pub fn spawn_backend_connection_monitor(
    client: Arc<dyn RealmClient>,
    events: Arc<EventBus>,
    heartbeat_interval: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut connected = false;
        let mut backoff = backoff_initial;

        loop {
            let wait = if connected { heartbeat_interval } else { backoff };
            tokio::select! {
                _ = sleep(wait) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("backend connection monitor shutting down");
                        return;
                    }
                }
            }

            match client.message_get(0).await {
                Ok(_) => {
                    if !connected {
                        info!("backend connection established");
                        events.publish(CoreEvent::BackendConnectionReady);
                    }
                    connected = true;
                    backoff = backoff_initial;
                }
                Err(RemoteError::NoAccess) => {
                    warn!("backend refused the connection; credentials may be revoked");
                    events.publish(CoreEvent::BackendConnectionRefused);
                    connected = false;
                    backoff = backoff_initial;
                }
                Err(RemoteError::Offline(reason)) => {
                    if connected {
                        warn!(reason = %reason, "backend connection lost");
                        events.publish(CoreEvent::BackendConnectionLost);
                    }
                    connected = false;
                    backoff = (backoff * 2).min(backoff_max);
                }
                Err(other) => {
                    warn!(error = %other, "backend connection monitor: unexpected error");
                    events.publish(CoreEvent::BackendConnectionCrashed {
                        reason: other.to_string(),
                    });
                    connected = false;
                    backoff = (backoff * 2).min(backoff_max);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use parsec_core::config::CoreConfig;
    use parsec_core::crypto::SecretKey;
    use parsec_core::ids::{BlockID, DeviceID};
    use parsec_core::LocalStorage;
    use parsec_remote::client::{MessageEntry, ReencryptionBatchEntry, VlobReadResponse};
    use parsec_remote::RemoteDevicesManager;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn device() -> DeviceID {
        DeviceID::new("alice", "laptop")
    }

    struct FakeClient {
        messages: Mutex<Vec<MessageEntry>>,
        fail_messages: Mutex<bool>,
    }

    #[async_trait]
    impl RealmClient for FakeClient {
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
        async fn maintenance_get_reencryption_batch(&self, _: RealmID, _: u32, _: u32) -> Result<Vec<ReencryptionBatchEntry>, RemoteError> {
            Ok(Vec::new())
        }
        async fn maintenance_save_reencryption_batch(&self, _: RealmID, _: u32, _: Vec<ReencryptionBatchEntry>) -> Result<(u64, u64), RemoteError> {
            Ok((0, 0))
        }
        async fn message_get(&self, offset: u64) -> Result<Vec<MessageEntry>, RemoteError> {
            if *self.fail_messages.lock() {
                return Err(RemoteError::Offline("down for maintenance".into()));
            }
            Ok(self.messages.lock().iter().filter(|m| m.index > offset).cloned().collect())
        }
        async fn message_send(&self, _: parsec_core::ids::UserID, _: DateTime<Utc>, _: Vec<u8>) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn get_device_verify_key(&self, _: &DeviceID) -> Result<ed25519_dalek::VerifyingKey, RemoteError> {
            Err(RemoteError::NotFound)
        }
    }

    #[tokio::test]
    async fn message_monitor_drains_the_inbox_on_each_tick() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(LocalStorage::open(dir.path(), &CoreConfig::default()).unwrap());
        let id = EntryID::new();
        UserFS::bootstrap(id, device(), &storage).unwrap();
        let signing_key = parsec_core::crypto::generate_signing_key();
        let client: Arc<dyn RealmClient> = Arc::new(FakeClient {
            messages: Mutex::new(Vec::new()),
            fail_messages: Mutex::new(false),
        });
        let devices = Arc::new(RemoteDevicesManager::new(client.clone()));
        devices.seed(device(), signing_key.verifying_key());
        let events = Arc::new(EventBus::new(16));
        let user_fs = Arc::new(UserFS::new(
            id,
            device(),
            signing_key,
            SecretKey::generate(),
            client,
            devices,
            storage,
            events,
            512 * 1024,
        ));

        let (tx, rx) = watch::channel(false);
        let handle = spawn_message_monitor(user_fs.clone(), Duration::from_millis(10), rx);
        sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn sync_monitor_debounces_bursts_into_one_sync_per_entry() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(LocalStorage::open(dir.path(), &CoreConfig::default()).unwrap());
        let root_id = EntryID::new();
        WorkspaceFS::bootstrap_root(root_id, device(), &storage).unwrap();
        let signing_key = parsec_core::crypto::generate_signing_key();
        let client: Arc<dyn RealmClient> = Arc::new(FakeClient {
            messages: Mutex::new(Vec::new()),
            fail_messages: Mutex::new(false),
        });
        let devices = Arc::new(RemoteDevicesManager::new(client.clone()));
        devices.seed(device(), signing_key.verifying_key());
        struct FixedKeys(SecretKey);
        impl parsec_remote::WorkspaceKeyProvider for FixedKeys {
            fn encryption_revision(&self) -> u32 {
                1
            }
            fn workspace_key(&self) -> SecretKey {
                self.0.clone()
            }
        }
        let loader = Arc::new(parsec_remote::RemoteLoader::new(
            device(),
            signing_key,
            RealmID::from(root_id),
            Arc::new(FixedKeys(SecretKey::generate())),
            client,
            devices,
            storage.clone(),
        ));
        let events = Arc::new(EventBus::new(16));
        let workspace = Arc::new(WorkspaceFS::new(
            root_id,
            storage,
            loader,
            device(),
            events.clone(),
            512 * 1024,
        ));
        let target: Arc<dyn SyncTarget> = workspace.clone();

        let (tx, rx) = watch::channel(false);
        let handle = spawn_sync_monitor(vec![target], events.clone(), Duration::from_millis(30), rx);

        // A burst of three events for the same entry should debounce to one sync.
        for _ in 0..3 {
            events.publish(CoreEvent::FsEntryUpdated { id: root_id });
            sleep(Duration::from_millis(5)).await;
        }
        sleep(Duration::from_millis(80)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let info = workspace
            .entry_info(&crate::fs_path::FsPath::root())
            .await
            .unwrap();
        assert!(!info.need_sync);
    }

    #[tokio::test]
    async fn backend_connection_monitor_reports_ready_then_lost() {
        let client = Arc::new(FakeClient {
            messages: Mutex::new(Vec::new()),
            fail_messages: Mutex::new(false),
        });
        let events = Arc::new(EventBus::new(16));
        let mut sub = events.subscribe();
        let (tx, rx) = watch::channel(false);
        let handle = spawn_backend_connection_monitor(
            client.clone(),
            events.clone(),
            Duration::from_millis(15),
            Duration::from_millis(5),
            Duration::from_millis(40),
            rx,
        );

        let (_, first) = sub.recv().await.unwrap();
        assert!(matches!(first, CoreEvent::BackendConnectionReady));

        *client.fail_messages.lock() = true;
        let (_, second) = sub.recv().await.unwrap();
        assert!(matches!(second, CoreEvent::BackendConnectionLost));

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
