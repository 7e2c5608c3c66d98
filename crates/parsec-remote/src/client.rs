//! The realm RPC surface consumed by the core (spec §6 table), and one
//! concrete `reqwest`-backed implementation.
//!
//! Grounded in the teacher's `connected::api_client::ApiClient`: a single
//! `reqwest::Client` built once with a fixed user agent, bearer-token auth
//! on every call, and `StatusCode` matched directly for the idempotent
//! not-found/already-exists cases rather than parsing an error body.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use parsec_core::ids::{BlockID, DeviceID, EntryID, RealmID, UserID};
use reqwest::StatusCode;

use crate::errors::RemoteError;

#[derive(Debug, Clone)]
pub struct VlobReadResponse {
    pub author: DeviceID,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
    pub blob: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ReencryptionBatchEntry {
    pub vlob_id: EntryID,
    pub version: u64,
    pub blob: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct MessageEntry {
    pub index: u64,
    pub sender: DeviceID,
    pub timestamp: DateTime<Utc>,
    pub body: Vec<u8>,
}

/// The full RPC surface a `RemoteLoader` needs (spec §6). One trait so
/// `RemoteLoader` can be exercised against an in-memory fake in tests
/// without a live server.
#[async_trait]
pub trait RealmClient: Send + Sync {
    async fn vlob_create(
        &self,
        realm_id: RealmID,
        encryption_revision: u32,
        vlob_id: EntryID,
        timestamp: DateTime<Utc>,
        blob: Vec<u8>,
    ) -> Result<(), RemoteError>;

    async fn vlob_update(
        &self,
        encryption_revision: u32,
        vlob_id: EntryID,
        version: u64,
        timestamp: DateTime<Utc>,
        blob: Vec<u8>,
    ) -> Result<(), RemoteError>;

    async fn vlob_read(
        &self,
        encryption_revision: u32,
        vlob_id: EntryID,
        version: Option<u64>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<VlobReadResponse, RemoteError>;

    async fn vlob_poll_changes(
        &self,
        realm_id: RealmID,
        last_checkpoint: u64,
    ) -> Result<(u64, BTreeMap<EntryID, u64>), RemoteError>;

    async fn block_create(
        &self,
        block_id: BlockID,
        realm_id: RealmID,
        ciphertext: Vec<u8>,
    ) -> Result<(), RemoteError>;

    async fn block_read(&self, block_id: BlockID) -> Result<Vec<u8>, RemoteError>;

    async fn realm_create(&self, self_role_certificate: Vec<u8>) -> Result<(), RemoteError>;

    async fn realm_update_roles(&self, role_certificate: Vec<u8>) -> Result<(), RemoteError>;

    async fn realm_get_role_certificates(
        &self,
        realm_id: RealmID,
    ) -> Result<Vec<Vec<u8>>, RemoteError>;

    async fn realm_start_reencryption_maintenance(
        &self,
        realm_id: RealmID,
        encryption_revision: u32,
    ) -> Result<(), RemoteError>;

    async fn realm_finish_reencryption_maintenance(
        &self,
        realm_id: RealmID,
        encryption_revision: u32,
    ) -> Result<(), RemoteError>;

    async fn maintenance_get_reencryption_batch(
        &self,
        realm_id: RealmID,
        encryption_revision: u32,
        size: u32,
    ) -> Result<Vec<ReencryptionBatchEntry>, RemoteError>;

    /// Returns `(done, total)` as reported by the server for this pass.
    async fn maintenance_save_reencryption_batch(
        &self,
        realm_id: RealmID,
        encryption_revision: u32,
        batch: Vec<ReencryptionBatchEntry>,
    ) -> Result<(u64, u64), RemoteError>;

    async fn message_get(&self, offset: u64) -> Result<Vec<MessageEntry>, RemoteError>;

    async fn message_send(
        &self,
        recipient: UserID,
        timestamp: DateTime<Utc>,
        body: Vec<u8>,
    ) -> Result<(), RemoteError>;

    /// Not in the spec's base RPC table but required to verify role
    /// certificates (spec §4.2 "fetched and cached from a Remote Devices
    /// Manager"): the directory endpoint returning a device's long-lived
    /// verify key.
    async fn get_device_verify_key(&self, device_id: &DeviceID) -> Result<VerifyingKey, RemoteError>;
}

/// `reqwest`-backed realm client.
#[derive(Clone)]
pub struct HttpRealmClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpRealmClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("parsec-remote/0.1")
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl RealmClient for HttpRealmClient {
    async fn vlob_create(
        &self,
        realm_id: RealmID,
        encryption_revision: u32,
        vlob_id: EntryID,
        timestamp: DateTime<Utc>,
        blob: Vec<u8>,
    ) -> Result<(), RemoteError> {
        let res = self
            .client
            .post(self.url("/vlob/create"))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "realm_id": realm_id,
                "encryption_revision": encryption_revision,
                "vlob_id": vlob_id,
                "timestamp": timestamp,
                "blob": base64::encode(&blob),
            }))
            .send()
            .await?;
        match res.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            StatusCode::CONFLICT => Err(RemoteError::AlreadyExists),
            StatusCode::LOCKED => Err(RemoteError::InMaintenance(realm_id.to_string())),
            other => Err(RemoteError::Transport(format!("vlob_create: {other}"))),
        }
    }

    async fn vlob_update(
        &self,
        encryption_revision: u32,
        vlob_id: EntryID,
        version: u64,
        timestamp: DateTime<Utc>,
        blob: Vec<u8>,
    ) -> Result<(), RemoteError> {
        let res = self
            .client
            .post(self.url("/vlob/update"))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "encryption_revision": encryption_revision,
                "vlob_id": vlob_id,
                "version": version,
                "timestamp": timestamp,
                "blob": base64::encode(&blob),
            }))
            .send()
            .await?;
        match res.status() {
            StatusCode::OK => Ok(()),
            StatusCode::CONFLICT => Err(RemoteError::BadVersion),
            StatusCode::LOCKED => Err(RemoteError::InMaintenance(vlob_id.to_string())),
            other => Err(RemoteError::Transport(format!("vlob_update: {other}"))),
        }
    }

    async fn vlob_read(
        &self,
        encryption_revision: u32,
        vlob_id: EntryID,
        version: Option<u64>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<VlobReadResponse, RemoteError> {
        let res = self
            .client
            .get(self.url(&format!("/vlob/{vlob_id}")))
            .bearer_auth(&self.token)
            .query(&[("encryption_revision", encryption_revision.to_string())])
            .query(&[("version", version.map(|v| v.to_string()).unwrap_or_default())])
            .query(&[(
                "timestamp",
                timestamp.map(|t| t.to_rfc3339()).unwrap_or_default(),
            )])
            .send()
            .await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound);
        }
        if !res.status().is_success() {
            return Err(RemoteError::Transport(format!("vlob_read: {}", res.status())));
        }
        let body: VlobReadBody = res
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        body.try_into()
    }

    async fn vlob_poll_changes(
        &self,
        realm_id: RealmID,
        last_checkpoint: u64,
    ) -> Result<(u64, BTreeMap<EntryID, u64>), RemoteError> {
        let res = self
            .client
            .get(self.url(&format!("/realm/{realm_id}/poll_changes")))
            .bearer_auth(&self.token)
            .query(&[("last_checkpoint", last_checkpoint.to_string())])
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(RemoteError::Transport(format!(
                "vlob_poll_changes: {}",
                res.status()
            )));
        }
        let body: PollChangesBody = res
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        Ok((body.current_checkpoint, body.changes))
    }

    async fn block_create(
        &self,
        block_id: BlockID,
        realm_id: RealmID,
        ciphertext: Vec<u8>,
    ) -> Result<(), RemoteError> {
        let res = self
            .client
            .post(self.url("/block/create"))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "block_id": block_id,
                "realm_id": realm_id,
                "ciphertext": base64::encode(&ciphertext),
            }))
            .send()
            .await?;
        match res.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            StatusCode::CONFLICT => Err(RemoteError::AlreadyExists),
            other => Err(RemoteError::Transport(format!("block_create: {other}"))),
        }
    }

    async fn block_read(&self, block_id: BlockID) -> Result<Vec<u8>, RemoteError> {
        let res = self
            .client
            .get(self.url(&format!("/block/{block_id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound);
        }
        if !res.status().is_success() {
            return Err(RemoteError::Transport(format!("block_read: {}", res.status())));
        }
        let body: BlockReadBody = res
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        base64::decode(&body.ciphertext).map_err(|e| RemoteError::Malformed(e.to_string()))
    }

    async fn realm_create(&self, self_role_certificate: Vec<u8>) -> Result<(), RemoteError> {
        let res = self
            .client
            .post(self.url("/realm/create"))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "certificate": base64::encode(&self_role_certificate) }))
            .send()
            .await?;
        match res.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::CONFLICT => Ok(()),
            other => Err(RemoteError::Transport(format!("realm_create: {other}"))),
        }
    }

    async fn realm_update_roles(&self, role_certificate: Vec<u8>) -> Result<(), RemoteError> {
        let res = self
            .client
            .post(self.url("/realm/update_roles"))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "certificate": base64::encode(&role_certificate) }))
            .send()
            .await?;
        match res.status() {
            StatusCode::OK => Ok(()),
            StatusCode::FORBIDDEN => Err(RemoteError::NoAccess),
            other => Err(RemoteError::Transport(format!("realm_update_roles: {other}"))),
        }
    }

    async fn realm_get_role_certificates(
        &self,
        realm_id: RealmID,
    ) -> Result<Vec<Vec<u8>>, RemoteError> {
        let res = self
            .client
            .get(self.url(&format!("/realm/{realm_id}/role_certificates")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(RemoteError::Transport(format!(
                "realm_get_role_certificates: {}",
                res.status()
            )));
        }
        let body: RoleCertificatesBody = res
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        body.certificates
            .into_iter()
            .map(|c| base64::decode(&c).map_err(|e| RemoteError::Malformed(e.to_string())))
            .collect()
    }

    async fn realm_start_reencryption_maintenance(
        &self,
        realm_id: RealmID,
        encryption_revision: u32,
    ) -> Result<(), RemoteError> {
        let res = self
            .client
            .post(self.url(&format!("/realm/{realm_id}/maintenance/start")))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "encryption_revision": encryption_revision }))
            .send()
            .await?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(RemoteError::Transport(format!(
                "realm_start_reencryption_maintenance: {}",
                res.status()
            )))
        }
    }

    async fn realm_finish_reencryption_maintenance(
        &self,
        realm_id: RealmID,
        encryption_revision: u32,
    ) -> Result<(), RemoteError> {
        let res = self
            .client
            .post(self.url(&format!("/realm/{realm_id}/maintenance/finish")))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "encryption_revision": encryption_revision }))
            .send()
            .await?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(RemoteError::Transport(format!(
                "realm_finish_reencryption_maintenance: {}",
                res.status()
            )))
        }
    }

    async fn maintenance_get_reencryption_batch(
        &self,
        realm_id: RealmID,
        encryption_revision: u32,
        size: u32,
    ) -> Result<Vec<ReencryptionBatchEntry>, RemoteError> {
        let res = self
            .client
            .get(self.url(&format!("/realm/{realm_id}/maintenance/batch")))
            .bearer_auth(&self.token)
            .query(&[
                ("encryption_revision", encryption_revision.to_string()),
                ("size", size.to_string()),
            ])
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(RemoteError::Transport(format!(
                "maintenance_get_reencryption_batch: {}",
                res.status()
            )));
        }
        let body: ReencryptionBatchBody = res
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        body.entries
            .into_iter()
            .map(|e| {
                Ok(ReencryptionBatchEntry {
                    vlob_id: e.vlob_id,
                    version: e.version,
                    blob: base64::decode(&e.blob).map_err(|err| RemoteError::Malformed(err.to_string()))?,
                })
            })
            .collect()
    }

    async fn maintenance_save_reencryption_batch(
        &self,
        realm_id: RealmID,
        encryption_revision: u32,
        batch: Vec<ReencryptionBatchEntry>,
    ) -> Result<(u64, u64), RemoteError> {
        let payload: Vec<_> = batch
            .into_iter()
            .map(|e| {
                serde_json::json!({
                    "vlob_id": e.vlob_id,
                    "version": e.version,
                    "blob": base64::encode(&e.blob),
                })
            })
            .collect();
        let res = self
            .client
            .post(self.url(&format!("/realm/{realm_id}/maintenance/batch")))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "encryption_revision": encryption_revision,
                "batch": payload,
            }))
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(RemoteError::Transport(format!(
                "maintenance_save_reencryption_batch: {}",
                res.status()
            )));
        }
        let body: BatchProgressBody = res
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        Ok((body.done, body.total))
    }

    async fn message_get(&self, offset: u64) -> Result<Vec<MessageEntry>, RemoteError> {
        let res = self
            .client
            .get(self.url("/message"))
            .bearer_auth(&self.token)
            .query(&[("offset", offset.to_string())])
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(RemoteError::Transport(format!("message_get: {}", res.status())));
        }
        let body: MessagesBody = res
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        body.messages
            .into_iter()
            .map(|m| {
                Ok(MessageEntry {
                    index: m.index,
                    sender: m.sender,
                    timestamp: m.timestamp,
                    body: base64::decode(&m.body).map_err(|e| RemoteError::Malformed(e.to_string()))?,
                })
            })
            .collect()
    }

    async fn message_send(
        &self,
        recipient: UserID,
        timestamp: DateTime<Utc>,
        body: Vec<u8>,
    ) -> Result<(), RemoteError> {
        let res = self
            .client
            .post(self.url("/message/send"))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "recipient": recipient,
                "timestamp": timestamp,
                "body": base64::encode(&body),
            }))
            .send()
            .await?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(RemoteError::Transport(format!("message_send: {}", res.status())))
        }
    }

    async fn get_device_verify_key(&self, device_id: &DeviceID) -> Result<VerifyingKey, RemoteError> {
        let res = self
            .client
            .get(self.url(&format!("/device/{device_id}/verify_key")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound);
        }
        if !res.status().is_success() {
            return Err(RemoteError::Transport(format!(
                "get_device_verify_key: {}",
                res.status()
            )));
        }
        let body: VerifyKeyBody = res
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        let bytes = base64::decode(&body.verify_key).map_err(|e| RemoteError::Malformed(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| RemoteError::Malformed("verify key must be 32 bytes".into()))?;
        VerifyingKey::from_bytes(&arr).map_err(|e| RemoteError::Malformed(e.to_string()))
    }
}

#[derive(serde::Deserialize)]
struct VlobReadBody {
    author: DeviceID,
    timestamp: DateTime<Utc>,
    version: u64,
    blob: String,
}

impl TryFrom<VlobReadBody> for VlobReadResponse {
    type Error = RemoteError;

    fn try_from(body: VlobReadBody) -> Result<Self, RemoteError> {
        Ok(VlobReadResponse {
            author: body.author,
            timestamp: body.timestamp,
            version: body.version,
            blob: base64::decode(&body.blob).map_err(|e| RemoteError::Malformed(e.to_string()))?,
        })
    }
}

#[derive(serde::Deserialize)]
struct PollChangesBody {
    current_checkpoint: u64,
    changes: BTreeMap<EntryID, u64>,
}

#[derive(serde::Deserialize)]
struct BlockReadBody {
    ciphertext: String,
}

#[derive(serde::Deserialize)]
struct RoleCertificatesBody {
    certificates: Vec<String>,
}

#[derive(serde::Deserialize)]
struct ReencryptionBatchBody {
    entries: Vec<ReencryptionBatchEntryBody>,
}

#[derive(serde::Deserialize)]
struct ReencryptionBatchEntryBody {
    vlob_id: EntryID,
    version: u64,
    blob: String,
}

#[derive(serde::Deserialize)]
struct BatchProgressBody {
    done: u64,
    total: u64,
}

#[derive(serde::Deserialize)]
struct MessagesBody {
    messages: Vec<MessageEntryBody>,
}

#[derive(serde::Deserialize)]
struct MessageEntryBody {
    index: u64,
    sender: DeviceID,
    timestamp: DateTime<Utc>,
    body: String,
}

#[derive(serde::Deserialize)]
struct VerifyKeyBody {
    verify_key: String,
}

mod base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    pub fn encode(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    pub fn decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(data)
    }
}
