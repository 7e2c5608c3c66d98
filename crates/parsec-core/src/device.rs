//! The on-disk device file: one per device, password-unlocked, holding the
//! device's signing key, user private key, user manifest id/key and local
//! symmetric key (spec §6 "On-disk layout").
//!
//! Grounded directly in the teacher's `vault.rs`: a magic+version header
//! (plaintext, needed to pick KDF parameters before the key is known),
//! Argon2id key derivation, an `XChaCha20Poly1305`-encrypted JSON payload.

use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

use crate::crypto::{self, SecretKey};
use crate::error::CryptoError;
use crate::ids::{DeviceID, DeviceName, EntryID, UserID};

pub const DEVICE_FILE_MAGIC: &[u8] = b"PARSEC01";
pub const DEVICE_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct DeviceHeader {
    pub version: u32,
    pub salt: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DevicePayload {
    created_at: DateTime<Utc>,
    user_id: String,
    device_name: String,
    signing_key: Vec<u8>,
    user_private_key: Vec<u8>,
    user_manifest_id: EntryID,
    user_manifest_key: SecretKey,
    local_symmetric_key: SecretKey,
    organization_id: String,
}

/// An unlocked device file. `key` (the password-derived at-rest key) is
/// zeroized on drop.
pub struct DeviceFile {
    header: DeviceHeader,
    payload: DevicePayload,
    path: PathBuf,
    key: Zeroizing<[u8; 32]>,
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceFileError {
    #[error("device file already exists at {0}")]
    AlreadyExists(PathBuf),
    #[error("device file header is malformed")]
    BadHeader,
    #[error("unsupported device file version {0}")]
    UnsupportedVersion(u32),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

const HEADER_LEN: usize = 8 + 4 + 32; // magic + version + salt

impl DeviceFile {
    pub fn create_new(
        path: impl AsRef<Path>,
        password: &str,
        user_id: &str,
        device_name: &str,
        organization_id: &str,
    ) -> Result<Self, DeviceFileError> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Err(DeviceFileError::AlreadyExists(path));
        }
        let salt = crypto::generate_salt();
        let key = crypto::derive_key_from_password(password, &salt)?;

        let signing_key = crypto::generate_signing_key();
        let payload = DevicePayload {
            created_at: Utc::now(),
            user_id: user_id.to_string(),
            device_name: device_name.to_string(),
            signing_key: signing_key.to_bytes().to_vec(),
            user_private_key: crypto::generate_signing_key().to_bytes().to_vec(),
            user_manifest_id: EntryID::new(),
            user_manifest_key: SecretKey::generate(),
            local_symmetric_key: SecretKey::generate(),
            organization_id: organization_id.to_string(),
        };

        let device = Self {
            header: DeviceHeader {
                version: DEVICE_FILE_VERSION,
                salt,
            },
            payload,
            path,
            key: Zeroizing::new(*key.as_bytes()),
        };
        device.persist()?;
        Ok(device)
    }

    pub fn open(path: impl AsRef<Path>, password: &str) -> Result<Self, DeviceFileError> {
        let path = path.as_ref().to_path_buf();
        let raw = fs::read(&path)?;
        if raw.len() < HEADER_LEN {
            return Err(DeviceFileError::BadHeader);
        }
        let (header_bytes, rest) = raw.split_at(HEADER_LEN);
        if &header_bytes[0..8] != DEVICE_FILE_MAGIC {
            return Err(DeviceFileError::BadHeader);
        }
        let version = u32::from_le_bytes(header_bytes[8..12].try_into().unwrap());
        if version != DEVICE_FILE_VERSION {
            return Err(DeviceFileError::UnsupportedVersion(version));
        }
        let mut salt = [0u8; 32];
        salt.copy_from_slice(&header_bytes[12..44]);

        let key = crypto::derive_key_from_password(password, &salt)?;
        let decrypted = crypto::decrypt(&key, rest)?;
        let payload: DevicePayload = serde_json::from_slice(&decrypted)?;

        Ok(Self {
            header: DeviceHeader { version, salt },
            payload,
            path,
            key: Zeroizing::new(*key.as_bytes()),
        })
    }

    fn persist(&self) -> Result<(), DeviceFileError> {
        let mut out = Vec::new();
        out.extend_from_slice(DEVICE_FILE_MAGIC);
        out.extend_from_slice(&self.header.version.to_le_bytes());
        out.extend_from_slice(&self.header.salt);

        let serialized = serde_json::to_vec(&self.payload)?;
        let key = SecretKey::from_bytes(*self.key);
        let encrypted = crypto::encrypt(&key, &serialized);
        out.extend_from_slice(&encrypted);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, out)?;
        Ok(())
    }

    pub fn device_id(&self) -> DeviceID {
        DeviceID {
            user_id: UserID(self.payload.user_id.clone()),
            device_name: DeviceName(self.payload.device_name.clone()),
        }
    }

    pub fn signing_key(&self) -> SigningKey {
        let bytes: [u8; 32] = self.payload.signing_key.as_slice().try_into().unwrap();
        SigningKey::from_bytes(&bytes)
    }

    pub fn verify_key(&self) -> VerifyingKey {
        self.signing_key().verifying_key()
    }

    pub fn user_manifest_id(&self) -> EntryID {
        self.payload.user_manifest_id
    }

    pub fn user_manifest_key(&self) -> &SecretKey {
        &self.payload.user_manifest_key
    }

    pub fn local_symmetric_key(&self) -> &SecretKey {
        &self.payload.local_symmetric_key
    }

    pub fn organization_id(&self) -> &str {
        &self.payload.organization_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_open_roundtrips_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device.dat");
        let created =
            DeviceFile::create_new(&path, "hunter2", "alice", "laptop", "org1").unwrap();
        let device_id = created.device_id();
        let manifest_id = created.user_manifest_id();
        drop(created);

        let opened = DeviceFile::open(&path, "hunter2").unwrap();
        assert_eq!(opened.device_id(), device_id);
        assert_eq!(opened.user_manifest_id(), manifest_id);
    }

    #[test]
    fn open_with_wrong_password_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device.dat");
        DeviceFile::create_new(&path, "hunter2", "alice", "laptop", "org1").unwrap();
        assert!(DeviceFile::open(&path, "wrong-password").is_err());
    }

    #[test]
    fn create_new_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device.dat");
        DeviceFile::create_new(&path, "hunter2", "alice", "laptop", "org1").unwrap();
        assert!(DeviceFile::create_new(&path, "hunter2", "alice", "laptop", "org1").is_err());
    }
}
