//! Core error taxonomy (spec §7). Mirrors the teacher's split between leaf
//! `thiserror` enums (`BackupStoreError` in `backup_store.rs`) for each
//! subsystem and a handful of cross-cutting kinds the sync engine switches
//! on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    Kdf(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
    #[error("signature verification failed: {0}")]
    BadSignature(String),
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("schema validation failed: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum LocalStorageError {
    #[error("manifest not found locally for entry {0}")]
    MissingManifest(String),
    #[error("block not found locally for block {0}")]
    MissingBlock(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("(de)serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("cannot clear manifest for entry {0}: it still needs sync")]
    StillDirty(String),
}

/// The six error kinds the core exposes to its callers (spec §7). Each
/// variant documents the retry/propagation policy expected of callers.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The server is unreachable. Retried by monitors; surfaced to a
    /// mountpoint as EHOSTUNREACH/STATUS_HOST_UNREACHABLE.
    #[error("backend offline: {0}")]
    Offline(String),

    /// The realm is being reencrypted. Sync is retried; reads fall back to
    /// cached data.
    #[error("realm {0} is in maintenance")]
    InMaintenance(String),

    /// Role check failed. Surfaced as EACCES; the workspace entry is marked
    /// revoked on the next message processing pass.
    #[error("no access to realm {0}")]
    NoAccess(String),

    /// Sharing was attempted by a caller without OWNER/MANAGER.
    #[error("sharing not allowed: {0}")]
    SharingNotAllowed(String),

    /// Concurrency: resolved internally via re-fetch + merge, or by
    /// creating a conflict copy for files.
    #[error("remote sync conflict on entry {0}")]
    RemoteSyncConflict(String),

    /// The server indicates a maintenance boundary the client crossed.
    #[error("bad encryption revision: expected {expected}, server reports {actual}")]
    BadEncryptionRevision { expected: u32, actual: u32 },

    /// Signature, digest, or schema failure. Always fatal; never silently
    /// dropped; never auto-repaired.
    #[error("crypto/validation error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("local storage error: {0}")]
    LocalStorage(#[from] LocalStorageError),

    #[error("remote manifest not found for entry {0}")]
    RemoteManifestNotFound(String),

    #[error("remote block not found for block {0}")]
    RemoteBlockNotFound(String),

    #[error("entry already exists")]
    FileExists,

    #[error("entry not found")]
    FileNotFound,

    #[error("reshaping required before sync can proceed")]
    ReshapingRequired,

    #[error("file conflict: local and remote both diverged from base")]
    FileConflict,
}

pub type CoreResult<T> = Result<T, CoreError>;
