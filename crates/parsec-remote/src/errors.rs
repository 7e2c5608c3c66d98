//! Transport-level errors (spec §4.2). These are mapped into `CoreError` at
//! the `RemoteLoader` boundary rather than leaking `reqwest`/HTTP detail
//! into `parsec-sync`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("backend offline: {0}")]
    Offline(String),

    #[error("realm {0} is in maintenance")]
    InMaintenance(String),

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("version conflict: server is ahead")]
    BadVersion,

    #[error("bad encryption revision: expected {expected}, server reports {actual}")]
    BadEncryptionRevision { expected: u32, actual: u32 },

    #[error("access denied")]
    NoAccess,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed server response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            RemoteError::Offline(err.to_string())
        } else {
            RemoteError::Transport(err.to_string())
        }
    }
}

impl From<RemoteError> for parsec_core::CoreError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Offline(reason) => parsec_core::CoreError::Offline(reason),
            RemoteError::InMaintenance(realm) => parsec_core::CoreError::InMaintenance(realm),
            RemoteError::NotFound => parsec_core::CoreError::RemoteManifestNotFound(String::new()),
            RemoteError::AlreadyExists => {
                parsec_core::CoreError::RemoteSyncConflict("already exists".into())
            }
            RemoteError::BadVersion => {
                parsec_core::CoreError::RemoteSyncConflict("bad version".into())
            }
            RemoteError::BadEncryptionRevision { expected, actual } => {
                parsec_core::CoreError::BadEncryptionRevision { expected, actual }
            }
            RemoteError::NoAccess => parsec_core::CoreError::NoAccess(String::new()),
            RemoteError::Transport(msg) | RemoteError::Malformed(msg) => {
                parsec_core::CoreError::Offline(msg)
            }
        }
    }
}
