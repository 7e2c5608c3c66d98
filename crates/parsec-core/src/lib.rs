//! Core data model, cryptography and local storage for the synchronization
//! client: identifiers, manifests (remote and local), the chunk/block
//! algebra, the signed-envelope codec, the on-disk device file, and the
//! local manifest/block stores with their locking discipline.
//!
//! Everything in this crate is local-only: no network I/O. The realm RPC
//! client and remote loader live in `parsec-remote`; the user/workspace
//! filesystem and sync engine live in `parsec-sync`.

pub mod chunk;
pub mod config;
pub mod crypto;
pub mod device;
pub mod envelope;
pub mod error;
pub mod event_bus;
pub mod ids;
pub mod local_manifest;
pub mod local_storage;
pub mod manifest;
pub mod paths;
pub mod workspace_entry;

pub use config::CoreConfig;
pub use error::{CoreError, CoreResult, CryptoError, LocalStorageError};
pub use event_bus::{CoreEvent, EventBus, EventSubscription};
pub use local_storage::LocalStorage;
