//! Realm RPC client and the cryptographic verification boundary between
//! the untrusted server and the local data model.
//!
//! Nothing in `parsec-core` ever talks to the network directly; every byte
//! that crosses the wire passes through [`remote_loader::RemoteLoader`],
//! which owns decryption, signature verification, and role certificate
//! chain replay.

pub mod client;
pub mod device_manager;
pub mod errors;
pub mod remote_loader;

pub use client::{HttpRealmClient, MessageEntry, RealmClient, ReencryptionBatchEntry, VlobReadResponse};
pub use device_manager::RemoteDevicesManager;
pub use errors::RemoteError;
pub use remote_loader::{RemoteLoader, RoleCertificate, WorkspaceKeyProvider};
