//! User FS, Workspace FS (entry/file/sync transactions), realm role and
//! reencryption management, and the long-lived monitors that drive the
//! client sync core end to end (spec §4.3-§4.8).
//!
//! Nothing here talks to the wire directly: every remote call goes through
//! a [`parsec_remote::RemoteLoader`]; every persisted byte goes through a
//! [`parsec_core::LocalStorage`].

pub mod entry_transactions;
pub mod file_transactions;
pub mod fs_path;
pub mod merge;
pub mod monitors;
pub mod realm;
pub mod sync_engine;
pub mod user_fs;
pub mod workspace_fs;

pub use fs_path::FsPath;
pub use realm::ReencryptionDriver;
pub use sync_engine::{SyncEngineError, SyncStepOutcome, SyncTransactions};
pub use user_fs::UserFS;
pub use workspace_fs::WorkspaceFS;
