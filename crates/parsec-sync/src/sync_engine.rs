//! The sync engine (spec §4.6): one retry loop per entry id that drives a
//! local manifest to a synced state against the remote.
//!
//! Grounded in `RestoreEngine::restore_file`'s retry ladder: a bounded
//! number of attempts, an explicit outcome enum instead of exceptions for
//! control flow (spec §9 "Exception-for-control-flow" redesign flag), and
//! cancellation safety via "compute the new value, do IO, swap once."

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use parsec_core::ids::{DeviceID, EntryID};
use parsec_core::local_manifest::LocalManifest;
use parsec_core::manifest::RemoteManifest;
use parsec_core::{CoreEvent, EventBus, LocalStorage};
use parsec_remote::{RemoteError, RemoteLoader};

use crate::file_transactions::FileTransactions;

/// A single step's result. The caller (`sync_by_id`) decides what to do
/// next; `synchronization_step` never performs the corresponding action
/// itself, matching the "decide, then act" shape the retry ladder needs
/// for cancellation safety.
pub enum SyncStepOutcome {
    Done,
    UploadNeeded(RemoteManifest),
    ConflictDetected(LocalManifest, RemoteManifest),
    ReshapeNeeded,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncEngineError {
    #[error(transparent)]
    Core(#[from] parsec_core::error::CoreError),
    #[error(transparent)]
    LocalStorage(#[from] parsec_core::error::LocalStorageError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("entry kind disagrees with its remote counterpart")]
    KindMismatch,
    #[error("gave up syncing entry after {0} attempts")]
    TooManyAttempts(u32),
}

/// Bounds `sync_by_id`'s retry loop the same way `RestoreEngine` bounds
/// its restore attempts: a concurrent writer can keep winning the race
/// forever in theory, but in practice a handful of retries either
/// converges or signals a real problem upstream.
const MAX_SYNC_ATTEMPTS: u32 = 10;

pub struct SyncTransactions {
    storage: Arc<LocalStorage>,
    remote_loader: Arc<RemoteLoader>,
    file_transactions: FileTransactions,
    device_id: DeviceID,
    events: Arc<EventBus>,
}

impl SyncTransactions {
    pub fn new(
        storage: Arc<LocalStorage>,
        remote_loader: Arc<RemoteLoader>,
        device_id: DeviceID,
        events: Arc<EventBus>,
    ) -> Self {
        let file_transactions = FileTransactions::new(storage.clone(), events.clone());
        Self {
            storage,
            remote_loader,
            file_transactions,
            device_id,
            events,
        }
    }

    /// Decide, without side effects beyond an in-progress auto-merge, what
    /// the next action for `id` should be.
    pub async fn synchronization_step(&self, id: EntryID) -> Result<SyncStepOutcome, SyncEngineError> {
        let local = self.storage.manifests.get_manifest(id)?;
        if !local.need_sync() {
            return Ok(SyncStepOutcome::Done);
        }

        match &local {
            LocalManifest::File(m) => {
                if !m.is_reshaped() {
                    return Ok(SyncStepOutcome::ReshapeNeeded);
                }
                match self.remote_loader.load_manifest(id, None).await {
                    Ok(remote) => {
                        let RemoteManifest::File(rm) = &remote else {
                            return Err(SyncEngineError::KindMismatch);
                        };
                        if rm.version == m.base_version {
                            let candidate = m
                                .to_remote(m.base_version + 1)
                                .ok_or(parsec_core::error::CoreError::ReshapingRequired)?;
                            Ok(SyncStepOutcome::UploadNeeded(RemoteManifest::File(candidate)))
                        } else {
                            Ok(SyncStepOutcome::ConflictDetected(local.clone(), remote))
                        }
                    }
                    Err(RemoteError::NotFound) if m.is_placeholder => {
                        let candidate = m
                            .to_remote(1)
                            .ok_or(parsec_core::error::CoreError::ReshapingRequired)?;
                        Ok(SyncStepOutcome::UploadNeeded(RemoteManifest::File(candidate)))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            LocalManifest::Folder(_) | LocalManifest::Workspace(_) => {
                self.sync_children_manifest(id, &local).await
            }
            LocalManifest::User(_) => self.sync_user_manifest(id, &local).await,
        }
    }

    async fn sync_children_manifest(
        &self,
        id: EntryID,
        local: &LocalManifest,
    ) -> Result<SyncStepOutcome, SyncEngineError> {
        let base_version = local.base_version();
        match self.remote_loader.load_manifest(id, None).await {
            Ok(remote) => {
                if remote.version() == base_version {
                    Ok(SyncStepOutcome::UploadNeeded(to_remote_next(local, base_version + 1)?))
                } else {
                    let merged = self.merge_children_manifest(local, &remote)?;
                    self.storage.manifests.set_manifest(merged.clone())?;
                    Ok(SyncStepOutcome::UploadNeeded(to_remote_next(
                        &merged,
                        remote.version() + 1,
                    )?))
                }
            }
            Err(RemoteError::NotFound) if local.is_placeholder() => {
                Ok(SyncStepOutcome::UploadNeeded(to_remote_next(local, 1)?))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn merge_children_manifest(
        &self,
        local: &LocalManifest,
        remote: &RemoteManifest,
    ) -> Result<LocalManifest, SyncEngineError> {
        let base = self
            .storage
            .manifests
            .get_base_manifest(local.id())
            .unwrap_or_else(|_| local.clone());

        let (base_children, local_children) = match (&base, local) {
            (LocalManifest::Folder(b), LocalManifest::Folder(l)) => (b.children.clone(), l.children.clone()),
            (LocalManifest::Workspace(b), LocalManifest::Workspace(l)) => {
                (b.children.clone(), l.children.clone())
            }
            _ => (BTreeMap::new(), children_of(local)),
        };
        let remote_children = match remote {
            RemoteManifest::Folder(m) => m.children.clone(),
            RemoteManifest::Workspace(m) => m.children.clone(),
            _ => return Err(SyncEngineError::KindMismatch),
        };

        let (merged_children, collisions) =
            crate::merge::merge_children(&base_children, &local_children, &remote_children);

        let mut changes: BTreeMap<String, Option<EntryID>> = BTreeMap::new();
        for (name, id) in &merged_children {
            changes.insert(name.clone(), Some(*id));
        }
        for name in local_children.keys() {
            if !merged_children.contains_key(name) {
                changes.insert(name.clone(), None);
            }
        }
        // Same-name divergence: `merge_children` kept one side under the
        // original name and reported the other as a collision (merge.rs
        // "the caller renames `loser` to a 'conflicting copy' name and
        // re-inserts it"); do that here so the loser is never silently
        // dropped (spec §4.6/§8 "concurrent same-name creation").
        for collision in &collisions {
            let conflict_name = format!(
                "{} (conflicting copy by {} on {})",
                collision.name,
                self.device_id,
                Utc::now().to_rfc3339()
            );
            changes.insert(conflict_name, Some(collision.loser));
        }

        Ok(match local {
            LocalManifest::Folder(m) => LocalManifest::Folder(m.evolve_children(changes)),
            LocalManifest::Workspace(m) => LocalManifest::Workspace(m.evolve_children(changes)),
            other => other.clone(),
        })
    }

    async fn sync_user_manifest(
        &self,
        id: EntryID,
        local: &LocalManifest,
    ) -> Result<SyncStepOutcome, SyncEngineError> {
        let LocalManifest::User(l) = local else {
            return Err(SyncEngineError::KindMismatch);
        };
        match self.remote_loader.load_manifest(id, None).await {
            Ok(remote) => {
                let RemoteManifest::User(rm) = &remote else {
                    return Err(SyncEngineError::KindMismatch);
                };
                if rm.version == l.base_version {
                    Ok(SyncStepOutcome::UploadNeeded(RemoteManifest::User(
                        l.to_remote(l.base_version + 1),
                    )))
                } else {
                    let base = self.storage.manifests.get_base_manifest(id).ok();
                    let base_workspaces = match &base {
                        Some(LocalManifest::User(b)) => b.workspaces.clone(),
                        _ => Vec::new(),
                    };
                    let merged = crate::merge::merge_workspaces(&base_workspaces, &l.workspaces, &rm.workspaces);
                    let mut updated = l.clone();
                    updated.workspaces = merged;
                    updated.need_sync = true;
                    updated.updated = Utc::now();
                    let merged_manifest = LocalManifest::User(updated.clone());
                    self.storage.manifests.set_manifest(merged_manifest)?;
                    Ok(SyncStepOutcome::UploadNeeded(RemoteManifest::User(
                        updated.to_remote(rm.version + 1),
                    )))
                }
            }
            Err(RemoteError::NotFound) if l.is_placeholder => {
                Ok(SyncStepOutcome::UploadNeeded(RemoteManifest::User(l.to_remote(1))))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn upload_dirty_blocks(&self, candidate: &RemoteManifest) -> Result<(), SyncEngineError> {
        let RemoteManifest::File(fm) = candidate else {
            return Ok(());
        };
        for access in &fm.blocks {
            if self.storage.blocks.is_dirty_block(access.id) {
                let bytes = self.storage.blocks.get_block(access.id)?;
                self.remote_loader.upload_block(access, &bytes).await?;
                self.storage.blocks.mark_block_clean(access.id);
            }
        }
        Ok(())
    }

    /// Create a sibling "conflicting copy" for a file whose remote content
    /// diverged from local edits (spec §8 scenario 3), adopt the remote
    /// version as truth for `id`, and leave both entries `need_sync` so
    /// the next pass uploads the copy too.
    fn handle_file_conflict(
        &self,
        id: EntryID,
        local: parsec_core::local_manifest::LocalFileManifest,
        remote: parsec_core::manifest::FileManifest,
    ) -> Result<(), SyncEngineError> {
        let adopted = parsec_core::local_manifest::LocalFileManifest::from_remote(&remote, self.device_id.clone());
        let parent = adopted.parent;
        self.storage.manifests.set_manifest(LocalManifest::File(adopted))?;

        let mut copy = local;
        let new_id = EntryID::new();
        copy.id = new_id;
        copy.base_version = 0;
        copy.is_placeholder = true;
        copy.need_sync = true;
        self.storage.manifests.set_manifest(LocalManifest::File(copy))?;

        let parent_manifest = self.storage.manifests.get_manifest(parent)?;
        let children = children_of(&parent_manifest);
        let original_name = children
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(k, _)| k.clone())
            .unwrap_or_else(|| id.to_string());
        let conflict_name = format!(
            "{original_name} (conflicting copy by {} on {})",
            self.device_id,
            Utc::now().to_rfc3339()
        );
        let mut changes = BTreeMap::new();
        changes.insert(conflict_name, Some(new_id));
        let updated_parent = match &parent_manifest {
            LocalManifest::Folder(m) => LocalManifest::Folder(m.evolve_children(changes)),
            LocalManifest::Workspace(m) => LocalManifest::Workspace(m.evolve_children(changes)),
            _ => return Err(SyncEngineError::KindMismatch),
        };
        self.storage.manifests.set_manifest(updated_parent)?;
        self.events.publish(CoreEvent::FsEntryUpdated { id: parent });
        Ok(())
    }

    fn finalize_after_upload(&self, candidate: &RemoteManifest) -> Result<(), SyncEngineError> {
        let local = LocalManifest::from_remote_manifest(candidate, self.device_id.clone());
        self.storage.manifests.set_manifest(local)?;
        Ok(())
    }

    /// Drive `id` to a fully synced state, reshaping, uploading, merging
    /// or creating conflict copies as each step demands, up to
    /// [`MAX_SYNC_ATTEMPTS`] attempts.
    pub async fn sync_by_id(&self, id: EntryID) -> Result<(), SyncEngineError> {
        for _ in 0..MAX_SYNC_ATTEMPTS {
            match self.synchronization_step(id).await? {
                SyncStepOutcome::Done => return Ok(()),
                SyncStepOutcome::ReshapeNeeded => {
                    self.file_transactions.reshape(id).await?;
                }
                SyncStepOutcome::UploadNeeded(candidate) => {
                    self.upload_dirty_blocks(&candidate).await?;
                    match self.remote_loader.upload_manifest(id, &candidate).await {
                        Ok(()) => {
                            self.finalize_after_upload(&candidate)?;
                            self.events.publish(CoreEvent::FsEntrySynced { id });
                        }
                        Err(RemoteError::AlreadyExists) | Err(RemoteError::BadVersion) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                SyncStepOutcome::ConflictDetected(local, remote) => {
                    if let (LocalManifest::File(l), RemoteManifest::File(r)) = (local, remote) {
                        self.handle_file_conflict(id, l, r)?;
                    }
                }
            }
        }
        Err(SyncEngineError::TooManyAttempts(MAX_SYNC_ATTEMPTS))
    }
}

fn children_of(manifest: &LocalManifest) -> BTreeMap<String, EntryID> {
    match manifest {
        LocalManifest::Folder(m) => m.children.clone(),
        LocalManifest::Workspace(m) => m.children.clone(),
        _ => BTreeMap::new(),
    }
}

fn to_remote_next(local: &LocalManifest, version: u64) -> Result<RemoteManifest, SyncEngineError> {
    Ok(match local {
        LocalManifest::Folder(m) => RemoteManifest::Folder(m.to_remote(version)),
        LocalManifest::Workspace(m) => RemoteManifest::Workspace(m.to_remote(version)),
        LocalManifest::User(m) => RemoteManifest::User(m.to_remote(version)),
        LocalManifest::File(_) => return Err(SyncEngineError::KindMismatch),
    })
}
