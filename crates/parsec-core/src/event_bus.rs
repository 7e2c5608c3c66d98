//! Local event taxonomy and bus (spec §6 "Event taxonomy", §4.8, §9
//! "break the cycle by making local storage publish events through a bus
//! handle passed in at construction").
//!
//! A thin wrapper over `tokio::sync::broadcast`, the same primitive the
//! teacher uses for `FileChange`/`TamperEvent` fan-out in
//! `integrity::watcher`/`integrity::pipeline`. Bounded per-subscriber
//! queues; a lagging subscriber logs a warning and resumes from the next
//! available event rather than blocking the publisher (spec §5 "Shared
//! resources").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::ids::{EntryID, RealmID};
use crate::workspace_entry::WorkspaceEntry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoreEvent {
    FsEntryUpdated {
        id: EntryID,
    },
    FsEntrySynced {
        id: EntryID,
    },
    FsWorkspaceCreated {
        entry: WorkspaceEntry,
    },
    SharingGranted {
        new_entry: WorkspaceEntry,
    },
    SharingRevoked {
        new_entry: WorkspaceEntry,
        previous_entry: Option<WorkspaceEntry>,
    },
    SharingUpdated {
        new_entry: WorkspaceEntry,
        previous_entry: Option<WorkspaceEntry>,
    },
    Pinged {
        origin: String,
    },
    BackendConnectionReady,
    BackendConnectionLost,
    BackendConnectionRefused,
    BackendConnectionCrashed {
        reason: String,
    },
    BackendRealmVlobsUpdated {
        realm_id: RealmID,
        checkpoint: u64,
        src_id: EntryID,
        src_version: u64,
    },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<(DateTime<Utc>, CoreEvent)>,
}

impl EventBus {
    pub fn new(queue_size: usize) -> Self {
        let (sender, _) = broadcast::channel(queue_size);
        Self { sender }
    }

    pub fn publish(&self, event: CoreEvent) {
        // Append-only from the publisher's side; a send error only means
        // there are currently no subscribers, which is not a failure.
        let _ = self.sender.send((Utc::now(), event));
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
        }
    }
}

pub struct EventSubscription {
    receiver: broadcast::Receiver<(DateTime<Utc>, CoreEvent)>,
}

impl EventSubscription {
    /// Await the next event, transparently resuming past a lag instead of
    /// returning an error to the caller — slow subscribers drop the oldest
    /// events and a warning is logged (spec §5).
    pub async fn recv(&mut self) -> Option<(DateTime<Utc>, CoreEvent)> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event bus subscriber lagged, dropping oldest events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
