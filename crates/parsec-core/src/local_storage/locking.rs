//! Per-entry locking (spec §4.1 "Locking").
//!
//! Generalizes `RestoreEngine`'s per-path `Mutex<HashMap<String,
//! Arc<Mutex<()>>>>` pattern to per-`EntryID` locks. Multi-entry
//! transactions (e.g. moving an entry between two folders) must acquire
//! locks in ascending `EntryID` order to avoid deadlocking against a
//! concurrent transaction that touches the same two entries.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::ids::EntryID;

#[derive(Default)]
pub struct EntryLocks {
    locks: Mutex<HashMap<EntryID, Arc<AsyncMutex<()>>>>,
}

pub struct EntryLockGuard {
    _guard: OwnedMutexGuard<()>,
}

impl EntryLocks {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn entry_mutex(&self, id: EntryID) -> Arc<AsyncMutex<()>> {
        let mut locks: MutexGuard<_> = self.locks.lock();
        locks
            .entry(id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn lock(&self, id: EntryID) -> EntryLockGuard {
        let mutex = self.entry_mutex(id);
        let guard = mutex.lock_owned().await;
        EntryLockGuard { _guard: guard }
    }

    /// Lock several entries at once, always in ascending id order, so two
    /// transactions racing over the same pair never deadlock against each
    /// other.
    pub async fn lock_many(&self, ids: &[EntryID]) -> Vec<EntryLockGuard> {
        let mut sorted = ids.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for id in sorted {
            guards.push(self.lock(id).await);
        }
        guards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn lock_serializes_access_to_same_entry() {
        let locks = Arc::new(EntryLocks::new());
        let id = EntryID::new();
        let counter = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(id).await;
                let before = counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                assert_eq!(counter.load(Ordering::SeqCst), before + 1);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn lock_many_orders_ascending_and_dedups() {
        let locks = EntryLocks::new();
        let a = EntryID::new();
        let b = EntryID::new();
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let guards = locks.lock_many(&[hi, lo, lo]).await;
        assert_eq!(guards.len(), 2);
    }
}
