//! File transactions (spec §4.5): reading and writing a file's byte
//! range through its slot-indexed chunk list, and the reshape step that
//! collapses a slot back into a single uploadable block.
//!
//! Every written byte range becomes one fresh [`Chunk`] spliced into its
//! slot; overlapping existing chunks are clipped rather than discarded,
//! preserving the spec §3 coverage invariant (`slot_chunks_cover_exactly`)
//! after every operation.

use std::sync::Arc;

use parsec_core::chunk::{slot_chunks_cover_exactly, Chunk};
use parsec_core::error::{CoreError, CoreResult};
use parsec_core::ids::EntryID;
use parsec_core::local_manifest::{LocalFileManifest, LocalManifest};
use parsec_core::{CoreEvent, EventBus, LocalStorage};

pub struct FileTransactions {
    storage: Arc<LocalStorage>,
    events: Arc<EventBus>,
}

impl FileTransactions {
    pub fn new(storage: Arc<LocalStorage>, events: Arc<EventBus>) -> Self {
        Self { storage, events }
    }

    fn load(&self, id: EntryID) -> CoreResult<LocalFileManifest> {
        match self.storage.manifests.get_manifest(id)? {
            LocalManifest::File(m) => Ok(m),
            _ => Err(CoreError::FileNotFound),
        }
    }

    fn chunk_bytes(&self, chunk: &Chunk) -> CoreResult<Vec<u8>> {
        let raw = if chunk.is_block() {
            let access = chunk.get_block_access().unwrap();
            self.storage.blocks.get_block(access.id)?
        } else {
            self.storage.blocks.get_chunk(chunk.id)?
        };
        let start = (chunk.start - chunk.raw_offset) as usize;
        let stop = (chunk.stop - chunk.raw_offset) as usize;
        Ok(raw[start..stop].to_vec())
    }

    pub async fn fd_read(&self, id: EntryID, offset: u64, size: u64) -> CoreResult<Vec<u8>> {
        let _guard = self.storage.lock_entry(id).await;
        let manifest = self.load(id)?;
        let stop = (offset + size).min(manifest.size);
        if offset >= stop {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity((stop - offset) as usize);
        let first_slot = offset / manifest.blocksize;
        let last_slot = (stop - 1) / manifest.blocksize;
        for slot in first_slot..=last_slot {
            let (slot_start, slot_stop) = manifest.slot_bounds(slot);
            let mut chunks: Vec<&Chunk> = manifest.blocks[slot as usize].iter().collect();
            chunks.sort_by_key(|c| c.start);
            for chunk in chunks {
                let window_start = chunk.start.max(offset).max(slot_start);
                let window_stop = chunk.stop.min(stop).min(slot_stop);
                if window_start >= window_stop {
                    continue;
                }
                let bytes = self.chunk_bytes(chunk)?;
                let rel_start = (window_start - chunk.start) as usize;
                let rel_stop = (window_stop - chunk.start) as usize;
                out.extend_from_slice(&bytes[rel_start..rel_stop]);
            }
        }
        Ok(out)
    }

    /// Write `data` at `offset`, growing the file and zero-filling any gap
    /// between the old end of file and `offset` (spec §4.5 "sparse
    /// extension"). Every affected slot keeps its coverage invariant.
    pub async fn fd_write(&self, id: EntryID, offset: u64, data: &[u8]) -> CoreResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let _guard = self.storage.lock_entry(id).await;
        let mut manifest = self.load(id)?;
        let write_stop = offset + data.len() as u64;
        let new_size = manifest.size.max(write_stop);
        self.ensure_slot_capacity(&mut manifest, new_size)?;
        manifest.size = new_size;

        let blocksize = manifest.blocksize;
        let first_slot = offset / blocksize;
        let last_slot = (write_stop.max(offset + 1) - 1) / blocksize;
        for slot in first_slot..=last_slot {
            let (slot_start, slot_stop) = manifest.slot_bounds(slot);
            let window_start = offset.max(slot_start);
            let window_stop = write_stop.min(slot_stop);
            let data_start = (window_start - offset) as usize;
            let data_stop = (window_stop - offset) as usize;
            let new_chunk = Chunk::new(window_start, window_stop);
            self.storage
                .blocks
                .set_chunk(new_chunk.id, &data[data_start..data_stop])?;
            let existing = std::mem::take(&mut manifest.blocks[slot as usize]);
            manifest.blocks[slot as usize] = splice_slot(existing, new_chunk);
            debug_assert!(slot_chunks_cover_exactly(
                &manifest.blocks[slot as usize],
                slot_start,
                slot_stop
            ));
        }

        manifest.need_sync = true;
        manifest.updated = chrono::Utc::now();
        self.storage.manifests.set_manifest(LocalManifest::File(manifest))?;
        self.events.publish(CoreEvent::FsEntryUpdated { id });
        Ok(())
    }

    pub async fn fd_resize(&self, id: EntryID, new_size: u64) -> CoreResult<()> {
        let _guard = self.storage.lock_entry(id).await;
        let mut manifest = self.load(id)?;
        if new_size == manifest.size {
            return Ok(());
        }
        if new_size > manifest.size {
            self.ensure_slot_capacity(&mut manifest, new_size)?;
        } else {
            truncate_slots(&mut manifest, new_size)?;
        }
        manifest.size = new_size;
        manifest.need_sync = true;
        manifest.updated = chrono::Utc::now();
        self.storage.manifests.set_manifest(LocalManifest::File(manifest))?;
        self.events.publish(CoreEvent::FsEntryUpdated { id });
        Ok(())
    }

    /// Grow `manifest.blocks` to cover `target_size`, zero-filling any new
    /// slot and the newly-exposed tail of the current last slot.
    fn ensure_slot_capacity(&self, manifest: &mut LocalFileManifest, target_size: u64) -> CoreResult<()> {
        if target_size <= manifest.size {
            return Ok(());
        }
        let blocksize = manifest.blocksize;
        let old_size = manifest.size;
        let old_slot_count = if old_size == 0 { 0 } else { (old_size + blocksize - 1) / blocksize };
        let new_slot_count = (target_size + blocksize - 1) / blocksize;

        // Extend the old last slot's tail with zeros up to its new bound.
        if old_slot_count > 0 {
            let last = old_slot_count - 1;
            let old_slot_stop = old_size.min((last + 1) * blocksize);
            let new_slot_stop = target_size.min((last + 1) * blocksize);
            if new_slot_stop > old_slot_stop {
                let zero_chunk = zero_chunk(&self.storage, old_slot_stop, new_slot_stop)?;
                let existing = std::mem::take(&mut manifest.blocks[last as usize]);
                manifest.blocks[last as usize] = splice_slot(existing, zero_chunk);
            }
        }

        for slot in old_slot_count..new_slot_count {
            let (start, stop) = (slot * blocksize, ((slot + 1) * blocksize).min(target_size));
            let zero = zero_chunk(&self.storage, start, stop)?;
            manifest.blocks.push(vec![zero]);
        }
        Ok(())
    }

    /// Collapse every non-reshaped slot into a single full-slot block
    /// chunk (spec §4.5 "Reshape"), required before `to_remote` can
    /// succeed. Materialized bytes are staged as a dirty block; the sync
    /// engine uploads them and marks the block clean.
    pub async fn reshape(&self, id: EntryID) -> CoreResult<()> {
        let _guard = self.storage.lock_entry(id).await;
        let mut manifest = self.load(id)?;
        for slot in 0..manifest.blocks.len() as u64 {
            if manifest.blocks[slot as usize].len() == 1 && manifest.blocks[slot as usize][0].is_block() {
                continue;
            }
            let (start, stop) = manifest.slot_bounds(slot);
            let mut bytes = Vec::with_capacity((stop - start) as usize);
            let mut chunks: Vec<Chunk> = manifest.blocks[slot as usize].clone();
            chunks.sort_by_key(|c| c.start);
            for chunk in &chunks {
                bytes.extend_from_slice(&self.chunk_bytes(chunk)?);
            }
            let block_chunk = Chunk::new(start, stop)
                .evolve_as_block(&bytes)
                .map_err(|_| CoreError::ReshapingRequired)?;
            let access = block_chunk.get_block_access().unwrap();
            self.storage.blocks.set_dirty_block(access.id, &bytes)?;
            for chunk in &chunks {
                if !chunk.is_block() {
                    self.storage.blocks.clear_chunk(chunk.id)?;
                }
            }
            manifest.blocks[slot as usize] = vec![block_chunk];
        }
        self.storage.manifests.set_manifest(LocalManifest::File(manifest))?;
        Ok(())
    }
}

fn zero_chunk(storage: &LocalStorage, start: u64, stop: u64) -> CoreResult<Chunk> {
    let chunk = Chunk::new(start, stop);
    storage.blocks.set_chunk(chunk.id, &vec![0u8; (stop - start) as usize])?;
    Ok(chunk)
}

/// Splice `new_chunk` into a slot's existing chunk list, clipping any
/// chunk it overlaps (possibly into a left and/or right remainder) and
/// leaving untouched chunks alone. The result stays sorted by `start`.
fn splice_slot(existing: Vec<Chunk>, new_chunk: Chunk) -> Vec<Chunk> {
    let mut result = Vec::with_capacity(existing.len() + 1);
    for chunk in existing {
        if chunk.stop <= new_chunk.start || chunk.start >= new_chunk.stop {
            result.push(chunk);
            continue;
        }
        if chunk.start < new_chunk.start {
            result.push(chunk.evolve(chunk.start, new_chunk.start));
        }
        if chunk.stop > new_chunk.stop {
            result.push(chunk.evolve(new_chunk.stop, chunk.stop));
        }
    }
    result.push(new_chunk);
    result.sort_by_key(|c| c.start);
    result
}

fn truncate_slots(manifest: &mut LocalFileManifest, new_size: u64) -> CoreResult<()> {
    let blocksize = manifest.blocksize;
    let new_slot_count = if new_size == 0 { 0 } else { (new_size + blocksize - 1) / blocksize };
    manifest.blocks.truncate(new_slot_count as usize);
    if let Some(last) = manifest.blocks.last_mut() {
        let last_idx = manifest.blocks.len() as u64 - 1;
        let new_stop = new_size.min((last_idx + 1) * blocksize);
        let retained: Vec<Chunk> = last
            .iter()
            .filter(|c| c.start < new_stop)
            .map(|c| {
                if c.stop > new_stop {
                    c.evolve(c.start, new_stop)
                } else {
                    c.clone()
                }
            })
            .collect();
        *last = retained;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parsec_core::config::CoreConfig;
    use parsec_core::ids::DeviceID;
    use parsec_core::local_manifest::LocalFileManifest as Manifest;
    use tempfile::tempdir;

    fn device() -> DeviceID {
        DeviceID::new("alice", "laptop")
    }

    async fn fixture(blocksize: u64) -> (FileTransactions, EntryID, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(LocalStorage::open(dir.path(), &CoreConfig::default()).unwrap());
        let id = EntryID::new();
        let manifest = Manifest::new_placeholder(id, EntryID::new(), device(), blocksize);
        storage.manifests.set_manifest(LocalManifest::File(manifest)).unwrap();
        let events = Arc::new(EventBus::new(16));
        (FileTransactions::new(storage, events), id, dir)
    }

    #[tokio::test]
    async fn write_then_read_back_roundtrips() {
        let (txn, id, _dir) = fixture(16).await;
        txn.fd_write(id, 0, b"hello world").await.unwrap();
        let read = txn.fd_read(id, 0, 11).await.unwrap();
        assert_eq!(read, b"hello world");
    }

    #[tokio::test]
    async fn write_past_end_zero_fills_gap() {
        let (txn, id, _dir) = fixture(4).await;
        txn.fd_write(id, 8, b"xy").await.unwrap();
        let read = txn.fd_read(id, 0, 10).await.unwrap();
        assert_eq!(read, vec![0, 0, 0, 0, 0, 0, 0, 0, b'x', b'y']);
    }

    #[tokio::test]
    async fn overlapping_write_updates_only_its_window() {
        let (txn, id, _dir) = fixture(16).await;
        txn.fd_write(id, 0, b"aaaaaaaaaa").await.unwrap();
        txn.fd_write(id, 2, b"bb").await.unwrap();
        let read = txn.fd_read(id, 0, 10).await.unwrap();
        assert_eq!(&read, b"aabbaaaaaa");
    }

    #[tokio::test]
    async fn resize_down_then_up_preserves_prefix_and_zero_fills() {
        let (txn, id, _dir) = fixture(8).await;
        txn.fd_write(id, 0, b"abcdefgh").await.unwrap();
        txn.fd_resize(id, 4).await.unwrap();
        txn.fd_resize(id, 6).await.unwrap();
        let read = txn.fd_read(id, 0, 6).await.unwrap();
        assert_eq!(&read, b"abcd\0\0");
    }

    #[tokio::test]
    async fn reshape_collapses_slot_to_single_block_chunk() {
        let (txn, id, _dir) = fixture(16).await;
        txn.fd_write(id, 0, b"aaaaaaaa").await.unwrap();
        txn.fd_write(id, 4, b"bbbb").await.unwrap();
        txn.reshape(id).await.unwrap();
        let manifest = txn.load(id).unwrap();
        assert!(manifest.is_reshaped());
        let read = txn.fd_read(id, 0, 8).await.unwrap();
        assert_eq!(&read, b"aaaabbbb");
    }
}
