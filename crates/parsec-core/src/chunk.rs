//! `BlockAccess` and `Chunk` — the local file address-space algebra (spec
//! §3 "Chunk", grounded in `original_source/parsec/core/types/access.py`).

use serde::{Deserialize, Serialize};

use crate::crypto::{HashDigest, SecretKey};
use crate::ids::{BlockID, ChunkID};

/// Reference to an uploaded, content-verified block of file data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockAccess {
    pub id: BlockID,
    pub key: SecretKey,
    pub offset: u64,
    pub size: u64,
    pub digest: HashDigest,
}

impl BlockAccess {
    pub fn from_chunk(chunk: &Chunk, digest: HashDigest) -> Self {
        Self {
            id: BlockID(chunk.id.as_uuid()),
            key: SecretKey::generate(),
            offset: chunk.start,
            size: chunk.stop - chunk.start,
            digest,
        }
    }

    /// The inverse of `Chunk::evolve_as_block`: a chunk that is exactly
    /// this block, left- and right-aligned with it.
    pub fn to_chunk(&self) -> Chunk {
        Chunk {
            id: ChunkID(self.id.as_uuid()),
            start: self.offset,
            stop: self.offset + self.size,
            raw_offset: self.offset,
            raw_size: self.size,
            access: Some(self.clone()),
        }
    }
}

/// A local-only span of a file's address space (spec §3 "Chunk").
///
/// Invariant: `raw_offset <= start < stop <= raw_offset + raw_size`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkID,
    pub start: u64,
    pub stop: u64,
    pub raw_offset: u64,
    pub raw_size: u64,
    pub access: Option<BlockAccess>,
}

impl Chunk {
    pub fn new(start: u64, stop: u64) -> Self {
        assert!(start < stop, "chunk span must be non-empty");
        Self {
            id: ChunkID::new(),
            start,
            stop,
            raw_offset: start,
            raw_size: stop - start,
            access: None,
        }
    }

    /// A chunk is left- and right-aligned with its own raw span — a
    /// necessary (but not sufficient, see `is_block`) condition for it to
    /// stand in for a full block.
    pub fn is_pseudo_block(&self) -> bool {
        self.start == self.raw_offset && self.stop == self.raw_offset + self.raw_size
    }

    /// A chunk "is a block" when it carries a `BlockAccess` and is aligned
    /// with it on both ends (spec §3).
    pub fn is_block(&self) -> bool {
        let Some(access) = &self.access else {
            return false;
        };
        self.is_pseudo_block() && self.raw_offset == access.offset && self.raw_size == access.size
    }

    pub fn evolve(&self, start: u64, stop: u64) -> Self {
        Self {
            id: self.id,
            start,
            stop,
            raw_offset: self.raw_offset,
            raw_size: self.raw_size,
            access: self.access.clone(),
        }
    }

    /// Promote a dirty, fully-aligned chunk to a clean block given its
    /// plaintext `data` (the digest is computed here so callers never have
    /// to get the hash-over-plaintext rule wrong).
    pub fn evolve_as_block(&self, data: &[u8]) -> Result<Self, ChunkNotAligned> {
        if self.is_block() {
            return Ok(self.clone());
        }
        if self.raw_offset != self.start || self.raw_size != self.stop - self.start {
            return Err(ChunkNotAligned);
        }
        let digest = crate::crypto::HashDigest::of(data);
        let access = BlockAccess::from_chunk(self, digest);
        Ok(Self {
            access: Some(access),
            ..self.clone()
        })
    }

    pub fn get_block_access(&self) -> Option<&BlockAccess> {
        if self.is_block() {
            self.access.as_ref()
        } else {
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("chunk is not aligned with its raw span")]
pub struct ChunkNotAligned;

/// Verify a slot's chunk list (spec §3 invariant, §8 "File slot coverage"):
/// the union of `[start, stop)` intervals must equal `[slot_start, slot_stop)`
/// exactly, with no gaps and no overlaps, sorted by `start`.
pub fn slot_chunks_cover_exactly(chunks: &[Chunk], slot_start: u64, slot_stop: u64) -> bool {
    if chunks.is_empty() {
        return slot_start == slot_stop;
    }
    let mut sorted: Vec<&Chunk> = chunks.iter().collect();
    sorted.sort_by_key(|c| c.start);
    if sorted[0].start != slot_start {
        return false;
    }
    for pair in sorted.windows(2) {
        if pair[0].stop != pair[1].start {
            return false;
        }
    }
    sorted.last().unwrap().stop == slot_stop
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_chunk_is_pseudo_block() {
        let c = Chunk::new(10, 20);
        assert!(c.is_pseudo_block());
        assert!(!c.is_block()); // no access yet
    }

    #[test]
    fn evolve_as_block_sets_access_when_aligned() {
        let c = Chunk::new(0, 8);
        let data = vec![0u8; 8];
        let block = c.evolve_as_block(&data).unwrap();
        assert!(block.is_block());
        assert_eq!(block.access.unwrap().size, 8);
    }

    #[test]
    fn evolve_as_block_rejects_misaligned_chunk() {
        let c = Chunk::new(0, 8).evolve(2, 6);
        assert!(c.evolve_as_block(&[0u8; 4]).is_err());
    }

    #[test]
    fn slot_coverage_detects_gaps_and_overlaps() {
        let a = Chunk::new(0, 5);
        let b = Chunk::new(5, 10);
        assert!(slot_chunks_cover_exactly(&[a, b], 0, 10));

        let a = Chunk::new(0, 5);
        let b = Chunk::new(6, 10);
        assert!(!slot_chunks_cover_exactly(&[a, b], 0, 10));

        let a = Chunk::new(0, 6);
        let b = Chunk::new(5, 10);
        assert!(!slot_chunks_cover_exactly(&[a, b], 0, 10));
    }
}
