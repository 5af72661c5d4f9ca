//! Chunk lookup (C3): an O(1) getter over a pre-fetched `mirror_hash -> [chunk]`
//! map. Callers must batch-fetch every mirror hash they need before iterating
//! candidates; this type performs no store round-trips of its own.

use crate::models::{Chunk, ChunkMap};

pub struct ChunkLookup<'a> {
    map: &'a ChunkMap,
}

impl<'a> ChunkLookup<'a> {
    pub fn new(map: &'a ChunkMap) -> Self {
        Self { map }
    }

    /// Look up the chunk for `(mirror_hash, seq)`. When the store emits a
    /// document-level placeholder with `seq == 0` and no chunk carries that
    /// seq, fall back to the first chunk under the hash (by `seq` order).
    pub fn get(&self, mirror_hash: &str, seq: i64) -> Option<&'a Chunk> {
        let chunks = self.map.get(mirror_hash)?;
        if let Some(c) = chunks.iter().find(|c| c.seq == seq) {
            return Some(c);
        }
        if seq == 0 {
            return chunks.iter().min_by_key(|c| c.seq);
        }
        None
    }
}
