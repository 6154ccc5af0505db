use std::collections::HashMap;

use glam::IVec3;

use super::chunk::{BlockId, Chunk, ChunkPos};

/// Block lookup used by movement collision.
pub trait BlockSource {
    fn block_at(&self, position: IVec3) -> BlockId;
}

/// Chunks received so far, keyed by origin. Lookups into missing chunks
/// answer [`BlockId::OUT_OF_BOUNDS`] instead of waiting.
#[derive(Debug, Default)]
pub struct WorldCache {
    chunks: HashMap<ChunkPos, Chunk>,
}

impl WorldCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `chunk`, replacing any chunk already cached at its position.
    /// Returns `true` when the position was not cached before.
    pub fn insert(&mut self, chunk: Chunk) -> bool {
        self.chunks.insert(chunk.position(), chunk).is_none()
    }

    pub fn get(&self, position: ChunkPos) -> Option<&Chunk> {
        self.chunks.get(&position)
    }

    pub fn contains(&self, position: ChunkPos) -> bool {
        self.chunks.contains_key(&position)
    }

    pub fn remove(&mut self, position: ChunkPos) -> Option<Chunk> {
        self.chunks.remove(&position)
    }

    pub fn positions(&self) -> impl Iterator<Item = ChunkPos> + '_ {
        self.chunks.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl BlockSource for WorldCache {
    fn block_at(&self, position: IVec3) -> BlockId {
        self.chunks
            .get(&ChunkPos::containing(position))
            .map_or(BlockId::OUT_OF_BOUNDS, |chunk| chunk.block_at_world(position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_chunk_is_out_of_bounds() {
        let cache = WorldCache::new();
        assert_eq!(cache.block_at(IVec3::new(3, -1, 3)), BlockId::OUT_OF_BOUNDS);
        assert!(!cache.block_at(IVec3::ZERO).is_solid());
    }

    #[test]
    fn test_insert_is_idempotent() {
        let pos = ChunkPos::new(IVec3::new(16, 0, 16)).unwrap();
        let mut cache = WorldCache::new();

        assert!(cache.insert(Chunk::new(pos)));
        assert!(!cache.insert(Chunk::filled(pos, BlockId::STONE)));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.block_at(IVec3::new(20, 3, 31)), BlockId::STONE);
    }

    #[test]
    fn test_negative_coordinates() {
        let pos = ChunkPos::new(IVec3::new(-16, -16, -16)).unwrap();
        let mut chunk = Chunk::new(pos);
        chunk.set(IVec3::new(15, 15, 15), BlockId::DIRT);

        let mut cache = WorldCache::new();
        cache.insert(chunk);
        assert_eq!(cache.block_at(IVec3::new(-1, -1, -1)), BlockId::DIRT);
        assert_eq!(cache.block_at(IVec3::new(-2, -1, -1)), BlockId::AIR);
    }
}
