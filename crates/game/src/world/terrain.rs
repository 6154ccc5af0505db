use glam::IVec3;

use super::cache::BlockSource;
use super::chunk::{BlockId, CHUNK_SIZE, Chunk, ChunkPos};

/// Flat world: grass on top of the ground level, dirt just below, stone under
/// that, air above.
#[derive(Debug, Clone, Copy)]
pub struct FlatTerrain {
    pub ground_level: i32,
    pub dirt_depth: i32,
}

impl Default for FlatTerrain {
    fn default() -> Self {
        Self {
            ground_level: 0,
            dirt_depth: 3,
        }
    }
}

impl FlatTerrain {
    pub fn generate(&self, position: ChunkPos) -> Chunk {
        let mut chunk = Chunk::new(position);
        let origin = position.origin();
        for y in 0..CHUNK_SIZE {
            let block = self.block_for_height(origin.y + y);
            if block == BlockId::AIR {
                continue;
            }
            for z in 0..CHUNK_SIZE {
                for x in 0..CHUNK_SIZE {
                    chunk.set(IVec3::new(x, y, z), block);
                }
            }
        }
        chunk
    }

    /// Chunks in a square of `radius` around `center` covering the ground
    /// layer and the air layer above it.
    pub fn chunks_around(&self, center: IVec3, radius: i32) -> Vec<ChunkPos> {
        let center = ChunkPos::containing(center).grid();
        let ground = ChunkPos::containing(IVec3::new(0, self.ground_level - 1, 0)).grid().y;

        let mut positions = Vec::new();
        for y in ground..=ground + 1 {
            for z in -radius..=radius {
                for x in -radius..=radius {
                    positions.push(ChunkPos::from_grid(IVec3::new(center.x + x, y, center.z + z)));
                }
            }
        }
        positions.sort_by_key(|p| {
            let d = p.grid() - IVec3::new(center.x, p.grid().y, center.z);
            d.x.abs().max(d.z.abs())
        });
        positions
    }

    fn block_for_height(&self, y: i32) -> BlockId {
        let depth = self.ground_level - 1 - y;
        match depth {
            d if d < 0 => BlockId::AIR,
            0 => BlockId::GRASS,
            d if d <= self.dirt_depth => BlockId::DIRT,
            _ => BlockId::STONE,
        }
    }
}

impl BlockSource for FlatTerrain {
    fn block_at(&self, position: IVec3) -> BlockId {
        self.block_for_height(position.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_layers() {
        let terrain = FlatTerrain::default();
        assert_eq!(terrain.block_at(IVec3::new(5, 0, 5)), BlockId::AIR);
        assert_eq!(terrain.block_at(IVec3::new(5, -1, 5)), BlockId::GRASS);
        assert_eq!(terrain.block_at(IVec3::new(5, -2, 5)), BlockId::DIRT);
        assert_eq!(terrain.block_at(IVec3::new(5, -10, 5)), BlockId::STONE);
    }

    #[test]
    fn test_generated_chunk_matches_terrain() {
        let terrain = FlatTerrain::default();
        let ground = terrain.generate(ChunkPos::from_grid(IVec3::new(0, -1, 0)));
        assert_eq!(ground.get(IVec3::new(0, 15, 0)), BlockId::GRASS);
        assert_eq!(ground.get(IVec3::new(0, 0, 0)), BlockId::STONE);

        let sky = terrain.generate(ChunkPos::from_grid(IVec3::ZERO));
        assert!(sky.blocks().iter().all(|b| *b == BlockId::AIR));
    }

    #[test]
    fn test_chunks_around_nearest_first() {
        let terrain = FlatTerrain::default();
        let chunks = terrain.chunks_around(IVec3::ZERO, 1);
        assert_eq!(chunks.len(), 18);
        assert_eq!(chunks[0].grid().x, 0);
        assert_eq!(chunks[0].grid().z, 0);
        assert!(chunks.iter().all(|c| c.grid().y == -1 || c.grid().y == 0));
    }
}
