use std::fmt;

use glam::IVec3;

use crate::net::codec::{CodecError, Serialize, Stream};

pub const CHUNK_SIZE: i32 = 16;
pub const CHUNK_VOLUME: usize = (CHUNK_SIZE * CHUNK_SIZE * CHUNK_SIZE) as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockId(pub u16);

impl BlockId {
    pub const AIR: BlockId = BlockId(0);
    pub const STONE: BlockId = BlockId(1);
    pub const DIRT: BlockId = BlockId(2);
    pub const GRASS: BlockId = BlockId(3);
    /// Returned for positions whose chunk has not been received.
    pub const OUT_OF_BOUNDS: BlockId = BlockId(u16::MAX);

    pub fn is_solid(self) -> bool {
        self != Self::AIR && self != Self::OUT_OF_BOUNDS
    }
}

/// Origin of a chunk in block coordinates; every component is a multiple of
/// [`CHUNK_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChunkPos(IVec3);

impl ChunkPos {
    pub fn new(origin: IVec3) -> Option<Self> {
        let aligned = origin.rem_euclid(IVec3::splat(CHUNK_SIZE)) == IVec3::ZERO;
        aligned.then_some(Self(origin))
    }

    pub fn containing(block: IVec3) -> Self {
        Self(block.div_euclid(IVec3::splat(CHUNK_SIZE)) * CHUNK_SIZE)
    }

    /// Chunk at the given chunk-grid coordinate.
    pub fn from_grid(grid: IVec3) -> Self {
        Self(grid * CHUNK_SIZE)
    }

    pub fn origin(self) -> IVec3 {
        self.0
    }

    pub fn grid(self) -> IVec3 {
        self.0.div_euclid(IVec3::splat(CHUNK_SIZE))
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.0.x, self.0.y, self.0.z)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    position: ChunkPos,
    blocks: Box<[BlockId; CHUNK_VOLUME]>,
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let solid = self.blocks.iter().filter(|b| b.is_solid()).count();
        f.debug_struct("Chunk")
            .field("position", &self.position)
            .field("solid", &solid)
            .finish()
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new(ChunkPos::default())
    }
}

impl Chunk {
    pub fn new(position: ChunkPos) -> Self {
        Self::filled(position, BlockId::AIR)
    }

    pub fn filled(position: ChunkPos, block: BlockId) -> Self {
        Self {
            position,
            blocks: Box::new([block; CHUNK_VOLUME]),
        }
    }

    /// Flattened index, x fastest, then z, then y.
    pub fn index(local: IVec3) -> Option<usize> {
        let in_range = |v: i32| (0..CHUNK_SIZE).contains(&v);
        if !(in_range(local.x) && in_range(local.y) && in_range(local.z)) {
            return None;
        }
        Some((local.x + local.z * CHUNK_SIZE + local.y * CHUNK_SIZE * CHUNK_SIZE) as usize)
    }

    pub fn position(&self) -> ChunkPos {
        self.position
    }

    pub fn get(&self, local: IVec3) -> BlockId {
        Self::index(local).map_or(BlockId::OUT_OF_BOUNDS, |i| self.blocks[i])
    }

    pub fn set(&mut self, local: IVec3, block: BlockId) -> bool {
        match Self::index(local) {
            Some(i) => {
                self.blocks[i] = block;
                true
            }
            None => false,
        }
    }

    pub fn block_at_world(&self, world: IVec3) -> BlockId {
        self.get(world - self.position.origin())
    }

    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks[..]
    }
}

impl Serialize for Chunk {
    fn serialize(&mut self, stream: &mut Stream<'_>) -> Result<(), CodecError> {
        let mut origin = self.position.origin();
        stream.io(&mut origin)?;
        self.position = ChunkPos::new(origin)
            .ok_or_else(|| CodecError::malformed(format!("unaligned chunk origin {origin}")))?;

        for block in self.blocks.iter_mut() {
            stream.io(&mut block.0)?;
        }
        Ok(())
    }
}
