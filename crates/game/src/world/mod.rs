pub mod authority;
pub mod cache;
pub mod chunk;
pub mod movement;
pub mod terrain;

pub use authority::AuthoritativeWorld;
pub use cache::{BlockSource, WorldCache};
pub use chunk::{BlockId, CHUNK_SIZE, CHUNK_VOLUME, Chunk, ChunkPos};
pub use movement::{MovementConfig, PlayerBody, apply_input};
pub use terrain::FlatTerrain;
