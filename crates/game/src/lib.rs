pub mod event;
pub mod net;
pub mod sync;
pub mod world;

pub use event::{ChatLine, GameEvent};
pub use net::{
    Channel, CodecError, ConnectionError, DEFAULT_PORT, DisconnectReason, Host, HostEvent,
    NetworkStats, PacketLossSimulation, PeerId, Reliability, Serialize, SyncQueue,
    TransportError, TransportHandler, decode, encode,
};
pub use sync::{
    AggregatorConfig, ClientPrediction, ConfirmationSnapshot, InputCapture, InputSample,
    InputSource, InputState, MovementFlags, PlayerState, Reconciliation, Sequence,
    StateAggregator, SyncError, UserId,
};
pub use world::{
    AuthoritativeWorld, BlockId, BlockSource, Chunk, ChunkPos, FlatTerrain, MovementConfig,
    PlayerBody, WorldCache, apply_input,
};

/// Upper bound on concurrent players; a full confirmation snapshot must fit
/// one unreliable datagram.
pub const MAX_PLAYERS: usize = 32;
