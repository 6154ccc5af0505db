pub mod codec;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod reliable;
pub mod stats;
pub mod tracking;
pub mod transport;

pub use codec::{CodecError, Mode, Serialize, Stream, decode, encode};
pub use connection::{ConnectionState, PeerId};
pub use error::{ConnectionError, DisconnectReason, TransportError};
pub use protocol::{
    Channel, DEFAULT_PORT, DEFAULT_TICK_INTERVAL_MS, MAX_FRAGMENT_SIZE, MAX_PACKET_SIZE,
    PROTOCOL_MAGIC, PROTOCOL_VERSION, Reliability,
};
pub use queue::SyncQueue;
pub use stats::{NetworkStats, PacketLossSimulation};
pub use transport::{Host, HostEvent, TransportHandler};
