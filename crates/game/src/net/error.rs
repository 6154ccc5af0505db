use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use super::connection::PeerId;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection to {addr} timed out after {waited:?}")]
    TimedOut { addr: SocketAddr, waited: Duration },
    #[error("connection denied: {0}")]
    Denied(String),
    #[error("challenge mismatch from {0}")]
    ChallengeMismatch(SocketAddr),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Kicked,
    Replaced,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Kicked => "kicked",
            DisconnectReason::Replaced => "replaced by a new session",
        }
    }
}
