use std::net::SocketAddr;

use cubeworld::{DisconnectReason, Sequence, UserId};

/// Things worth reporting to whoever runs the server, drained from
/// [`GameServer::drain_events`](crate::server::GameServer::drain_events).
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    UserJoined {
        user_id: UserId,
        addr: SocketAddr,
        start_sequence: Sequence,
    },
    UserLeft {
        user_id: UserId,
        reason: DisconnectReason,
    },
    Chat {
        user_id: UserId,
        text: String,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn log(&self) {
        match self {
            ServerEvent::UserJoined {
                user_id,
                addr,
                start_sequence,
            } => log::info!("user {user_id} joined from {addr}, starting at {start_sequence}"),
            ServerEvent::UserLeft { user_id, reason } => {
                log::info!("user {user_id} {}", reason.as_str())
            }
            ServerEvent::Chat { user_id, text } => log::info!("<{user_id}> {text}"),
            ServerEvent::Error { message } => log::error!("{message}"),
        }
    }
}
