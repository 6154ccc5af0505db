use glam::Vec3;

use super::UserId;
use super::sequence::Sequence;
use crate::net::codec::{CodecError, Serialize, Stream};
use crate::world::PlayerBody;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlayerState {
    pub user_id: UserId,
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
}

impl PlayerState {
    pub fn new(user_id: UserId, body: &PlayerBody) -> Self {
        Self {
            user_id,
            position: body.position,
            yaw: body.yaw,
            pitch: body.pitch,
        }
    }

    pub fn body(&self) -> PlayerBody {
        PlayerBody {
            position: self.position,
            yaw: self.yaw,
            pitch: self.pitch,
        }
    }
}

impl Serialize for PlayerState {
    fn serialize(&mut self, stream: &mut Stream<'_>) -> Result<(), CodecError> {
        stream
            .io(&mut self.user_id)?
            .io(&mut self.position)?
            .io(&mut self.yaw)?
            .io(&mut self.pitch)?;
        Ok(())
    }
}

/// Authoritative result of one consumed bundle, broadcast on the state
/// channel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfirmationSnapshot {
    pub sequence: Sequence,
    pub players: Vec<PlayerState>,
}

impl ConfirmationSnapshot {
    pub fn player(&self, user_id: UserId) -> Option<&PlayerState> {
        self.players.iter().find(|p| p.user_id == user_id)
    }
}

impl Serialize for ConfirmationSnapshot {
    fn serialize(&mut self, stream: &mut Stream<'_>) -> Result<(), CodecError> {
        stream.io(&mut self.sequence)?.io(&mut self.players)?;
        Ok(())
    }
}
