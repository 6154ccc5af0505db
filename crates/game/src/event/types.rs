use glam::Vec3;

use crate::net::codec::{CodecError, Serialize, Stream};
use crate::sync::{Sequence, UserId};

pub const MAX_CHAT_LEN: usize = 256;

/// Session events carried on the events channel.
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    /// First message a server sends a new user.
    Welcome {
        user_id: UserId,
        next_sequence: Sequence,
        spawn_position: Vec3,
    },
    PlayerJoined {
        user_id: UserId,
    },
    PlayerLeft {
        user_id: UserId,
    },
}

// Placeholder for `decode`; every read overwrites it from the tag.
impl Default for GameEvent {
    fn default() -> Self {
        Self::PlayerJoined { user_id: 0 }
    }
}

impl GameEvent {
    fn tag(&self) -> u8 {
        match self {
            Self::Welcome { .. } => 0,
            Self::PlayerJoined { .. } => 1,
            Self::PlayerLeft { .. } => 2,
        }
    }

    fn empty(tag: u8) -> Result<Self, CodecError> {
        Ok(match tag {
            0 => Self::Welcome {
                user_id: 0,
                next_sequence: Sequence::default(),
                spawn_position: Vec3::ZERO,
            },
            1 => Self::PlayerJoined { user_id: 0 },
            2 => Self::PlayerLeft { user_id: 0 },
            other => return Err(CodecError::malformed(format!("unknown event {other}"))),
        })
    }
}

impl Serialize for GameEvent {
    fn serialize(&mut self, stream: &mut Stream<'_>) -> Result<(), CodecError> {
        let mut tag = self.tag();
        stream.io(&mut tag)?;
        if stream.is_reading() {
            *self = Self::empty(tag)?;
        }

        match self {
            Self::Welcome {
                user_id,
                next_sequence,
                spawn_position,
            } => {
                stream.io(user_id)?.io(next_sequence)?.io(spawn_position)?;
            }
            Self::PlayerJoined { user_id } | Self::PlayerLeft { user_id } => {
                stream.io(user_id)?;
            }
        }
        Ok(())
    }
}

/// Chat text as relayed by the server. Clients send only the text; the
/// server stamps the sender.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatLine {
    pub user_id: UserId,
    pub text: String,
}

impl ChatLine {
    pub fn new(user_id: UserId, text: impl Into<String>) -> Self {
        let mut text: String = text.into();
        truncate_chat(&mut text);
        Self { user_id, text }
    }
}

/// Cuts `text` to [`MAX_CHAT_LEN`] bytes on a character boundary.
pub fn truncate_chat(text: &mut String) {
    if text.len() <= MAX_CHAT_LEN {
        return;
    }
    let mut end = MAX_CHAT_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

impl Serialize for ChatLine {
    fn serialize(&mut self, stream: &mut Stream<'_>) -> Result<(), CodecError> {
        stream.io(&mut self.user_id)?.io(&mut self.text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::{decode, encode};

    #[test]
    fn test_event_round_trip() {
        let mut events = [
            GameEvent::Welcome {
                user_id: 3,
                next_sequence: Sequence(200),
                spawn_position: Vec3::new(1.0, 2.0, 3.0),
            },
            GameEvent::PlayerJoined { user_id: 4 },
            GameEvent::PlayerLeft { user_id: 4 },
        ];
        for event in &mut events {
            let bytes = encode(event).unwrap();
            assert_eq!(&decode::<GameEvent>(&bytes).unwrap(), event);
        }
    }

    #[test]
    fn test_unknown_event_tag() {
        for tag in [3u8, 9, 255] {
            assert!(matches!(
                decode::<GameEvent>(&[tag]),
                Err(CodecError::MalformedPayload(_))
            ));
        }
    }

    #[test]
    fn test_chat_line_layout() {
        let mut line = ChatLine::new(2, "hi");
        let bytes = encode(&mut line).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 2, 0, 0, 0, 2, b'h', b'i', 0]);
    }

    #[test]
    fn test_chat_truncated_on_char_boundary() {
        let long = "é".repeat(MAX_CHAT_LEN);
        let line = ChatLine::new(1, long);
        assert!(line.text.len() <= MAX_CHAT_LEN);
        assert!(line.text.chars().all(|c| c == 'é'));
    }
}
