use super::codec::{CodecError, Serialize, Stream};

pub const MAX_PACKET_SIZE: usize = 1200;
pub const MAX_FRAGMENT_SIZE: usize = 1024;
pub const MAX_FRAGMENTS: usize = 256;
pub const PROTOCOL_VERSION: u8 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x4355_4257;
pub const DEFAULT_PORT: u16 = 27015;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 50;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Unreliable,
    Reliable,
}

/// Protocol-level sub-streams. The numbering is part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Channel {
    Events = 0,
    State = 1,
    Chat = 2,
    Chunk = 3,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Events, Channel::State, Channel::Chat, Channel::Chunk];
    pub const COUNT: usize = Self::ALL.len();

    pub fn reliability(self) -> Reliability {
        match self {
            Channel::State => Reliability::Unreliable,
            Channel::Events | Channel::Chat | Channel::Chunk => Reliability::Reliable,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for Channel {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Channel::Events),
            1 => Ok(Channel::State),
            2 => Ok(Channel::Chat),
            3 => Ok(Channel::Chunk),
            other => Err(CodecError::malformed(format!("unknown channel {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u8,
    pub sequence: u32,
    pub ack: u32,
    pub ack_bitfield: u32,
}

impl Default for PacketHeader {
    fn default() -> Self {
        Self::new(0, 0, 0)
    }
}

impl PacketHeader {
    pub fn new(sequence: u32, ack: u32, ack_bitfield: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            sequence,
            ack,
            ack_bitfield,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

impl Serialize for PacketHeader {
    fn serialize(&mut self, stream: &mut Stream<'_>) -> Result<(), CodecError> {
        stream
            .io(&mut self.magic)?
            .io(&mut self.version)?
            .io(&mut self.sequence)?
            .io(&mut self.ack)?
            .io(&mut self.ack_bitfield)?;
        Ok(())
    }
}

/// One slice of an application message. Unreliable messages always travel
/// as a single fragment with `message_id == 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub channel: Channel,
    pub reliability: Reliability,
    pub message_id: u32,
    pub index: u16,
    pub count: u16,
    pub data: Vec<u8>,
}

impl Default for Fragment {
    fn default() -> Self {
        Self {
            channel: Channel::Events,
            reliability: Reliability::Unreliable,
            message_id: 0,
            index: 0,
            count: 1,
            data: Vec::new(),
        }
    }
}

impl Fragment {
    pub fn is_last(&self) -> bool {
        self.index + 1 == self.count
    }
}

impl Serialize for Fragment {
    fn serialize(&mut self, stream: &mut Stream<'_>) -> Result<(), CodecError> {
        let mut channel = self.channel as u8;
        let mut reliable = self.reliability == Reliability::Reliable;
        stream
            .io(&mut channel)?
            .io(&mut reliable)?
            .io(&mut self.message_id)?
            .io(&mut self.index)?
            .io(&mut self.count)?
            .io(&mut self.data)?;
        self.channel = Channel::try_from(channel)?;
        self.reliability = if reliable {
            Reliability::Reliable
        } else {
            Reliability::Unreliable
        };

        if self.count == 0 || self.index >= self.count || self.count as usize > MAX_FRAGMENTS {
            return Err(CodecError::malformed(format!(
                "fragment {}/{} out of range",
                self.index, self.count
            )));
        }
        if self.data.len() > MAX_FRAGMENT_SIZE {
            return Err(CodecError::malformed("fragment exceeds MTU"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PacketType {
    ConnectionRequest {
        client_salt: u64,
    },
    ConnectionChallenge {
        server_salt: u64,
        challenge: u64,
    },
    ChallengeResponse {
        combined_salt: u64,
    },
    ConnectionAccepted {
        peer_id: u32,
    },
    ConnectionDenied {
        reason: String,
    },
    Payload(Fragment),
    #[default]
    Ack,
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    Disconnect,
}

impl PacketType {
    fn tag(&self) -> u8 {
        match self {
            PacketType::ConnectionRequest { .. } => 0,
            PacketType::ConnectionChallenge { .. } => 1,
            PacketType::ChallengeResponse { .. } => 2,
            PacketType::ConnectionAccepted { .. } => 3,
            PacketType::ConnectionDenied { .. } => 4,
            PacketType::Payload(_) => 5,
            PacketType::Ack => 6,
            PacketType::Ping { .. } => 7,
            PacketType::Pong { .. } => 8,
            PacketType::Disconnect => 9,
        }
    }

    fn empty(tag: u8) -> Result<Self, CodecError> {
        Ok(match tag {
            0 => PacketType::ConnectionRequest { client_salt: 0 },
            1 => PacketType::ConnectionChallenge {
                server_salt: 0,
                challenge: 0,
            },
            2 => PacketType::ChallengeResponse { combined_salt: 0 },
            3 => PacketType::ConnectionAccepted { peer_id: 0 },
            4 => PacketType::ConnectionDenied {
                reason: String::new(),
            },
            5 => PacketType::Payload(Fragment::default()),
            6 => PacketType::Ack,
            7 => PacketType::Ping { timestamp: 0 },
            8 => PacketType::Pong { timestamp: 0 },
            9 => PacketType::Disconnect,
            other => return Err(CodecError::malformed(format!("unknown packet type {other}"))),
        })
    }
}

impl Serialize for PacketType {
    fn serialize(&mut self, stream: &mut Stream<'_>) -> Result<(), CodecError> {
        let mut tag = self.tag();
        tag.serialize(stream)?;
        if stream.is_reading() {
            *self = PacketType::empty(tag)?;
        }

        match self {
            PacketType::ConnectionRequest { client_salt } => {
                stream.io(client_salt)?;
            }
            PacketType::ConnectionChallenge {
                server_salt,
                challenge,
            } => {
                stream.io(server_salt)?.io(challenge)?;
            }
            PacketType::ChallengeResponse { combined_salt } => {
                stream.io(combined_salt)?;
            }
            PacketType::ConnectionAccepted { peer_id } => {
                stream.io(peer_id)?;
            }
            PacketType::ConnectionDenied { reason } => {
                stream.io(reason)?;
            }
            PacketType::Payload(fragment) => {
                stream.io(fragment)?;
            }
            PacketType::Ping { timestamp } | PacketType::Pong { timestamp } => {
                stream.io(timestamp)?;
            }
            PacketType::Ack | PacketType::Disconnect => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: PacketType,
}

impl Serialize for Packet {
    fn serialize(&mut self, stream: &mut Stream<'_>) -> Result<(), CodecError> {
        stream.io(&mut self.header)?.io(&mut self.payload)?;
        Ok(())
    }
}

impl Packet {
    pub fn new(header: PacketHeader, payload: PacketType) -> Self {
        Self { header, payload }
    }

    /// Handshake packets carry no session sequence and are never tracked.
    pub fn control(payload: PacketType) -> Self {
        Self::new(PacketHeader::default(), payload)
    }

    pub fn is_reliable_payload(&self) -> bool {
        matches!(&self.payload, PacketType::Payload(f) if f.reliability == Reliability::Reliable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::{decode, encode};

    #[test]
    fn test_sequence_comparison() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
    }

    #[test]
    fn test_channel_reliability() {
        assert_eq!(Channel::Events.reliability(), Reliability::Reliable);
        assert_eq!(Channel::State.reliability(), Reliability::Unreliable);
        assert_eq!(Channel::Chat.reliability(), Reliability::Reliable);
        assert_eq!(Channel::Chunk.reliability(), Reliability::Reliable);
        assert!(Channel::try_from(4).is_err());
    }

    #[test]
    fn test_packet_serialization() {
        let mut packet = Packet::new(
            PacketHeader::new(7, 6, 0b101),
            PacketType::Payload(Fragment {
                channel: Channel::Chunk,
                reliability: Reliability::Reliable,
                message_id: 42,
                index: 1,
                count: 3,
                data: vec![9; 100],
            }),
        );

        let bytes = encode(&mut packet).unwrap();
        let decoded: Packet = decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.header.is_valid());
        assert!(decoded.is_reliable_payload());
    }

    #[test]
    fn test_full_fragment_fits_mtu() {
        let mut packet = Packet::new(
            PacketHeader::new(u32::MAX, u32::MAX, u32::MAX),
            PacketType::Payload(Fragment {
                channel: Channel::Chunk,
                reliability: Reliability::Reliable,
                message_id: u32::MAX,
                index: 0,
                count: 1,
                data: vec![0; MAX_FRAGMENT_SIZE],
            }),
        );
        assert!(encode(&mut packet).unwrap().len() <= MAX_PACKET_SIZE);
    }

    #[test]
    fn test_rejects_bad_fragment_range() {
        let mut packet = Packet::new(
            PacketHeader::new(1, 0, 0),
            PacketType::Payload(Fragment {
                channel: Channel::Chat,
                reliability: Reliability::Unreliable,
                message_id: 0,
                index: 0,
                count: 1,
                data: vec![],
            }),
        );
        let mut bytes = encode(&mut packet).unwrap();
        // header (17) + tag (1) + channel (1) + flag (1) + message id (4) puts index at 24..26
        bytes[24] = 0;
        bytes[25] = 5;
        assert!(matches!(
            decode::<Packet>(&bytes),
            Err(CodecError::MalformedPayload(_))
        ));
    }
}
