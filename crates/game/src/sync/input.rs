use bitflags::bitflags;

use super::sequence::Sequence;
use crate::net::codec::{CodecError, Serialize, Stream};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MovementFlags: u8 {
        const FORWARD = 1 << 0;
        const BACK = 1 << 1;
        const LEFT = 1 << 2;
        const RIGHT = 1 << 3;
        const UP = 1 << 4;
        const DOWN = 1 << 5;
        const SPRINT = 1 << 6;
    }
}

/// One tick of sampled player input. Wire form is 14 bytes:
/// sequence, movement flags, yaw, pitch, timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InputState {
    pub sequence: Sequence,
    pub movement: MovementFlags,
    pub yaw: f32,
    pub pitch: f32,
    pub timestamp_ms: u32,
}

impl InputState {
    pub fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = sequence;
        self
    }
}

impl Serialize for InputState {
    fn serialize(&mut self, stream: &mut Stream<'_>) -> Result<(), CodecError> {
        let mut bits = self.movement.bits();
        stream
            .io(&mut self.sequence)?
            .io(&mut bits)?
            .io(&mut self.yaw)?
            .io(&mut self.pitch)?
            .io(&mut self.timestamp_ms)?;
        self.movement = MovementFlags::from_bits(bits)
            .ok_or_else(|| CodecError::malformed(format!("unknown movement bits {bits:#04x}")))?;
        Ok(())
    }
}

/// Raw input as the device layer reports it, before sequencing.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InputSample {
    pub movement: MovementFlags,
    pub yaw: f32,
    pub pitch: f32,
}

pub trait InputSource: Send {
    fn sample(&mut self) -> InputSample;
}

impl<F> InputSource for F
where
    F: FnMut() -> InputSample + Send,
{
    fn sample(&mut self) -> InputSample {
        self()
    }
}
