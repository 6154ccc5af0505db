use std::time::Instant;

use super::input::{InputSample, InputState};
use super::sequence::Sequence;

/// Stamps raw samples with consecutive sequences and a millisecond clock.
#[derive(Debug)]
pub struct InputCapture {
    last: Sequence,
    started: Instant,
}

impl Default for InputCapture {
    fn default() -> Self {
        Self::starting_at(Sequence(0))
    }
}

impl InputCapture {
    /// The first captured input will carry `first`.
    pub fn starting_at(first: Sequence) -> Self {
        Self {
            last: first.prev(),
            started: Instant::now(),
        }
    }

    pub fn capture(&mut self, sample: InputSample) -> InputState {
        self.last = self.last.next();
        InputState {
            sequence: self.last,
            movement: sample.movement,
            yaw: sample.yaw,
            pitch: sample.pitch,
            timestamp_ms: self.started.elapsed().as_millis() as u32,
        }
    }

    pub fn last_sequence(&self) -> Sequence {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::input::MovementFlags;

    #[test]
    fn test_sequences_are_consecutive_across_wrap() {
        let mut capture = InputCapture::starting_at(Sequence(250));
        let mut previous: Option<InputState> = None;
        for _ in 0..20 {
            let input = capture.capture(InputSample::default());
            if let Some(prev) = previous {
                assert_eq!(input.sequence, prev.sequence.next());
                assert!(input.timestamp_ms >= prev.timestamp_ms);
            }
            previous = Some(input);
        }
        assert_eq!(capture.last_sequence(), Sequence(13));
    }

    #[test]
    fn test_sample_is_copied() {
        let mut capture = InputCapture::default();
        let input = capture.capture(InputSample {
            movement: MovementFlags::FORWARD,
            yaw: 0.3,
            pitch: -0.1,
        });
        assert_eq!(input.sequence, Sequence(0));
        assert_eq!(input.movement, MovementFlags::FORWARD);
        assert_eq!(input.yaw, 0.3);
    }
}
