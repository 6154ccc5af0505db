use std::f32::consts::TAU;

use clap::ValueEnum;

use cubeworld::{InputSample, InputSource, MovementFlags};

/// Ticks spent on each side of the square walk.
const SQUARE_SIDE_TICKS: u32 = 20;
/// Full turn of the spin walk.
const SPIN_PERIOD_TICKS: u32 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WalkPattern {
    Idle,
    Forward,
    Square,
    Spin,
}

/// Canned input for headless clients, one sample per tick.
#[derive(Debug, Clone)]
pub struct ScriptedInput {
    pattern: WalkPattern,
    sprint: bool,
    tick: u32,
}

impl ScriptedInput {
    pub fn new(pattern: WalkPattern) -> Self {
        Self {
            pattern,
            sprint: false,
            tick: 0,
        }
    }

    pub fn sprinting(mut self, sprint: bool) -> Self {
        self.sprint = sprint;
        self
    }

    pub fn next_sample(&mut self) -> InputSample {
        let tick = self.tick;
        self.tick = self.tick.wrapping_add(1);

        let mut sample = match self.pattern {
            WalkPattern::Idle => InputSample::default(),
            WalkPattern::Forward => InputSample {
                movement: MovementFlags::FORWARD,
                ..Default::default()
            },
            WalkPattern::Square => {
                let side = [
                    MovementFlags::FORWARD,
                    MovementFlags::LEFT,
                    MovementFlags::BACK,
                    MovementFlags::RIGHT,
                ];
                InputSample {
                    movement: side[(tick / SQUARE_SIDE_TICKS % 4) as usize],
                    ..Default::default()
                }
            }
            WalkPattern::Spin => InputSample {
                movement: MovementFlags::FORWARD,
                yaw: (tick % SPIN_PERIOD_TICKS) as f32 / SPIN_PERIOD_TICKS as f32 * TAU,
                pitch: 0.0,
            },
        };
        if self.sprint && !sample.movement.is_empty() {
            sample.movement |= MovementFlags::SPRINT;
        }
        sample
    }

    pub fn into_source(mut self) -> impl InputSource {
        move || self.next_sample()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_square_cycles_through_sides() {
        let mut script = ScriptedInput::new(WalkPattern::Square);
        let samples: Vec<_> = (0..SQUARE_SIDE_TICKS * 5)
            .map(|_| script.next_sample().movement)
            .collect();
        let side = SQUARE_SIDE_TICKS as usize;
        assert_eq!(samples[0], MovementFlags::FORWARD);
        assert_eq!(samples[side], MovementFlags::LEFT);
        assert_eq!(samples[side * 2], MovementFlags::BACK);
        assert_eq!(samples[side * 3 + 1], MovementFlags::RIGHT);
        assert_eq!(samples[side * 4], MovementFlags::FORWARD);
    }

    #[test]
    fn test_idle_never_sprints() {
        let mut source = ScriptedInput::new(WalkPattern::Idle)
            .sprinting(true)
            .into_source();
        assert!(source.sample().movement.is_empty());
    }

    #[test]
    fn test_spin_turns_full_circle() {
        let mut script = ScriptedInput::new(WalkPattern::Spin).sprinting(true);
        let first = script.next_sample();
        assert_eq!(first.yaw, 0.0);
        assert!(first.movement.contains(MovementFlags::FORWARD | MovementFlags::SPRINT));

        let half = (1..SPIN_PERIOD_TICKS / 2)
            .map(|_| script.next_sample())
            .last()
            .unwrap();
        assert!(half.yaw < TAU / 2.0 && half.yaw > TAU / 2.0 - 0.1);
    }
}
