use glam::{IVec3, Vec3};
use serde::{Deserialize, Serialize};

use super::cache::BlockSource;
use crate::net::DEFAULT_TICK_INTERVAL_MS;
use crate::sync::input::{InputState, MovementFlags};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfig {
    /// Blocks per second.
    pub walk_speed: f32,
    pub sprint_multiplier: f32,
    pub vertical_speed: f32,
    pub player_height: f32,
    pub tick_interval_ms: u64,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            walk_speed: 20.0,
            sprint_multiplier: 2.0,
            vertical_speed: 20.0,
            player_height: 1.8,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
        }
    }
}

impl MovementConfig {
    pub fn dt(&self) -> f32 {
        self.tick_interval_ms as f32 / 1000.0
    }
}

/// Position and view of one player, with the feet at `position`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlayerBody {
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
}

impl PlayerBody {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }
}

/// Advances `body` by one tick of `input`. Client prediction, replay and the
/// server all call this, so it must stay deterministic.
pub fn apply_input<B: BlockSource + ?Sized>(
    body: &mut PlayerBody,
    input: &InputState,
    config: &MovementConfig,
    world: &B,
) {
    body.yaw = input.yaw;
    body.pitch = input.pitch;

    let delta = movement_delta(input, config);
    for axis in 0..3 {
        if delta[axis] == 0.0 {
            continue;
        }
        let mut candidate = body.position;
        candidate[axis] += delta[axis];
        if !collides(candidate, config.player_height, world) {
            body.position = candidate;
        }
    }
}

fn movement_delta(input: &InputState, config: &MovementConfig) -> Vec3 {
    let flags = input.movement;
    let axis = |positive: MovementFlags, negative: MovementFlags| -> f32 {
        flags.contains(positive) as i32 as f32 - flags.contains(negative) as i32 as f32
    };

    let local = Vec3::new(
        axis(MovementFlags::LEFT, MovementFlags::RIGHT),
        0.0,
        axis(MovementFlags::FORWARD, MovementFlags::BACK),
    );
    let vertical = axis(MovementFlags::UP, MovementFlags::DOWN);

    let mut speed = config.walk_speed;
    if flags.contains(MovementFlags::SPRINT) {
        speed *= config.sprint_multiplier;
    }
    let dt = config.dt();

    let horizontal = local_to_world_direction(local, input.yaw) * speed * dt;
    Vec3::new(horizontal.x, vertical * config.vertical_speed * dt, horizontal.z)
}

fn local_to_world_direction(local: Vec3, yaw: f32) -> Vec3 {
    if local.length_squared() < 0.001 {
        return Vec3::ZERO;
    }

    let normalized = local.normalize();
    let (sin_yaw, cos_yaw) = yaw.sin_cos();

    Vec3::new(
        normalized.x * cos_yaw + normalized.z * sin_yaw,
        0.0,
        -normalized.x * sin_yaw + normalized.z * cos_yaw,
    )
}

fn collides<B: BlockSource + ?Sized>(feet: Vec3, height: f32, world: &B) -> bool {
    let base = feet.floor().as_ivec3();
    let top = (feet.y + height - 0.001).floor() as i32;
    (base.y..=top).any(|y| world.block_at(IVec3::new(base.x, y, base.z)).is_solid())
}
