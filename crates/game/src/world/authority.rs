use std::collections::BTreeMap;

use glam::Vec3;

use super::cache::WorldCache;
use super::movement::{MovementConfig, PlayerBody, apply_input};
use crate::sync::{ConfirmationSnapshot, PlayerState, ReadyBundle, UserId};

/// Server-side state: every player's body plus the chunks collision runs
/// against. Advanced one closed bundle at a time.
#[derive(Debug)]
pub struct AuthoritativeWorld {
    bodies: BTreeMap<UserId, PlayerBody>,
    chunks: WorldCache,
    movement: MovementConfig,
    spawn: Vec3,
}

impl AuthoritativeWorld {
    pub fn new(chunks: WorldCache, movement: MovementConfig, spawn: Vec3) -> Self {
        Self {
            bodies: BTreeMap::new(),
            chunks,
            movement,
            spawn,
        }
    }

    pub fn spawn_position(&self) -> Vec3 {
        self.spawn
    }

    pub fn chunks(&self) -> &WorldCache {
        &self.chunks
    }

    pub fn add_player(&mut self, user: UserId) -> PlayerBody {
        *self
            .bodies
            .entry(user)
            .or_insert_with(|| PlayerBody::at(self.spawn))
    }

    pub fn remove_player(&mut self, user: UserId) -> Option<PlayerBody> {
        self.bodies.remove(&user)
    }

    pub fn player(&self, user: UserId) -> Option<&PlayerBody> {
        self.bodies.get(&user)
    }

    pub fn player_count(&self) -> usize {
        self.bodies.len()
    }

    /// Applies each player's input for the bundle and returns the resulting
    /// confirmation. Inputs from users without a body are ignored.
    pub fn apply_bundle(&mut self, bundle: &ReadyBundle) -> ConfirmationSnapshot {
        for (user, input) in &bundle.inputs {
            if let Some(body) = self.bodies.get_mut(user) {
                apply_input(body, input, &self.movement, &self.chunks);
            }
        }

        ConfirmationSnapshot {
            sequence: bundle.sequence,
            players: self
                .bodies
                .iter()
                .map(|(&user, body)| PlayerState::new(user, body))
                .collect(),
        }
    }
}
