use std::collections::VecDeque;

use glam::Vec3;

use super::UserId;
use super::input::InputState;
use super::sequence::Sequence;
use super::snapshot::ConfirmationSnapshot;
use crate::world::{BlockSource, MovementConfig, PlayerBody, apply_input};

/// Outbox capacity; keeps every retained sequence well inside the
/// wraparound comparison window.
pub const MAX_OUTBOX: usize = 64;
pub const DEFAULT_TOLERANCE: f32 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reconciliation {
    /// The live body was snapped; `error` is replayed minus predicted position.
    Corrected { error: Vec3 },
    WithinTolerance,
    /// Older than a snapshot already reconciled against, within the outbox
    /// window.
    Stale,
    /// The snapshot carries no state for the local user.
    NotPresent,
}

#[derive(Debug, Clone, Default)]
pub struct PredictionStats {
    pub inputs_applied: u64,
    pub reconciliations: u64,
    pub corrections: u64,
    pub stale_snapshots: u64,
    pub outbox_evictions: u64,
}

/// Client-side prediction state: the outbox of unconfirmed inputs and the
/// live body they have been applied to. Shared between the input thread and
/// the reconciliation thread behind one mutex.
#[derive(Debug)]
pub struct ClientPrediction {
    user_id: UserId,
    outbox: VecDeque<InputState>,
    live: PlayerBody,
    movement: MovementConfig,
    tolerance: f32,
    last_reconciled: Option<Sequence>,
    stats: PredictionStats,
}

impl ClientPrediction {
    pub fn new(
        user_id: UserId,
        spawn: PlayerBody,
        movement: MovementConfig,
        tolerance: f32,
    ) -> Self {
        Self {
            user_id,
            outbox: VecDeque::with_capacity(MAX_OUTBOX),
            live: spawn,
            movement,
            tolerance,
            last_reconciled: None,
            stats: PredictionStats::default(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn live(&self) -> PlayerBody {
        self.live
    }

    pub fn outbox(&self) -> impl Iterator<Item = &InputState> {
        self.outbox.iter()
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    pub fn last_reconciled(&self) -> Option<Sequence> {
        self.last_reconciled
    }

    pub fn stats(&self) -> &PredictionStats {
        &self.stats
    }

    /// Records `input` as unconfirmed and applies it to the live body.
    pub fn apply_local<B: BlockSource + ?Sized>(&mut self, input: InputState, world: &B) {
        if self.outbox.len() >= MAX_OUTBOX {
            self.outbox.pop_front();
            self.stats.outbox_evictions += 1;
        }
        self.outbox.push_back(input);
        apply_input(&mut self.live, &input, &self.movement, world);
        self.stats.inputs_applied += 1;
    }

    /// Replays unconfirmed inputs on top of the authoritative state in
    /// `snapshot` and snaps the live body when the result diverges by more
    /// than the tolerance on any axis. Reconciling the same snapshot again
    /// with no new inputs changes nothing.
    pub fn reconcile<B: BlockSource + ?Sized>(
        &mut self,
        snapshot: &ConfirmationSnapshot,
        world: &B,
    ) -> Reconciliation {
        let confirmed = snapshot.sequence;
        if let Some(last) = self.last_reconciled {
            // further back than the outbox reaches is a long gap that wrapped,
            // not a reordered datagram
            let behind = last.diff(confirmed);
            if behind > 0 && behind as usize <= MAX_OUTBOX {
                self.stats.stale_snapshots += 1;
                return Reconciliation::Stale;
            }
        }
        let Some(authoritative) = snapshot.player(self.user_id) else {
            return Reconciliation::NotPresent;
        };

        self.last_reconciled = Some(confirmed);
        self.stats.reconciliations += 1;

        while self
            .outbox
            .front()
            .is_some_and(|input| !input.sequence.is_newer_than(confirmed))
        {
            self.outbox.pop_front();
        }

        let mut scratch = authoritative.body();
        for input in &self.outbox {
            apply_input(&mut scratch, input, &self.movement, world);
        }

        let error = scratch.position - self.live.position;
        if error.abs().max_element() > self.tolerance {
            self.live.position = scratch.position;
            self.stats.corrections += 1;
            log::debug!(
                "reconciled against {confirmed}: corrected by {error} after replaying {} inputs",
                self.outbox.len()
            );
            Reconciliation::Corrected { error }
        } else {
            Reconciliation::WithinTolerance
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::input::MovementFlags;
    use crate::sync::snapshot::PlayerState;
    use crate::world::WorldCache;

    const USER: UserId = 1;

    fn input(sequence: u8, movement: MovementFlags) -> InputState {
        InputState {
            sequence: Sequence(sequence),
            movement,
            ..Default::default()
        }
    }

    fn snapshot(sequence: u8, position: Vec3) -> ConfirmationSnapshot {
        ConfirmationSnapshot {
            sequence: Sequence(sequence),
            players: vec![PlayerState {
                user_id: USER,
                position,
                yaw: 0.0,
                pitch: 0.0,
            }],
        }
    }

    fn prediction() -> ClientPrediction {
        ClientPrediction::new(
            USER,
            PlayerBody::default(),
            MovementConfig::default(),
            DEFAULT_TOLERANCE,
        )
    }

    #[test]
    fn test_clean_round_trip_needs_no_correction() {
        let world = WorldCache::new();
        let mut prediction = prediction();
        prediction.apply_local(input(5, MovementFlags::FORWARD), &world);
        assert_eq!(prediction.live().position, Vec3::new(0.0, 0.0, 1.0));

        let result = prediction.reconcile(&snapshot(5, Vec3::new(0.0, 0.0, 1.0)), &world);
        assert_eq!(result, Reconciliation::WithinTolerance);
        assert_eq!(prediction.outbox_len(), 0);
    }

    #[test]
    fn test_divergence_snaps_to_authoritative() {
        let world = WorldCache::new();
        let mut prediction = ClientPrediction::new(
            USER,
            PlayerBody::at(Vec3::new(0.0, 0.0, 5.0)),
            MovementConfig::default(),
            DEFAULT_TOLERANCE,
        );

        let result = prediction.reconcile(&snapshot(9, Vec3::new(0.0, 0.0, 4.6)), &world);
        match result {
            Reconciliation::Corrected { error } => assert!((error.z + 0.4).abs() < 1e-5),
            other => panic!("expected a correction, got {other:?}"),
        }
        assert_eq!(prediction.live().position, Vec3::new(0.0, 0.0, 4.6));

        // small drift is left alone
        let result = prediction.reconcile(&snapshot(10, Vec3::new(0.0, 0.0, 4.8)), &world);
        assert_eq!(result, Reconciliation::WithinTolerance);
        assert_eq!(prediction.live().position, Vec3::new(0.0, 0.0, 4.6));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let world = WorldCache::new();
        let mut prediction = prediction();
        for seq in 1..=4 {
            prediction.apply_local(input(seq, MovementFlags::FORWARD), &world);
        }

        // server only saw two ticks and placed us slightly off
        let confirmation = snapshot(2, Vec3::new(0.5, 0.0, 2.0));
        assert!(matches!(
            prediction.reconcile(&confirmation, &world),
            Reconciliation::Corrected { .. }
        ));
        let after_first = prediction.live();
        let outbox_after_first: Vec<_> = prediction.outbox().copied().collect();

        assert_eq!(prediction.reconcile(&confirmation, &world), Reconciliation::WithinTolerance);
        assert_eq!(prediction.live(), after_first);
        assert_eq!(prediction.outbox().copied().collect::<Vec<_>>(), outbox_after_first);
    }

    #[test]
    fn test_replays_only_newer_inputs() {
        let world = WorldCache::new();
        let mut prediction = prediction();
        for seq in 5..=9 {
            prediction.apply_local(input(seq, MovementFlags::FORWARD), &world);
        }

        prediction.reconcile(&snapshot(7, Vec3::new(0.0, 0.0, 3.0)), &world);
        let remaining: Vec<_> = prediction.outbox().map(|i| i.sequence).collect();
        assert_eq!(remaining, vec![Sequence(8), Sequence(9)]);
        // 3 confirmed + 2 replayed matches the 5 predicted ticks
        assert_eq!(prediction.live().position, Vec3::new(0.0, 0.0, 5.0));
    }

    #[test]
    fn test_stale_and_foreign_snapshots_ignored() {
        let world = WorldCache::new();
        let mut prediction = prediction();
        prediction.apply_local(input(10, MovementFlags::FORWARD), &world);
        prediction.apply_local(input(11, MovementFlags::FORWARD), &world);

        prediction.reconcile(&snapshot(10, Vec3::new(0.0, 0.0, 1.0)), &world);
        assert_eq!(prediction.reconcile(&snapshot(9, Vec3::ZERO), &world), Reconciliation::Stale);
        assert_eq!(prediction.stats().stale_snapshots, 1);

        let other_user = ConfirmationSnapshot {
            sequence: Sequence(11),
            players: vec![],
        };
        assert_eq!(prediction.reconcile(&other_user, &world), Reconciliation::NotPresent);
        assert_eq!(prediction.outbox_len(), 1);
    }

    #[test]
    fn test_confirmations_after_long_gap_are_not_stale() {
        let world = WorldCache::new();
        let mut prediction = prediction();
        prediction.reconcile(&snapshot(0, Vec3::ZERO), &world);

        // nothing confirmed for 130 ticks, then every tick again
        for tick in 130..=257u32 {
            let seq = (tick % 256) as u8;
            let result = prediction.reconcile(&snapshot(seq, Vec3::ZERO), &world);
            assert_ne!(result, Reconciliation::Stale, "tick {tick}");
        }
        assert_eq!(prediction.stats().stale_snapshots, 0);
        assert_eq!(prediction.last_reconciled(), Some(Sequence(1)));

        // a reordered datagram from just before is still stale
        assert_eq!(prediction.reconcile(&snapshot(250, Vec3::ZERO), &world), Reconciliation::Stale);
    }

    #[test]
    fn test_outbox_is_bounded() {
        let world = WorldCache::new();
        let mut prediction = prediction();
        for seq in 0..(MAX_OUTBOX as u8 + 10) {
            prediction.apply_local(input(seq, MovementFlags::empty()), &world);
        }
        assert_eq!(prediction.outbox_len(), MAX_OUTBOX);
        assert_eq!(prediction.outbox().next().map(|i| i.sequence), Some(Sequence(10)));
        assert_eq!(prediction.stats().outbox_evictions, 10);
    }
}
