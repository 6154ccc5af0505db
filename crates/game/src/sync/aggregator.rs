use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use super::input::InputState;
use super::sequence::Sequence;
use super::{SyncError, UserId};

/// Far enough ahead of the newest open bundle that a joining user's first
/// inputs are not already stale when they arrive.
const JOIN_LEAD: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorConfig {
    pub bundle_timeout: Duration,
    pub max_outstanding: usize,
    /// How far behind the cursor an input is still treated as a late
    /// duplicate. Anything further back while nothing is open means the
    /// sender lost a long run of ticks, and the cursor jumps to it.
    pub stale_window: u8,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            bundle_timeout: Duration::from_millis(150),
            max_outstanding: 32,
            stale_window: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    /// Every expected user reported.
    Complete,
    /// Open longer than the bundle timeout.
    Timeout,
    /// Pushed out by a sequence too far ahead.
    Overflow,
}

/// Inputs gathered for one sequence.
#[derive(Debug, Clone)]
pub struct StateBundle {
    pub sequence: Sequence,
    pub expected_user_count: usize,
    pub ready: bool,
    pub created_at: Instant,
    pub states: HashMap<UserId, InputState>,
    expected: HashSet<UserId>,
}

impl StateBundle {
    fn new(sequence: Sequence, expected: HashSet<UserId>, now: Instant) -> Self {
        Self {
            sequence,
            expected_user_count: expected.len(),
            ready: expected.is_empty(),
            created_at: now,
            states: HashMap::new(),
            expected,
        }
    }

    fn refresh_ready(&mut self) {
        let reported = self
            .expected
            .iter()
            .filter(|user| self.states.contains_key(user))
            .count();
        self.ready = reported >= self.expected_user_count;
    }
}

/// A closed bundle ready to advance the authoritative world. Users that did
/// not report carry their last known input, restamped with this sequence.
#[derive(Debug, Clone)]
pub struct ReadyBundle {
    pub sequence: Sequence,
    pub inputs: HashMap<UserId, InputState>,
    pub reported: usize,
    pub closure: Closure,
}

#[derive(Debug, Clone, Default)]
pub struct AggregatorStats {
    pub accepted_inputs: u64,
    pub duplicate_inputs: u64,
    pub stale_inputs: u64,
    pub bundles_completed: u64,
    pub forced_closures: u64,
    pub overflow_closures: u64,
    pub filled_inputs: u64,
    pub resyncs: u64,
}

/// Groups per-user inputs by sequence and releases them strictly in sequence
/// order. Owned by the server tick thread.
#[derive(Debug)]
pub struct StateAggregator {
    config: AggregatorConfig,
    users: HashSet<UserId>,
    cursor: Option<Sequence>,
    bundles: VecDeque<StateBundle>,
    closed: VecDeque<ReadyBundle>,
    last_known: HashMap<UserId, InputState>,
    stats: AggregatorStats,
}

impl StateAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            users: HashSet::new(),
            cursor: None,
            bundles: VecDeque::new(),
            closed: VecDeque::new(),
            last_known: HashMap::new(),
            stats: AggregatorStats::default(),
        }
    }

    pub fn add_user(&mut self, user: UserId) {
        self.users.insert(user);
    }

    /// Forgets `user` and stops waiting for it in bundles it never reported to.
    pub fn remove_user(&mut self, user: UserId) {
        self.users.remove(&user);
        self.last_known.remove(&user);

        for bundle in &mut self.bundles {
            if bundle.expected.remove(&user) {
                bundle.expected_user_count = bundle.expected.len();
                bundle.refresh_ready();
            }
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Next sequence to be consumed, unset until the first input arrives.
    pub fn cursor(&self) -> Option<Sequence> {
        self.cursor
    }

    /// Sequence a newly joined user should start capturing from.
    pub fn join_sequence(&self) -> Sequence {
        let head = match (self.bundles.back(), self.cursor) {
            (Some(newest), _) => newest.sequence,
            (None, Some(cursor)) => cursor,
            (None, None) => return Sequence(0),
        };
        head.offset(JOIN_LEAD)
    }

    pub fn open_bundles(&self) -> usize {
        self.bundles.len()
    }

    pub fn bundle(&self, sequence: Sequence) -> Option<&StateBundle> {
        self.bundles.iter().find(|b| b.sequence == sequence)
    }

    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }

    pub fn receive(
        &mut self,
        user: UserId,
        input: InputState,
        now: Instant,
    ) -> Result<(), SyncError> {
        if !self.users.contains(&user) {
            return Err(SyncError::UnknownUser(user));
        }
        let sequence = input.sequence;
        let cursor = *self.cursor.get_or_insert(sequence);

        let mut offset = sequence.diff(cursor);
        if offset < 0 {
            let behind = offset.unsigned_abs();
            if behind <= self.config.stale_window || !self.bundles.is_empty() {
                self.stats.stale_inputs += 1;
                return Err(SyncError::StaleSequence { sequence, cursor });
            }
            log::info!(
                "input {sequence} from user {user} is {behind} behind {cursor}, resyncing"
            );
            self.cursor = Some(sequence);
            self.stats.resyncs += 1;
            offset = 0;
        }
        let mut offset = offset as usize;

        while offset >= self.config.max_outstanding.max(1) {
            self.force_close_oldest(Closure::Overflow, now);
            offset -= 1;
        }

        while self.bundles.len() <= offset {
            let next = self.next_open_sequence();
            self.bundles
                .push_back(StateBundle::new(next, self.users.clone(), now));
        }

        let bundle = &mut self.bundles[offset];
        if bundle.states.insert(user, input).is_some() {
            self.stats.duplicate_inputs += 1;
        } else {
            self.stats.accepted_inputs += 1;
        }
        bundle.refresh_ready();

        match self.last_known.get(&user) {
            Some(known) if known.sequence.is_newer_than(sequence) => {}
            _ => {
                self.last_known.insert(user, input);
            }
        }
        Ok(())
    }

    fn next_open_sequence(&self) -> Sequence {
        match (self.bundles.back(), self.cursor) {
            (Some(newest), _) => newest.sequence.next(),
            (None, Some(cursor)) => cursor,
            (None, None) => Sequence(0),
        }
    }

    /// Releases every bundle that can be consumed now, oldest first. Stops at
    /// the first bundle that is still waiting and has not timed out.
    pub fn poll_ready(&mut self, now: Instant) -> Vec<ReadyBundle> {
        let mut ready: Vec<ReadyBundle> = self.closed.drain(..).collect();

        while let Some(oldest) = self.bundles.front() {
            let closure = if oldest.ready {
                Closure::Complete
            } else if now.duration_since(oldest.created_at) >= self.config.bundle_timeout {
                Closure::Timeout
            } else {
                break;
            };

            if let Some(bundle) = self.pop_oldest() {
                ready.push(self.close(bundle, closure));
            }
        }
        ready
    }

    fn force_close_oldest(&mut self, closure: Closure, now: Instant) {
        let bundle = match self.pop_oldest() {
            Some(bundle) => bundle,
            // Nothing open yet; the cursor itself becomes an empty bundle.
            None => match self.cursor {
                Some(cursor) => {
                    self.cursor = Some(cursor.next());
                    StateBundle::new(cursor, self.users.clone(), now)
                }
                None => return,
            },
        };
        let closed = self.close(bundle, closure);
        self.closed.push_back(closed);
    }

    fn pop_oldest(&mut self) -> Option<StateBundle> {
        let bundle = self.bundles.pop_front()?;
        self.cursor = Some(bundle.sequence.next());
        Some(bundle)
    }

    fn close(&mut self, bundle: StateBundle, closure: Closure) -> ReadyBundle {
        let reported = bundle.states.len();
        let mut inputs = bundle.states;

        for user in &self.users {
            if inputs.contains_key(user) {
                continue;
            }
            if let Some(known) = self.last_known.get(user) {
                inputs.insert(*user, known.with_sequence(bundle.sequence));
                self.stats.filled_inputs += 1;
            }
        }

        match closure {
            Closure::Complete => self.stats.bundles_completed += 1,
            Closure::Timeout => {
                self.stats.forced_closures += 1;
                log::debug!(
                    "bundle {} timed out with {}/{} reports",
                    bundle.sequence,
                    reported,
                    bundle.expected_user_count
                );
            }
            Closure::Overflow => {
                self.stats.overflow_closures += 1;
                log::debug!(
                    "bundle {} force-closed by overflow with {}/{} reports",
                    bundle.sequence,
                    reported,
                    bundle.expected_user_count
                );
            }
        }

        ReadyBundle {
            sequence: bundle.sequence,
            inputs,
            reported,
            closure,
        }
    }
}
