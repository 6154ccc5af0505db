pub mod aggregator;
pub mod capture;
pub mod input;
pub mod prediction;
pub mod sequence;
pub mod snapshot;

pub use aggregator::{
    AggregatorConfig, AggregatorStats, Closure, ReadyBundle, StateAggregator, StateBundle,
};
pub use capture::InputCapture;
pub use input::{InputSample, InputSource, InputState, MovementFlags};
pub use prediction::{
    ClientPrediction, DEFAULT_TOLERANCE, MAX_OUTBOX, PredictionStats, Reconciliation,
};
pub use sequence::Sequence;
pub use snapshot::{ConfirmationSnapshot, PlayerState};

pub type UserId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("stale sequence {sequence} (cursor at {cursor})")]
    StaleSequence { sequence: Sequence, cursor: Sequence },
    #[error("input from user {0} who is not on the roster")]
    UnknownUser(UserId),
}
