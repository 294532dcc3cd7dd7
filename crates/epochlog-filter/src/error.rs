//! Query-path errors.

use alloy::primitives::B256;
use epochlog_index::EpochNumber;
use thiserror::Error;

/// Malformed filter shape or value. Raised before any scan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("filter has {0} topic positions, at most 4 are allowed")]
    TooManyTopics(usize),

    #[error("invalid limit {0:?}: expected a non-negative integer")]
    InvalidLimit(String),

    #[error("block hash set must not be empty")]
    EmptyBlockSet,

    #[error("block hashes cannot be combined with an epoch range")]
    ConflictingScope,

    #[error("invalid epoch tag {0:?}")]
    InvalidEpochTag(String),

    #[error("invalid address {value:?}: {reason}")]
    InvalidAddress { value: String, reason: String },

    #[error("invalid topic {value:?} at position {position}: {reason}")]
    InvalidTopic {
        position: usize,
        value: String,
        reason: String,
    },

    #[error("invalid block hash {value:?}: {reason}")]
    InvalidBlockHash { value: String, reason: String },
}

/// Failed filter evaluation. No partial results accompany any variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("epoch {epoch} does not exist (latest mined epoch is {latest_mined})")]
    EpochNotFound {
        epoch: EpochNumber,
        latest_mined: EpochNumber,
    },

    #[error("epoch {epoch} is not executed yet (latest executed epoch is {latest_state})")]
    EpochNotExecuted {
        epoch: EpochNumber,
        latest_state: EpochNumber,
    },

    #[error("invalid epoch range: from {from} is greater than to {to}")]
    InvalidRange { from: EpochNumber, to: EpochNumber },

    #[error("epoch range {from}..={to} spans more than {max} epochs")]
    RangeTooLarge {
        from: EpochNumber,
        to: EpochNumber,
        max: u64,
    },

    #[error("{} block(s) not executed yet", .0.len())]
    BlocksNotExecuted(Vec<B256>),

    #[error("unknown block {0}")]
    UnknownBlock(B256),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("filter evaluation aborted")]
    Aborted,
}

impl FilterError {
    /// Whether the same query may succeed once execution progresses.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FilterError::BlocksNotExecuted(_) | FilterError::EpochNotExecuted { .. }
        )
    }
}
