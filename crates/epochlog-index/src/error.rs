//! Write-path errors reported back to the execution layer.

use alloy::primitives::B256;
use thiserror::Error;

use crate::types::{BlockPosition, EpochNumber};

/// Rejected index write. A rejected write leaves committed data untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("block {0} is already recorded")]
    DuplicateBlock(B256),

    #[error(
        "epoch {epoch} precedes executed epoch {highest} by more than the reorg tolerance ({tolerance})"
    )]
    OutOfOrderEpoch {
        epoch: EpochNumber,
        highest: EpochNumber,
        tolerance: u64,
    },

    #[error("epoch {epoch} already has pivot block {existing}, refusing {rejected}")]
    PivotConflict {
        epoch: EpochNumber,
        existing: B256,
        rejected: B256,
    },

    #[error("pivot of epoch {pending} is not executed, refusing to execute past it at epoch {executed}")]
    PivotNotExecuted {
        pending: EpochNumber,
        executed: EpochNumber,
    },

    #[error("block {hash} was announced at {announced:?} but executed at {executed:?}")]
    PositionMismatch {
        hash: B256,
        announced: BlockPosition,
        executed: BlockPosition,
    },
}
