//! Type definitions for indexed receipts and log entries.

use alloy::primitives::{Address, Bloom, BloomInput, Bytes, B256};
use serde::{Deserialize, Serialize};

/// Consensus epoch number.
pub type EpochNumber = u64;

/// Log as emitted by the execution engine, before it is positioned in a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmittedLog {
    /// Contract that emitted the log.
    pub address: Address,
    /// Indexed topics (0 to 4 words).
    pub topics: Vec<B256>,
    /// Non-indexed log data.
    #[serde(default)]
    pub data: Bytes,
}

/// Execution status of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failure,
}

/// Per-transaction execution outcome handed over by the execution layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOutcome {
    pub transaction_hash: B256,
    pub outcome_status: OutcomeStatus,
    #[serde(default)]
    pub logs: Vec<EmittedLog>,
}

/// Position of a block in canonical order.
///
/// Blocks sort by `(epoch_number, pivot_ordinal)`. Exactly one block per epoch
/// is the pivot; the rest are referees of that epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockPosition {
    /// Epoch the block was executed in.
    pub epoch_number: EpochNumber,
    /// Index of the block within its epoch's execution order.
    pub pivot_ordinal: u32,
    /// Block height.
    pub block_number: u64,
    /// Whether this is the epoch's pivot block.
    pub is_pivot: bool,
}

impl BlockPosition {
    /// Key used to order blocks canonically.
    pub fn canonical_key(&self) -> (EpochNumber, u32) {
        (self.epoch_number, self.pivot_ordinal)
    }
}

/// Indexed log entry with its positional metadata. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Contract that emitted the log.
    pub address: Address,
    /// Indexed topics; the first conventionally identifies the event.
    pub topics: Vec<B256>,
    /// Non-indexed log data.
    pub data: Bytes,
    /// Block that contains the emitting transaction.
    pub block_hash: B256,
    /// Transaction that emitted the log.
    pub transaction_hash: B256,
    /// Epoch the block was executed in.
    pub epoch_number: EpochNumber,
    /// Height of the containing block.
    pub block_number: u64,
    /// Position of the transaction in its block.
    pub transaction_index: u64,
    /// Position of the log within the block (successful receipts only).
    pub log_index: u64,
    /// Position of the log within its transaction.
    pub transaction_log_index: u64,
}

/// Transaction receipt as stored in the index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub outcome_status: OutcomeStatus,
    /// Empty unless the transaction succeeded.
    pub logs: Vec<LogEntry>,
}

impl Receipt {
    pub fn is_success(&self) -> bool {
        self.outcome_status == OutcomeStatus::Success
    }
}

/// A block together with the receipts attached when it executed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutedBlock {
    pub hash: B256,
    pub position: BlockPosition,
    pub receipts: Vec<Receipt>,
    /// Bloom over every log address and topic in the block.
    pub logs_bloom: Bloom,
}

impl ExecutedBlock {
    /// Positions raw outcomes into indexed receipts.
    ///
    /// Logs attached to failed outcomes are dropped, so `log_index` only
    /// counts logs of successful transactions.
    pub fn assemble(hash: B256, position: BlockPosition, outcomes: Vec<TransactionOutcome>) -> Self {
        let mut receipts = Vec::with_capacity(outcomes.len());
        let mut logs_bloom = Bloom::default();
        let mut log_index = 0u64;

        for (tx_index, outcome) in outcomes.into_iter().enumerate() {
            let success = outcome.outcome_status == OutcomeStatus::Success;
            let mut logs = Vec::new();

            if success {
                logs.reserve(outcome.logs.len());
                for (tx_log_index, emitted) in outcome.logs.into_iter().enumerate() {
                    logs_bloom.accrue(BloomInput::Raw(emitted.address.as_slice()));
                    for topic in &emitted.topics {
                        logs_bloom.accrue(BloomInput::Raw(topic.as_slice()));
                    }

                    logs.push(LogEntry {
                        address: emitted.address,
                        topics: emitted.topics,
                        data: emitted.data,
                        block_hash: hash,
                        transaction_hash: outcome.transaction_hash,
                        epoch_number: position.epoch_number,
                        block_number: position.block_number,
                        transaction_index: tx_index as u64,
                        log_index,
                        transaction_log_index: tx_log_index as u64,
                    });
                    log_index += 1;
                }
            }

            receipts.push(Receipt {
                transaction_hash: outcome.transaction_hash,
                transaction_index: tx_index as u64,
                outcome_status: outcome.outcome_status,
                logs,
            });
        }

        Self {
            hash,
            position,
            receipts,
            logs_bloom,
        }
    }

    /// Logs of successful receipts in canonical order.
    pub fn logs(&self) -> impl Iterator<Item = &LogEntry> {
        self.receipts
            .iter()
            .filter(|receipt| receipt.is_success())
            .flat_map(|receipt| receipt.logs.iter())
    }

    pub fn log_count(&self) -> usize {
        self.receipts.iter().map(|receipt| receipt.logs.len()).sum()
    }
}
