//! Shared test helpers and utilities.
//!
//! [`TestChain`] drives a receipt index the way the execution layer would:
//! one pivot block per epoch, mined and executed in order, carrying the
//! `Constructed` / `Called` events of a small counter contract.

#![allow(dead_code)]

use std::sync::Arc;

use alloy::primitives::{keccak256, Address, Bytes, B256};
use epochlog_filter::{FilterEngine, RawFilter};
use epochlog_index::store::Store;
use epochlog_index::{
    BlockPosition, EmittedLog, IndexConfig, LogEntry, OutcomeStatus, ReceiptIndex,
    TransactionOutcome,
};

/// Topic of `Constructed(address,address)`, emitted once per deployment.
pub fn constructed_topic() -> B256 {
    keccak256("Constructed(address,address)")
}

/// Topic of `Called(address,uint32)`, emitted once per call.
pub fn called_topic() -> B256 {
    keccak256("Called(address,uint32)")
}

/// Left-pads an address to a topic word.
pub fn address_to_topic(address: Address) -> B256 {
    B256::left_padding_from(address.as_slice())
}

pub fn number_to_topic(number: u64) -> B256 {
    B256::left_padding_from(&number.to_be_bytes())
}

/// Call ordinal carried as the third topic of a `Called` log.
pub fn call_ordinal(log: &LogEntry) -> u64 {
    let word = log.topics[2];
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&word[24..]);
    u64::from_be_bytes(bytes)
}

/// Deserializes a raw filter from JSON, as the query layer would receive it.
pub fn raw_filter(value: serde_json::Value) -> RawFilter {
    serde_json::from_value(value).expect("test filter should deserialize")
}

/// Creates an in-memory SQLite archive.
///
/// # Panics
/// Panics if the in-memory database cannot be created (should never happen).
pub fn test_store() -> Store {
    Store::new(":memory:").expect("in-memory store should always open")
}

/// Counter contract whose calls are numbered from 1.
#[derive(Clone, Copy, Debug)]
pub struct Contract {
    pub address: Address,
    calls: u64,
}

/// In-memory chain with one pivot block per epoch.
pub struct TestChain {
    pub engine: FilterEngine,
    pub sender: Address,
    next_epoch: u64,
    next_tx: u64,
}

impl TestChain {
    pub fn new() -> Self {
        Self::with_config(IndexConfig::default())
    }

    pub fn with_config(config: IndexConfig) -> Self {
        let next_epoch = config.genesis_epoch + 1;
        Self {
            engine: FilterEngine::new(Arc::new(ReceiptIndex::new(config))),
            sender: Address::repeat_byte(0x5e),
            next_epoch,
            next_tx: 0,
        }
    }

    pub fn index(&self) -> &Arc<ReceiptIndex> {
        self.engine.index()
    }

    /// Hash of the pivot block of `epoch`.
    pub fn block_hash(epoch: u64) -> B256 {
        keccak256(epoch.to_be_bytes())
    }

    fn next_position(&mut self) -> BlockPosition {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        BlockPosition {
            epoch_number: epoch,
            pivot_ordinal: 0,
            block_number: epoch,
            is_pivot: true,
        }
    }

    fn next_tx_hash(&mut self) -> B256 {
        self.next_tx += 1;
        keccak256(format!("tx-{}", self.next_tx))
    }

    /// Outcome of deploying a contract: one `Constructed` log with two topics.
    pub fn deploy_outcome(&mut self, contract: &Contract) -> TransactionOutcome {
        TransactionOutcome {
            transaction_hash: self.next_tx_hash(),
            outcome_status: OutcomeStatus::Success,
            logs: vec![EmittedLog {
                address: contract.address,
                topics: vec![constructed_topic(), address_to_topic(self.sender)],
                data: Bytes::copy_from_slice(address_to_topic(self.sender).as_slice()),
            }],
        }
    }

    /// Outcome of calling a contract: one `Called` log with three topics.
    pub fn call_outcome(&mut self, contract: &mut Contract) -> TransactionOutcome {
        contract.calls += 1;
        TransactionOutcome {
            transaction_hash: self.next_tx_hash(),
            outcome_status: OutcomeStatus::Success,
            logs: vec![EmittedLog {
                address: contract.address,
                topics: vec![
                    called_topic(),
                    address_to_topic(self.sender),
                    number_to_topic(contract.calls),
                ],
                data: Bytes::new(),
            }],
        }
    }

    /// Deploys a contract in its own executed block.
    pub fn deploy(&mut self, seed: u8) -> Contract {
        let contract = Contract {
            address: Address::repeat_byte(seed),
            calls: 0,
        };
        let outcome = self.deploy_outcome(&contract);
        self.execute_block(vec![outcome]);
        contract
    }

    /// Calls a contract once in its own executed block.
    pub fn call(&mut self, contract: &mut Contract) -> B256 {
        let outcome = self.call_outcome(contract);
        self.execute_block(vec![outcome])
    }

    /// Records a new executed pivot block.
    pub fn execute_block(&mut self, outcomes: Vec<TransactionOutcome>) -> B256 {
        let position = self.next_position();
        let hash = Self::block_hash(position.epoch_number);
        self.index()
            .record_receipts(hash, position, outcomes)
            .expect("sequential pivot should record");
        hash
    }

    /// Announces a new pivot block without executing it.
    pub fn mine_block(&mut self) -> (B256, BlockPosition) {
        let position = self.next_position();
        let hash = Self::block_hash(position.epoch_number);
        self.index()
            .announce_block(hash, position)
            .expect("sequential pivot should announce");
        (hash, position)
    }

    /// Executes a block previously returned by [`TestChain::mine_block`].
    pub fn execute_mined(
        &self,
        (hash, position): (B256, BlockPosition),
        outcomes: Vec<TransactionOutcome>,
    ) {
        self.index()
            .record_receipts(hash, position, outcomes)
            .expect("announced block should execute");
    }
}

impl Default for TestChain {
    fn default() -> Self {
        Self::new()
    }
}
