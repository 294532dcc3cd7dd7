//! In-memory receipt index with versioned snapshots.
//!
//! One writer path (block execution) appends blocks; any number of readers
//! query through an [`IndexSnapshot`]. Every write is stamped with a commit
//! version and published by bumping [`ChainMarks::version`] last, so a reader
//! holding a snapshot never sees a block committed after it was taken and
//! never sees a block half-recorded.
//!
//! ## Layout
//!
//! - `blocks`: DashMap keyed by block hash, lock-free lookups for block-set queries
//! - `pivots`: epoch -> executed pivot block, walked by epoch-range queries
//! - `marks`: commit version plus the `latest_mined` / `latest_state` epochs
//!
//! Readers only hold a lock for a single map step, never for a whole scan.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use alloy::primitives::B256;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::config::IndexConfig;
use crate::error::IndexError;
use crate::types::{BlockPosition, EpochNumber, ExecutedBlock, TransactionOutcome};

/// Callbacks the execution layer drives the index with.
pub trait ExecutionListener {
    /// A block is known (mined) but not executed yet.
    fn on_block_mined(&self, hash: B256, position: BlockPosition) -> Result<(), IndexError>;

    /// A block executed; its receipts become queryable.
    fn on_block_executed(
        &self,
        hash: B256,
        position: BlockPosition,
        outcomes: Vec<TransactionOutcome>,
    ) -> Result<(), IndexError>;
}

/// Commit version and chain progress, captured together by a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainMarks {
    /// Highest committed write.
    pub version: u64,
    /// Highest epoch with a known pivot block, executed or not.
    pub latest_mined: EpochNumber,
    /// Highest epoch whose pivot block is executed.
    pub latest_state: EpochNumber,
}

/// Result of looking a block up by hash.
#[derive(Clone, Debug)]
pub enum BlockLookup {
    Executed(Arc<ExecutedBlock>),
    /// Known block whose receipts are not available yet.
    NotExecuted(BlockPosition),
    Unknown,
}

/// Counters reported by [`ReceiptIndex::stats`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexStats {
    pub known_blocks: usize,
    pub executed_blocks: usize,
    pub executed_pivots: usize,
    pub receipts: usize,
    pub logs: usize,
    pub marks: ChainMarks,
}

#[derive(Clone)]
struct Execution {
    version: u64,
    block: Arc<ExecutedBlock>,
}

#[derive(Clone)]
struct BlockSlot {
    position: BlockPosition,
    known_since: u64,
    execution: Option<Execution>,
}

#[derive(Default)]
struct WriterState {
    pivot_hashes: HashMap<EpochNumber, B256>,
    /// Announced pivots still waiting for execution.
    pending_pivots: BTreeSet<EpochNumber>,
    highest_executed_pivot: Option<EpochNumber>,
}

/// Append-only store of executed blocks keyed by hash and by epoch.
pub struct ReceiptIndex {
    config: IndexConfig,
    blocks: DashMap<B256, BlockSlot>,
    pivots: RwLock<BTreeMap<EpochNumber, Execution>>,
    marks: RwLock<ChainMarks>,
    writer: Mutex<WriterState>,
}

impl ReceiptIndex {
    pub fn new(config: IndexConfig) -> Self {
        let marks = ChainMarks {
            version: 0,
            latest_mined: config.genesis_epoch,
            latest_state: config.genesis_epoch,
        };
        Self {
            config,
            blocks: DashMap::new(),
            pivots: RwLock::new(BTreeMap::new()),
            marks: RwLock::new(marks),
            writer: Mutex::new(WriterState::default()),
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Current chain marks (not a snapshot; prefer [`ReceiptIndex::snapshot`] for queries).
    pub fn marks(&self) -> ChainMarks {
        *self.marks.read()
    }

    /// Announces a mined block that has not executed yet.
    ///
    /// # Errors
    /// Returns `DuplicateBlock` if the hash is already known, `OutOfOrderEpoch`
    /// if the epoch is too far behind execution, `PivotConflict` if the epoch
    /// already has a different pivot, `PivotNotExecuted` for a pivot below the
    /// highest executed one.
    #[tracing::instrument(skip_all, fields(hash = %hash, epoch = position.epoch_number))]
    pub fn announce_block(&self, hash: B256, position: BlockPosition) -> Result<(), IndexError> {
        let mut writer = self.writer.lock();

        if self.blocks.contains_key(&hash) {
            tracing::warn!("rejecting announcement of known block");
            return Err(IndexError::DuplicateBlock(hash));
        }
        self.check_epoch_order(&writer, position.epoch_number)?;
        if position.is_pivot {
            Self::check_pivot(&writer, hash, position.epoch_number)?;
            let highest = writer
                .highest_executed_pivot
                .filter(|highest| *highest > position.epoch_number);
            if let Some(highest) = highest {
                tracing::warn!(highest, "rejecting pivot announced below execution");
                return Err(IndexError::PivotNotExecuted {
                    pending: position.epoch_number,
                    executed: highest,
                });
            }
        }

        let version = self.marks.read().version + 1;
        self.blocks.insert(
            hash,
            BlockSlot {
                position,
                known_since: version,
                execution: None,
            },
        );
        if position.is_pivot {
            writer.pivot_hashes.insert(position.epoch_number, hash);
            writer.pending_pivots.insert(position.epoch_number);
        }

        let mut marks = self.marks.write();
        marks.version = version;
        if position.is_pivot {
            marks.latest_mined = marks.latest_mined.max(position.epoch_number);
        }
        tracing::debug!(version, "block announced");
        Ok(())
    }

    /// Records the receipts of an executed block and makes them visible.
    ///
    /// The block may or may not have been announced before; if it was, the
    /// recorded position must match the announced one.
    ///
    /// # Errors
    /// Returns `DuplicateBlock` if the block already executed, `PositionMismatch`
    /// if it was announced elsewhere, `OutOfOrderEpoch` or `PivotConflict` as
    /// for [`ReceiptIndex::announce_block`], `PivotNotExecuted` if an announced
    /// pivot of an earlier epoch is still waiting for execution.
    #[tracing::instrument(skip_all, fields(hash = %hash, epoch = position.epoch_number))]
    pub fn record_receipts(
        &self,
        hash: B256,
        position: BlockPosition,
        outcomes: Vec<TransactionOutcome>,
    ) -> Result<Arc<ExecutedBlock>, IndexError> {
        let mut writer = self.writer.lock();

        // Copy out of the map guard before any insert into the same shard.
        let announced = self
            .blocks
            .get(&hash)
            .map(|slot| (slot.position, slot.known_since, slot.execution.is_some()));

        let known_since = match announced {
            Some((_, _, true)) => {
                tracing::warn!("rejecting duplicate execution");
                return Err(IndexError::DuplicateBlock(hash));
            }
            Some((announced, _, false)) if announced != position => {
                return Err(IndexError::PositionMismatch {
                    hash,
                    announced,
                    executed: position,
                });
            }
            Some((_, known_since, false)) => Some(known_since),
            None => None,
        };

        self.check_epoch_order(&writer, position.epoch_number)?;
        if position.is_pivot {
            Self::check_pivot(&writer, hash, position.epoch_number)?;
            // latest_state may only pass epochs whose pivot is executed.
            if let Some(&pending) = writer.pending_pivots.range(..position.epoch_number).next() {
                tracing::warn!(pending, "rejecting pivot above an unexecuted pivot");
                return Err(IndexError::PivotNotExecuted {
                    pending,
                    executed: position.epoch_number,
                });
            }
        }

        let block = Arc::new(ExecutedBlock::assemble(hash, position, outcomes));
        let version = self.marks.read().version + 1;
        let execution = Execution {
            version,
            block: Arc::clone(&block),
        };

        self.blocks.insert(
            hash,
            BlockSlot {
                position,
                known_since: known_since.unwrap_or(version),
                execution: Some(execution.clone()),
            },
        );

        if position.is_pivot {
            self.pivots.write().insert(position.epoch_number, execution);
            writer.pivot_hashes.insert(position.epoch_number, hash);
            writer.pending_pivots.remove(&position.epoch_number);
            writer.highest_executed_pivot = Some(
                writer
                    .highest_executed_pivot
                    .map_or(position.epoch_number, |h| h.max(position.epoch_number)),
            );
        }

        // Publishing the version is what makes the block visible to new snapshots.
        let mut marks = self.marks.write();
        marks.version = version;
        if position.is_pivot {
            marks.latest_mined = marks.latest_mined.max(position.epoch_number);
            marks.latest_state = marks.latest_state.max(position.epoch_number);
        }

        tracing::debug!(
            version,
            receipts = block.receipts.len(),
            logs = block.log_count(),
            "block receipts recorded"
        );
        Ok(block)
    }

    fn check_epoch_order(&self, writer: &WriterState, epoch: EpochNumber) -> Result<(), IndexError> {
        if let Some(highest) = writer.highest_executed_pivot {
            let tolerance = self.config.reorg_tolerance;
            if epoch.saturating_add(tolerance) < highest {
                tracing::warn!(epoch, highest, tolerance, "rejecting out-of-order epoch");
                return Err(IndexError::OutOfOrderEpoch {
                    epoch,
                    highest,
                    tolerance,
                });
            }
        }
        Ok(())
    }

    fn check_pivot(writer: &WriterState, hash: B256, epoch: EpochNumber) -> Result<(), IndexError> {
        match writer.pivot_hashes.get(&epoch) {
            Some(existing) if *existing != hash => Err(IndexError::PivotConflict {
                epoch,
                existing: *existing,
                rejected: hash,
            }),
            _ => Ok(()),
        }
    }

    /// Takes a point-in-time view of the index.
    pub fn snapshot(self: &Arc<Self>) -> IndexSnapshot {
        IndexSnapshot {
            marks: *self.marks.read(),
            index: Arc::clone(self),
        }
    }

    pub fn stats(&self) -> IndexStats {
        let marks = self.marks();
        let mut stats = IndexStats {
            known_blocks: 0,
            executed_blocks: 0,
            executed_pivots: self.pivots.read().len(),
            receipts: 0,
            logs: 0,
            marks,
        };

        for slot in self.blocks.iter() {
            stats.known_blocks += 1;
            if let Some(execution) = &slot.execution {
                stats.executed_blocks += 1;
                stats.receipts += execution.block.receipts.len();
                stats.logs += execution.block.log_count();
            }
        }
        stats
    }
}

impl ExecutionListener for ReceiptIndex {
    fn on_block_mined(&self, hash: B256, position: BlockPosition) -> Result<(), IndexError> {
        self.announce_block(hash, position)
    }

    fn on_block_executed(
        &self,
        hash: B256,
        position: BlockPosition,
        outcomes: Vec<TransactionOutcome>,
    ) -> Result<(), IndexError> {
        self.record_receipts(hash, position, outcomes).map(|_| ())
    }
}

impl std::fmt::Debug for ReceiptIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiptIndex")
            .field("config", &self.config)
            .field("blocks", &self.blocks.len())
            .field("marks", &self.marks())
            .finish()
    }
}

/// Point-in-time view of a [`ReceiptIndex`].
///
/// Cheap to take (one read lock and an `Arc` clone) and cheap to clone.
#[derive(Clone)]
pub struct IndexSnapshot {
    marks: ChainMarks,
    index: Arc<ReceiptIndex>,
}

impl IndexSnapshot {
    pub fn marks(&self) -> ChainMarks {
        self.marks
    }

    pub fn version(&self) -> u64 {
        self.marks.version
    }

    pub fn latest_mined(&self) -> EpochNumber {
        self.marks.latest_mined
    }

    pub fn latest_state(&self) -> EpochNumber {
        self.marks.latest_state
    }

    pub fn config(&self) -> &IndexConfig {
        &self.index.config
    }

    /// Looks up a block as of this snapshot.
    pub fn receipts_for_block(&self, hash: &B256) -> BlockLookup {
        let Some(slot) = self.index.blocks.get(hash) else {
            return BlockLookup::Unknown;
        };
        if slot.known_since > self.marks.version {
            return BlockLookup::Unknown;
        }
        match &slot.execution {
            Some(execution) if execution.version <= self.marks.version => {
                BlockLookup::Executed(Arc::clone(&execution.block))
            }
            _ => BlockLookup::NotExecuted(slot.position),
        }
    }

    /// Lazily walks executed pivot blocks of epochs in `[from, to]`, ascending.
    ///
    /// Epochs without an executed pivot are skipped.
    pub fn receipts_for_epoch_range(&self, from: EpochNumber, to: EpochNumber) -> EpochBlocks {
        EpochBlocks {
            index: Arc::clone(&self.index),
            version: self.marks.version,
            from,
            to,
            cursor: Some(from),
        }
    }
}

impl std::fmt::Debug for IndexSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSnapshot")
            .field("marks", &self.marks)
            .finish()
    }
}

/// Restartable ascending iterator over executed pivot blocks.
pub struct EpochBlocks {
    index: Arc<ReceiptIndex>,
    version: u64,
    from: EpochNumber,
    to: EpochNumber,
    cursor: Option<EpochNumber>,
}

impl EpochBlocks {
    /// Rewinds to the start of the range.
    pub fn restart(&mut self) {
        self.cursor = Some(self.from);
    }
}

impl Iterator for EpochBlocks {
    type Item = Arc<ExecutedBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.cursor?;
        if start > self.to {
            self.cursor = None;
            return None;
        }

        let found = {
            let pivots = self.index.pivots.read();
            pivots
                .range(start..=self.to)
                .find(|(_, execution)| execution.version <= self.version)
                .map(|(epoch, execution)| (*epoch, Arc::clone(&execution.block)))
        };

        match found {
            Some((epoch, block)) => {
                self.cursor = epoch.checked_add(1);
                Some(block)
            }
            None => {
                self.cursor = None;
                None
            }
        }
    }
}
