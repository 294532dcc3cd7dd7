//! Filter evaluation.
//!
//! Every evaluation runs against one [`IndexSnapshot`]: scope errors are
//! raised before the scan, blocks are walked in canonical order, and matches
//! are accumulated either in full or, with a limit, in a fixed-capacity ring
//! holding only the last `limit` entries.

use std::collections::VecDeque;
use std::sync::Arc;

use alloy::primitives::B256;
use epochlog_index::{
    BlockLookup, EpochNumber, ExecutedBlock, IndexSnapshot, LogEntry, ReceiptIndex,
};
use tokio_util::sync::CancellationToken;

use crate::bloom::BloomProbe;
use crate::epoch::{EpochResolver, EpochTag};
use crate::error::{FilterError, ValidationError};
use crate::filter::{FilterScope, FilterSpec, RawFilter};

/// Upper bound on the ring buffer's up-front allocation.
const MAX_PREALLOCATED_TAIL: usize = 1024;

/// Query entry point over a shared [`ReceiptIndex`].
#[derive(Clone, Debug)]
pub struct FilterEngine {
    index: Arc<ReceiptIndex>,
}

impl FilterEngine {
    pub fn new(index: Arc<ReceiptIndex>) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &Arc<ReceiptIndex> {
        &self.index
    }

    /// Resolves a tag against the current chain marks.
    pub fn resolve_epoch_tag(&self, tag: EpochTag) -> Result<EpochNumber, FilterError> {
        let snapshot = self.index.snapshot();
        EpochResolver::new(&snapshot).resolve(tag)
    }

    /// Evaluates `spec` against a fresh snapshot.
    pub fn evaluate(&self, spec: &FilterSpec) -> Result<Vec<LogEntry>, FilterError> {
        self.evaluate_with(spec, &CancellationToken::new())
    }

    /// Like [`FilterEngine::evaluate`], aborting between blocks once `cancel` fires.
    pub fn evaluate_with(
        &self,
        spec: &FilterSpec,
        cancel: &CancellationToken,
    ) -> Result<Vec<LogEntry>, FilterError> {
        evaluate_at(&self.index.snapshot(), spec, cancel)
    }

    /// Normalizes a raw filter, then evaluates it.
    pub fn evaluate_raw(&self, raw: RawFilter) -> Result<Vec<LogEntry>, FilterError> {
        let spec = FilterSpec::normalize(raw)?;
        self.evaluate(&spec)
    }
}

/// Evaluates `spec` against an explicit snapshot.
///
/// # Errors
/// Scope errors (`EpochNotFound`, `EpochNotExecuted`, `InvalidRange`,
/// `RangeTooLarge`, `UnknownBlock`, `BlocksNotExecuted`) are raised before
/// any block is scanned. `Aborted` is returned if `cancel` fires mid-scan.
#[tracing::instrument(skip_all, fields(version = snapshot.version()))]
pub fn evaluate_at(
    snapshot: &IndexSnapshot,
    spec: &FilterSpec,
    cancel: &CancellationToken,
) -> Result<Vec<LogEntry>, FilterError> {
    let probe = BloomProbe::from_spec(spec);
    let mut matches = TailAccumulator::new(spec.limit);

    match &spec.scope {
        FilterScope::EpochRange { from, to } => {
            let (from, to) = EpochResolver::new(snapshot).resolve_range(*from, *to)?;
            tracing::debug!(from, to, "scanning epoch range");
            scan(
                snapshot.receipts_for_epoch_range(from, to),
                spec,
                &probe,
                cancel,
                &mut matches,
            )?;
        }
        FilterScope::BlockSet(hashes) => {
            let blocks = resolve_block_set(snapshot, hashes)?;
            tracing::debug!(blocks = blocks.len(), "scanning block set");
            scan(blocks.into_iter(), spec, &probe, cancel, &mut matches)?;
        }
    }

    let logs = matches.into_vec();
    tracing::debug!(matches = logs.len(), "filter evaluated");
    Ok(logs)
}

/// Looks up every hash and returns the executed blocks in canonical order.
///
/// An unknown hash wins over unexecuted ones; unexecuted blocks fail the whole
/// set, listed in input order.
fn resolve_block_set(
    snapshot: &IndexSnapshot,
    hashes: &[B256],
) -> Result<Vec<Arc<ExecutedBlock>>, FilterError> {
    if hashes.is_empty() {
        return Err(ValidationError::EmptyBlockSet.into());
    }

    let mut blocks = Vec::with_capacity(hashes.len());
    let mut pending = Vec::new();
    for hash in hashes {
        match snapshot.receipts_for_block(hash) {
            BlockLookup::Executed(block) => blocks.push(block),
            BlockLookup::NotExecuted(_) => {
                if !pending.contains(hash) {
                    pending.push(*hash);
                }
            }
            BlockLookup::Unknown => return Err(FilterError::UnknownBlock(*hash)),
        }
    }
    if !pending.is_empty() {
        return Err(FilterError::BlocksNotExecuted(pending));
    }

    blocks.sort_by_key(|block| (block.position.canonical_key(), block.hash));
    let before = blocks.len();
    blocks.dedup_by_key(|block| block.hash);
    if blocks.len() != before {
        tracing::debug!(duplicates = before - blocks.len(), "dropped duplicate block hashes");
    }
    Ok(blocks)
}

fn scan(
    blocks: impl Iterator<Item = Arc<ExecutedBlock>>,
    spec: &FilterSpec,
    probe: &BloomProbe,
    cancel: &CancellationToken,
    matches: &mut TailAccumulator,
) -> Result<(), FilterError> {
    for block in blocks {
        if cancel.is_cancelled() {
            tracing::debug!(block = %block.hash, "evaluation aborted");
            return Err(FilterError::Aborted);
        }
        if !probe.is_trivial() && !probe.might_match(&block.logs_bloom) {
            tracing::trace!(block = %block.hash, "bloom rules out block");
            continue;
        }
        for log in block.logs() {
            if spec.matches(log) {
                matches.push(log.clone());
            }
        }
    }
    Ok(())
}

/// Collects matches in order, keeping only the last `limit` when bounded.
#[derive(Debug)]
pub(crate) enum TailAccumulator {
    Unbounded(Vec<LogEntry>),
    Tail {
        limit: usize,
        ring: VecDeque<LogEntry>,
    },
}

impl TailAccumulator {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        match limit {
            None => TailAccumulator::Unbounded(Vec::new()),
            Some(limit) => TailAccumulator::Tail {
                limit,
                ring: VecDeque::with_capacity(limit.min(MAX_PREALLOCATED_TAIL)),
            },
        }
    }

    pub(crate) fn push(&mut self, log: LogEntry) {
        match self {
            TailAccumulator::Unbounded(logs) => logs.push(log),
            TailAccumulator::Tail { limit, ring } => {
                if *limit == 0 {
                    return;
                }
                if ring.len() == *limit {
                    ring.pop_front();
                }
                ring.push_back(log);
            }
        }
    }

    pub(crate) fn into_vec(self) -> Vec<LogEntry> {
        match self {
            TailAccumulator::Unbounded(logs) => logs,
            TailAccumulator::Tail { ring, .. } => ring.into(),
        }
    }
}
