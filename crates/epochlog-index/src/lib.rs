//! epochlog-index: receipt index for executed blocks.
//!
//! Append-only, versioned store of per-block receipts and their logs, keyed by
//! block hash and by epoch, plus an optional SQLite archive to rebuild it.

pub mod config;
pub mod error;
pub mod index;
pub mod store;
pub mod types;

pub use config::IndexConfig;
pub use error::IndexError;
pub use index::{
    BlockLookup, ChainMarks, EpochBlocks, ExecutionListener, IndexSnapshot, IndexStats,
    ReceiptIndex,
};
pub use types::{
    BlockPosition, EmittedLog, EpochNumber, ExecutedBlock, LogEntry, OutcomeStatus, Receipt,
    TransactionOutcome,
};
