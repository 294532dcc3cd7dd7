//! epochlog-filter: log filter evaluation over a [`epochlog_index::ReceiptIndex`].
//!
//! A query flows raw filter -> [`FilterSpec::normalize`] -> [`FilterEngine::evaluate`],
//! which resolves the scope (epoch tags or block hashes), walks blocks in
//! canonical order and returns the matching logs, optionally only the last `limit`.

pub mod bloom;
pub mod engine;
pub mod epoch;
pub mod error;
pub mod filter;

pub use engine::{evaluate_at, FilterEngine};
pub use epoch::{EpochResolver, EpochTag};
pub use error::{FilterError, ValidationError};
pub use filter::{FilterScope, FilterSpec, RawFilter, RawLimit, StringOrArray, TopicPattern};
