//! Index configuration.

use std::path::Path;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::EpochNumber;

/// Tunables for the receipt index and the queries run against it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexConfig {
    /// Epoch that `earliest` resolves to.
    pub genesis_epoch: EpochNumber,
    /// How far below the highest executed pivot epoch a block may still be recorded.
    pub reorg_tolerance: u64,
    /// Maximum number of epochs a single range query may span. 0 disables the bound.
    pub max_epoch_range: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            genesis_epoch: 0,
            reorg_tolerance: 0,
            max_epoch_range: 0,
        }
    }
}

impl IndexConfig {
    /// Loads a JSON config file. Missing fields take their defaults.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or is not valid config JSON.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config file: {}", path.display()))?;
        serde_json::from_str(&raw)
            .wrap_err_with(|| format!("invalid index config in {}", path.display()))
    }
}
