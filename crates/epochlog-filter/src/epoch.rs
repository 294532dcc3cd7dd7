//! Symbolic epoch tags and their resolution against an index snapshot.

use std::fmt;
use std::str::FromStr;

use epochlog_index::{EpochNumber, IndexSnapshot};
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, ValidationError};

/// Epoch reference as accepted from callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EpochTag {
    /// Genesis epoch.
    Earliest,
    /// Highest epoch whose pivot block is executed.
    LatestState,
    /// Highest epoch with a known pivot block.
    LatestMined,
    Number(EpochNumber),
}

impl FromStr for EpochTag {
    type Err = ValidationError;

    /// Accepts `earliest`, `latest_state`, `latest_mined`, `0x`-prefixed hex or decimal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidEpochTag(s.to_string());
        match s {
            "earliest" => Ok(EpochTag::Earliest),
            "latest_state" => Ok(EpochTag::LatestState),
            "latest_mined" => Ok(EpochTag::LatestMined),
            _ => {
                if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    if hex.is_empty() {
                        return Err(invalid());
                    }
                    u64::from_str_radix(hex, 16)
                        .map(EpochTag::Number)
                        .map_err(|_| invalid())
                } else if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
                    s.parse().map(EpochTag::Number).map_err(|_| invalid())
                } else {
                    Err(invalid())
                }
            }
        }
    }
}

impl TryFrom<String> for EpochTag {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EpochTag> for String {
    fn from(tag: EpochTag) -> Self {
        tag.to_string()
    }
}

impl fmt::Display for EpochTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpochTag::Earliest => f.write_str("earliest"),
            EpochTag::LatestState => f.write_str("latest_state"),
            EpochTag::LatestMined => f.write_str("latest_mined"),
            EpochTag::Number(n) => write!(f, "{n:#x}"),
        }
    }
}

impl From<EpochNumber> for EpochTag {
    fn from(n: EpochNumber) -> Self {
        EpochTag::Number(n)
    }
}

/// Resolves tags against the chain marks captured by a snapshot.
pub struct EpochResolver<'a> {
    snapshot: &'a IndexSnapshot,
}

impl<'a> EpochResolver<'a> {
    pub fn new(snapshot: &'a IndexSnapshot) -> Self {
        Self { snapshot }
    }

    /// Resolves a single tag.
    ///
    /// # Errors
    /// Returns `EpochNotFound` for explicit numbers outside
    /// `[genesis, latest_mined]`.
    pub fn resolve(&self, tag: EpochTag) -> Result<EpochNumber, FilterError> {
        let genesis = self.snapshot.config().genesis_epoch;
        let latest_mined = self.snapshot.latest_mined();
        match tag {
            EpochTag::Earliest => Ok(genesis),
            EpochTag::LatestState => Ok(self.snapshot.latest_state()),
            EpochTag::LatestMined => Ok(latest_mined),
            EpochTag::Number(n) if n < genesis || n > latest_mined => {
                Err(FilterError::EpochNotFound {
                    epoch: n,
                    latest_mined,
                })
            }
            EpochTag::Number(n) => Ok(n),
        }
    }

    /// Resolves both endpoints of a range query.
    ///
    /// # Errors
    /// Besides [`EpochResolver::resolve`] errors: `EpochNotExecuted` if an
    /// endpoint lies beyond `latest_state`, `InvalidRange` if `from > to`,
    /// `RangeTooLarge` if the range exceeds the configured bound.
    pub fn resolve_range(
        &self,
        from: EpochTag,
        to: EpochTag,
    ) -> Result<(EpochNumber, EpochNumber), FilterError> {
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;

        let latest_state = self.snapshot.latest_state();
        for epoch in [from, to] {
            if epoch > latest_state {
                return Err(FilterError::EpochNotExecuted {
                    epoch,
                    latest_state,
                });
            }
        }

        if from > to {
            return Err(FilterError::InvalidRange { from, to });
        }

        let max = self.snapshot.config().max_epoch_range;
        if max > 0 && to - from >= max {
            return Err(FilterError::RangeTooLarge { from, to, max });
        }

        Ok((from, to))
    }
}
