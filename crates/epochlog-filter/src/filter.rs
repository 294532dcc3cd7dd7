//! Filters: the raw query shape accepted from the query layer and
//! the validated, normalized form the engine evaluates.
//!
//! [`FilterSpec::normalize`] is the only place hex text is accepted. Everything
//! past it works on fixed-width values.

use std::fmt::Display;
use std::str::FromStr;

use alloy::primitives::{Address, B256};
use epochlog_index::LogEntry;
use serde::{Deserialize, Serialize};

use crate::epoch::EpochTag;
use crate::error::ValidationError;

/// Maximum number of topic positions a filter may constrain.
pub const MAX_TOPICS: usize = 4;

/// A JSON value that is either a single string or a list of strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrArray {
    Single(String),
    Multiple(Vec<String>),
}

impl StringOrArray {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrArray::Single(value) => vec![value],
            StringOrArray::Multiple(values) => values,
        }
    }
}

/// Result limit as it appears on the wire: a JSON number or a numeric string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawLimit {
    Number(serde_json::Number),
    Text(String),
}

/// Filter as received from the query layer, before validation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawFilter {
    pub from_epoch: Option<String>,
    pub to_epoch: Option<String>,
    pub block_hashes: Option<Vec<String>>,
    pub address: Option<StringOrArray>,
    pub topics: Option<Vec<Option<StringOrArray>>>,
    pub limit: Option<RawLimit>,
}

/// Portion of the index a query targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterScope {
    EpochRange { from: EpochTag, to: EpochTag },
    /// Sorted and deduplicated; never empty.
    BlockSet(Vec<B256>),
}

impl Default for FilterScope {
    fn default() -> Self {
        FilterScope::EpochRange {
            from: EpochTag::Earliest,
            to: EpochTag::LatestState,
        }
    }
}

/// Constraint on a single topic position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopicPattern {
    /// Matches any value, including a missing topic.
    Any,
    Exact(B256),
    /// Any of the listed words. [`TopicPattern::one_of`] keeps these sorted
    /// and deduplicated; matching does not depend on it.
    OneOf(Vec<B256>),
}

impl TopicPattern {
    /// Builds the narrowest pattern accepting any of `words`.
    ///
    /// No words means no constraint; a single word is an exact match.
    pub fn one_of(words: impl IntoIterator<Item = B256>) -> Self {
        let mut words: Vec<B256> = words.into_iter().collect();
        words.sort_unstable();
        words.dedup();
        match words.len() {
            0 => TopicPattern::Any,
            1 => TopicPattern::Exact(words[0]),
            _ => TopicPattern::OneOf(words),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, TopicPattern::Any)
    }

    /// Whether a log topic at this position satisfies the pattern.
    pub fn matches(&self, topic: Option<&B256>) -> bool {
        match (self, topic) {
            (TopicPattern::Any, _) => true,
            (_, None) => false,
            (TopicPattern::Exact(word), Some(topic)) => word == topic,
            (TopicPattern::OneOf(words), Some(topic)) => words.contains(topic),
        }
    }

    /// Words this pattern accepts; empty for [`TopicPattern::Any`].
    pub fn words(&self) -> &[B256] {
        match self {
            TopicPattern::Any => &[],
            TopicPattern::Exact(word) => std::slice::from_ref(word),
            TopicPattern::OneOf(words) => words,
        }
    }
}

impl From<B256> for TopicPattern {
    fn from(word: B256) -> Self {
        TopicPattern::Exact(word)
    }
}

/// Validated, normalized filter.
///
/// Specs built through [`FilterSpec::normalize`] or the `with_*` builders keep
/// `addresses` sorted and deduplicated, and `topics` at most [`MAX_TOPICS`]
/// positions with no trailing [`TopicPattern::Any`]. Matching holds for specs
/// assembled field by field as well.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterSpec {
    pub scope: FilterScope,
    /// Empty matches any address.
    pub addresses: Vec<Address>,
    pub topics: Vec<TopicPattern>,
    /// Keep only the last `limit` matches.
    pub limit: Option<usize>,
}

impl FilterSpec {
    /// Filter over an epoch range.
    pub fn epoch_range(from: impl Into<EpochTag>, to: impl Into<EpochTag>) -> Self {
        Self {
            scope: FilterScope::EpochRange {
                from: from.into(),
                to: to.into(),
            },
            ..Self::default()
        }
    }

    /// Filter over an explicit block set, in any order and with duplicates.
    pub fn block_set(hashes: impl IntoIterator<Item = B256>) -> Result<Self, ValidationError> {
        let mut hashes: Vec<B256> = hashes.into_iter().collect();
        if hashes.is_empty() {
            return Err(ValidationError::EmptyBlockSet);
        }
        hashes.sort_unstable();
        hashes.dedup();
        Ok(Self {
            scope: FilterScope::BlockSet(hashes),
            ..Self::default()
        })
    }

    pub fn with_addresses(mut self, addresses: impl IntoIterator<Item = Address>) -> Self {
        self.addresses.extend(addresses);
        self.addresses.sort_unstable();
        self.addresses.dedup();
        self
    }

    pub fn with_topics(mut self, topics: Vec<TopicPattern>) -> Result<Self, ValidationError> {
        if topics.len() > MAX_TOPICS {
            return Err(ValidationError::TooManyTopics(topics.len()));
        }
        self.topics = trim_trailing_any(topics);
        Ok(self)
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Validates and normalizes a raw filter.
    ///
    /// With neither epochs nor block hashes the scope defaults to
    /// `earliest..=latest_state`; a missing endpoint takes the same default.
    pub fn normalize(raw: RawFilter) -> Result<Self, ValidationError> {
        let RawFilter {
            from_epoch,
            to_epoch,
            block_hashes,
            address,
            topics,
            limit,
        } = raw;

        let topics = topics.unwrap_or_default();
        if topics.len() > MAX_TOPICS {
            return Err(ValidationError::TooManyTopics(topics.len()));
        }

        let limit = limit.map(parse_limit).transpose()?;

        let scope = match block_hashes {
            Some(_) if from_epoch.is_some() || to_epoch.is_some() => {
                return Err(ValidationError::ConflictingScope);
            }
            Some(hashes) => {
                let hashes = hashes
                    .iter()
                    .map(|value| {
                        parse_word::<B256>(value).map_err(|reason| ValidationError::InvalidBlockHash {
                            value: value.clone(),
                            reason,
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Self::block_set(hashes)?.scope
            }
            None => FilterScope::EpochRange {
                from: from_epoch
                    .as_deref()
                    .map(str::parse::<EpochTag>)
                    .transpose()?
                    .unwrap_or(EpochTag::Earliest),
                to: to_epoch
                    .as_deref()
                    .map(str::parse::<EpochTag>)
                    .transpose()?
                    .unwrap_or(EpochTag::LatestState),
            },
        };

        let addresses = address
            .map(StringOrArray::into_vec)
            .unwrap_or_default()
            .iter()
            .map(|value| {
                parse_word::<Address>(value).map_err(|reason| ValidationError::InvalidAddress {
                    value: value.clone(),
                    reason,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let topics = topics
            .into_iter()
            .enumerate()
            .map(|(position, slot)| {
                let words = slot
                    .map(StringOrArray::into_vec)
                    .unwrap_or_default()
                    .iter()
                    .map(|value| {
                        parse_word::<B256>(value).map_err(|reason| ValidationError::InvalidTopic {
                            position,
                            value: value.clone(),
                            reason,
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(TopicPattern::one_of(words))
            })
            .collect::<Result<Vec<_>, ValidationError>>()?;

        let mut spec = Self {
            scope,
            ..Self::default()
        }
        .with_addresses(addresses)
        .with_topics(topics)?;
        spec.limit = limit;
        Ok(spec)
    }

    /// Whether `log` passes the address and topic predicates.
    pub fn matches(&self, log: &LogEntry) -> bool {
        if !self.addresses.is_empty() && !self.addresses.contains(&log.address) {
            return false;
        }
        self.topics
            .iter()
            .enumerate()
            .all(|(position, pattern)| pattern.matches(log.topics.get(position)))
    }
}

fn trim_trailing_any(mut topics: Vec<TopicPattern>) -> Vec<TopicPattern> {
    while topics.last().is_some_and(TopicPattern::is_any) {
        topics.pop();
    }
    topics
}

/// Parses `0x`-prefixed hex of exactly the target width.
fn parse_word<T>(value: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: Display,
{
    if !value.starts_with("0x") && !value.starts_with("0X") {
        return Err("missing 0x prefix".to_string());
    }
    value.parse::<T>().map_err(|e| e.to_string())
}

fn parse_limit(raw: RawLimit) -> Result<usize, ValidationError> {
    let value = match &raw {
        RawLimit::Number(number) => number.as_u64(),
        RawLimit::Text(text) => match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(hex) if !hex.is_empty() => u64::from_str_radix(hex, 16).ok(),
            Some(_) => None,
            None if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) => {
                text.parse().ok()
            }
            None => None,
        },
    };

    let value = value.ok_or_else(|| {
        ValidationError::InvalidLimit(match raw {
            RawLimit::Number(number) => number.to_string(),
            RawLimit::Text(text) => text,
        })
    })?;
    Ok(usize::try_from(value).unwrap_or(usize::MAX))
}
