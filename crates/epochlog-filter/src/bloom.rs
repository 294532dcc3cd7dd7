//! Block-level prefilter over the logs bloom recorded with each executed block.
//!
//! A bloom can only prove absence: when [`BloomProbe::might_match`] is false
//! no log in the block satisfies the filter and the block is skipped. A true
//! result says nothing, the block is scanned as usual.

use alloy::primitives::{Bloom, BloomInput};

use crate::filter::FilterSpec;

/// Precomputed bloom bits for every value a filter constrains.
#[derive(Clone, Debug, Default)]
pub struct BloomProbe {
    /// One-of groups; the block must contain at least one member of each.
    groups: Vec<Vec<Bloom>>,
}

impl BloomProbe {
    pub fn from_spec(spec: &FilterSpec) -> Self {
        let mut groups = Vec::with_capacity(1 + spec.topics.len());

        if !spec.addresses.is_empty() {
            groups.push(
                spec.addresses
                    .iter()
                    .map(|address| single(address.as_slice()))
                    .collect(),
            );
        }
        for pattern in &spec.topics {
            let words = pattern.words();
            if !words.is_empty() {
                groups.push(words.iter().map(|word| single(word.as_slice())).collect());
            }
        }

        Self { groups }
    }

    /// Whether the probe constrains anything at all.
    pub fn is_trivial(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn might_match(&self, bloom: &Bloom) -> bool {
        self.groups
            .iter()
            .all(|group| group.iter().any(|bits| bloom.contains(bits)))
    }
}

fn single(raw: &[u8]) -> Bloom {
    let mut bloom = Bloom::default();
    bloom.accrue(BloomInput::Raw(raw));
    bloom
}
