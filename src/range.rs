//! Range strategies: expanding one logical task into per-shard instances.
//!
//! A range token partitions a task's subject space. The hash strategy splits
//! the 16 hex digits into contiguous chunks, one per resource, so a subject is
//! routed to the instance whose token contains the first hex digit of the
//! subject key's digest. The unique-id strategy emits a single token naming one
//! subject instance.

use crate::error::{PrismError, Result};
use serde::{Deserialize, Serialize};

/// The full shard alphabet: first hex characters of a digest.
pub const HEX_ALPHABET: &str = "0123456789abcdef";

/// Maximum number of parallel resources the hash strategy can split into.
pub const MAX_HASH_RESOURCES: u32 = 16;

/// Configuration-facing strategy selector; resolved against a task class's
/// resources or subject uid to build the concrete `RangeStrategy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RangeStrategyKind {
    #[default]
    Hash,
    UniqueId,
}

/// How one logical task expands into concrete range tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeStrategy {
    /// Split the hex alphabet into `resources` contiguous chunks.
    Hash { resources: u32 },
    /// One instance for a single subject, identified by `uid`.
    UniqueId { uid: String },
}

impl RangeStrategy {
    /// Produce the range tokens, one task instance per token.
    ///
    /// Hash chunk sizes are recomputed greedily: each chunk takes
    /// ceil(remaining_chars / remaining_resources), so with 3 resources the
    /// alphabet splits as ["012345", "6789a", "bcdef"].
    pub fn calculate(&self) -> Result<Vec<String>> {
        match self {
            RangeStrategy::Hash { resources } => {
                if *resources < 1 || *resources > MAX_HASH_RESOURCES {
                    return Err(PrismError::Validation(format!(
                        "hash range strategy needs between 1 and {} resources, got {}",
                        MAX_HASH_RESOURCES, resources
                    )));
                }
                let mut rest = HEX_ALPHABET;
                let mut ranges = Vec::with_capacity(*resources as usize);
                for taken in 0..*resources {
                    let rest_resources = (*resources - taken) as usize;
                    let chunk = rest.len().div_ceil(rest_resources);
                    let (head, tail) = rest.split_at(chunk);
                    ranges.push(head.to_string());
                    rest = tail;
                }
                Ok(ranges)
            }
            RangeStrategy::UniqueId { uid } => {
                if uid.is_empty() {
                    return Err(PrismError::Validation(
                        "unique-id range strategy needs a non-empty uid".to_string(),
                    ));
                }
                Ok(vec![uid.clone()])
            }
        }
    }
}
