//! Record storage tiers.
//!
//! Two single-tier stores implement [`RecordStore`]:
//!
//! - **Volatile**: in-memory, bounded, LRU ([`VolatileStore`])
//! - **Durable**: one blob per key on disk ([`DurableStore`])
//!
//! [`TieredCache`] puts the volatile tier in front of the durable one:
//!
//! ```text
//! load:  volatile ──miss──▶ durable ──hit──▶ promote into volatile
//! merge: durable (full merged record) ──▶ volatile
//! clear: both tiers
//! evict: volatile only (silent, durable keeps everything)
//! ```
//!
//! Stores assume their input is normalized; validation of incoming record
//! shapes happens once in [`TieredCache::merge`].

pub mod durable;
pub mod tiered;
pub mod volatile;

pub use durable::{DurableConfig, DurableStats, DurableStore, VacuumReport};
pub use tiered::{CacheConfig, TieredCache, TieredStats};
pub use volatile::{VolatileConfig, VolatileStats, VolatileStore};

use crate::error::CacheResult;
use crate::types::{CacheKey, Record, RecordSet};
use regex::Regex;
use std::collections::{HashMap, HashSet};

/// A single-tier key/value store of normalized records.
pub trait RecordStore: Send + Sync {
    /// Return the records present for `keys`. Missing keys are not an error.
    fn load(&self, keys: &HashSet<CacheKey>) -> CacheResult<HashMap<CacheKey, Record>>;

    /// Deep-merge `records`; return the keys whose stored value changed.
    fn merge(&self, records: &RecordSet) -> CacheResult<HashSet<CacheKey>>;

    /// Remove one record. Returns true if it existed.
    fn remove(&self, key: &CacheKey) -> CacheResult<bool>;

    /// Remove every record whose key matches `pattern`.
    fn remove_matching(&self, pattern: &KeyPattern) -> CacheResult<Vec<CacheKey>>;

    /// Remove everything.
    fn clear(&self) -> CacheResult<()>;

    /// Number of stored records.
    fn len(&self) -> CacheResult<usize>;
}

/// Selects keys for targeted invalidation.
#[derive(Debug, Clone)]
pub enum KeyPattern {
    /// Every record of one type.
    Type(String),
    /// Raw key prefix.
    Prefix(String),
    /// Regular expression matched against the full key string.
    Regex(Regex),
}

impl KeyPattern {
    /// Every record of `type_name`.
    pub fn of_type(type_name: impl Into<String>) -> Self {
        KeyPattern::Type(type_name.into())
    }

    /// Compile a regex pattern.
    pub fn regex(pattern: &str) -> CacheResult<Self> {
        Regex::new(pattern)
            .map(KeyPattern::Regex)
            .map_err(|e| crate::error::CacheError::InvalidKey(format!("{}: {}", pattern, e)))
    }

    /// Check a key against the pattern.
    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            KeyPattern::Type(type_name) => key.type_name() == type_name,
            KeyPattern::Prefix(prefix) => key.as_str().starts_with(prefix.as_str()),
            KeyPattern::Regex(regex) => regex.is_match(key.as_str()),
        }
    }
}
