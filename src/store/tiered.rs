//! Volatile-over-durable record cache.
//!
//! Reads are served from memory when possible and fall through to disk on a
//! miss, promoting what they find. Writes land on disk first and then in
//! memory. A failing disk switches the cache to volatile-only operation for
//! the rest of its life instead of failing reads and writes.

use crate::error::CacheError;
use crate::store::{
    DurableConfig, DurableStats, DurableStore, KeyPattern, RecordStore, VolatileConfig,
    VolatileStats, VolatileStore,
};
use crate::types::{CacheKey, Record, RecordSet};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Tiered cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Volatile tier options
    pub volatile: VolatileConfig,
    /// Durable tier options; `None` runs volatile-only
    pub durable: Option<DurableConfig>,
    /// Capacity of the change broadcast channel
    pub change_channel_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            volatile: VolatileConfig::default(),
            durable: None,
            change_channel_capacity: 256,
        }
    }
}

impl CacheConfig {
    /// Volatile-only configuration.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Volatile tier backed by a durable directory.
    pub fn with_durable(durable: DurableConfig) -> Self {
        Self {
            durable: Some(durable),
            ..Self::default()
        }
    }
}

/// Tiered cache statistics.
#[derive(Debug, Clone, Default)]
pub struct TieredStats {
    pub volatile: VolatileStats,
    pub durable: Option<DurableStats>,
    pub durable_available: bool,
    pub merges: u64,
    pub skipped_records: u64,
    pub memory_evictions: u64,
}

/// Two-tier record cache.
pub struct TieredCache {
    volatile: VolatileStore,
    durable: Option<DurableStore>,
    durable_available: AtomicBool,
    merges: AtomicU64,
    skipped_records: AtomicU64,
    memory_evictions: AtomicU64,
}

impl TieredCache {
    /// Build the cache. A durable tier that cannot be opened is logged and
    /// the cache runs volatile-only.
    pub fn open(config: CacheConfig) -> Self {
        let durable = match config.durable {
            Some(durable_config) => match DurableStore::open(durable_config) {
                Ok(store) => Some(store),
                Err(e) => {
                    warn!(error = %e, "Durable tier unavailable, running volatile-only");
                    None
                }
            },
            None => None,
        };
        let durable_available = durable.is_some();

        Self {
            volatile: VolatileStore::with_config(config.volatile),
            durable,
            durable_available: AtomicBool::new(durable_available),
            merges: AtomicU64::new(0),
            skipped_records: AtomicU64::new(0),
            memory_evictions: AtomicU64::new(0),
        }
    }

    /// The durable tier, while it is still healthy.
    fn durable(&self) -> Option<&DurableStore> {
        if self.durable_available.load(Ordering::Acquire) {
            self.durable.as_ref()
        } else {
            None
        }
    }

    fn durable_failed(&self, operation: &str, error: &CacheError) {
        if self.durable_available.swap(false, Ordering::AcqRel) {
            warn!(
                operation,
                error = %error,
                "Durable tier failed, continuing volatile-only for this session"
            );
        }
    }

    /// Whether the durable tier is still in use.
    pub fn durable_available(&self) -> bool {
        self.durable().is_some()
    }

    /// Load records, volatile first, promoting durable hits.
    pub fn load(&self, keys: &HashSet<CacheKey>) -> HashMap<CacheKey, Record> {
        let mut found = self.volatile.load(keys).unwrap_or_default();
        if found.len() == keys.len() {
            return found;
        }

        let Some(durable) = self.durable() else {
            return found;
        };

        let missing: HashSet<CacheKey> = keys
            .iter()
            .filter(|key| !found.contains_key(*key))
            .cloned()
            .collect();

        match durable.load(&missing) {
            Ok(promoted) => {
                if !promoted.is_empty() {
                    trace!(count = promoted.len(), "Promoted records into volatile tier");
                    self.volatile.promote(&promoted);
                }
                found.extend(promoted);
            }
            Err(e) => self.durable_failed("load", &e),
        }
        found
    }

    /// Load a single record.
    pub fn read(&self, key: &CacheKey) -> Option<Record> {
        let keys: HashSet<CacheKey> = [key.clone()].into_iter().collect();
        self.load(&keys).remove(key)
    }

    /// Deep-merge a record set into both tiers.
    ///
    /// Malformed records are skipped and logged; the rest of the set is
    /// still merged. Returns the union of keys changed in either tier.
    pub fn merge(&self, records: &RecordSet) -> HashSet<CacheKey> {
        self.merges.fetch_add(1, Ordering::Relaxed);

        let mut valid = RecordSet::new();
        for (key, record) in records.iter() {
            match record.validate(key) {
                Ok(()) => valid.insert(key.clone(), record.clone()),
                Err(e) => {
                    self.skipped_records.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Skipping malformed record");
                }
            }
        }
        if valid.is_empty() {
            return HashSet::new();
        }

        let mut changed = HashSet::new();
        let mut for_volatile = None;

        if let Some(durable) = self.durable() {
            match durable.merge_full(&valid) {
                Ok((durable_changed, merged)) => {
                    changed.extend(durable_changed);
                    for_volatile = Some(merged);
                }
                Err(e) => self.durable_failed("merge", &e),
            }
        }

        let volatile_input = for_volatile.as_ref().unwrap_or(&valid);
        match self.volatile.merge(volatile_input) {
            Ok(volatile_changed) => changed.extend(volatile_changed),
            Err(e) => warn!(error = %e, "Volatile merge failed"),
        }

        trace!(
            records = valid.len(),
            changed = changed.len(),
            "Merged record set"
        );
        changed
    }

    /// Remove one record from both tiers. Returns true if either had it.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut removed = self.volatile.remove(key).unwrap_or(false);
        if let Some(durable) = self.durable() {
            match durable.remove(key) {
                Ok(hit) => removed |= hit,
                Err(e) => self.durable_failed("remove", &e),
            }
        }
        removed
    }

    /// Remove every record matching `pattern` from both tiers.
    pub fn remove_matching(&self, pattern: &KeyPattern) -> HashSet<CacheKey> {
        let mut removed: HashSet<CacheKey> = self
            .volatile
            .remove_matching(pattern)
            .unwrap_or_default()
            .into_iter()
            .collect();
        if let Some(durable) = self.durable() {
            match durable.remove_matching(pattern) {
                Ok(keys) => removed.extend(keys),
                Err(e) => self.durable_failed("remove_matching", &e),
            }
        }
        removed
    }

    /// Empty both tiers.
    pub fn clear(&self) {
        let _ = self.volatile.clear();
        if let Some(durable) = self.durable() {
            if let Err(e) = durable.clear() {
                self.durable_failed("clear", &e);
            }
        }
        debug!("Cleared tiered cache");
    }

    /// Drop the volatile tier in response to memory pressure.
    ///
    /// Content is unchanged from the cache's point of view, so nothing is
    /// reported as changed.
    pub fn evict_volatile(&self) -> usize {
        let dropped = self.volatile.evict_all();
        self.memory_evictions.fetch_add(1, Ordering::Relaxed);
        debug!(dropped, "Evicted volatile tier under memory pressure");
        dropped
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> TieredStats {
        TieredStats {
            volatile: self.volatile.stats(),
            durable: self.durable.as_ref().map(|d| d.stats()),
            durable_available: self.durable_available(),
            merges: self.merges.load(Ordering::Relaxed),
            skipped_records: self.skipped_records.load(Ordering::Relaxed),
            memory_evictions: self.memory_evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldValue;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn user() -> CacheKey {
        CacheKey::new("User", "1")
    }

    fn tiered(dir: &TempDir) -> TieredCache {
        TieredCache::open(CacheConfig::with_durable(DurableConfig::new(dir.path())))
    }

    fn keys(items: &[CacheKey]) -> HashSet<CacheKey> {
        items.iter().cloned().collect()
    }

    #[test]
    fn test_deep_merge_example() {
        let dir = TempDir::new().unwrap();
        let cache = tiered(&dir);

        cache.merge(&RecordSet::new().with(user(), Record::new().with("name", "Ann")));
        cache.merge(&RecordSet::new().with(user(), Record::new().with("email", "a@x.com")));

        let record = cache.read(&user()).unwrap();
        assert_eq!(record.get("name"), Some(&FieldValue::from("Ann")));
        assert_eq!(record.get("email"), Some(&FieldValue::from("a@x.com")));
    }

    #[test]
    fn test_merge_idempotence() {
        let dir = TempDir::new().unwrap();
        let cache = tiered(&dir);
        let set = RecordSet::new()
            .with(user(), Record::new().with("name", "Ann"))
            .with(CacheKey::new("Item", "1"), Record::new().with("qty", json!(3)));

        let first = cache.merge(&set);
        assert_eq!(first.len(), 2);
        let second = cache.merge(&set);
        assert!(second.is_empty());
    }

    #[test]
    fn test_read_through_promotion() {
        let dir = TempDir::new().unwrap();
        {
            let warmup = tiered(&dir);
            warmup.merge(&RecordSet::new().with(user(), Record::new().with("name", "Ann")));
        }

        // Fresh cache: the record only exists on disk.
        let cache = tiered(&dir);
        assert!(cache.load(&keys(&[user()])).contains_key(&user()));
        let loads_after_first = cache.stats().durable.unwrap().loads;
        assert_eq!(loads_after_first, 1);

        assert!(cache.load(&keys(&[user()])).contains_key(&user()));
        let stats = cache.stats();
        assert_eq!(stats.durable.unwrap().loads, loads_after_first);
        assert_eq!(stats.volatile.hits, 1);
    }

    #[test]
    fn test_memory_pressure_keeps_durable_content() {
        let dir = TempDir::new().unwrap();
        let cache = tiered(&dir);
        cache.merge(&RecordSet::new().with(user(), Record::new().with("name", "Ann")));

        assert_eq!(cache.evict_volatile(), 1);
        assert_eq!(cache.stats().volatile.current_size, 0);

        let record = cache.read(&user()).unwrap();
        assert_eq!(record.get("name"), Some(&FieldValue::from("Ann")));
        assert_eq!(cache.stats().volatile.current_size, 1);
    }

    #[test]
    fn test_merge_after_eviction_keeps_full_record_in_memory() {
        let dir = TempDir::new().unwrap();
        let cache = tiered(&dir);
        cache.merge(&RecordSet::new().with(
            user(),
            Record::new().with("name", "Ann").with("email", "a@x.com"),
        ));
        cache.evict_volatile();

        cache.merge(&RecordSet::new().with(user(), Record::new().with("name", "Anne")));
        let record = cache.read(&user()).unwrap();
        assert_eq!(record.len(), 2);
        assert_eq!(record.get("name"), Some(&FieldValue::from("Anne")));
    }

    #[test]
    fn test_malformed_record_skipped_rest_merged() {
        let cache = TieredCache::open(CacheConfig::in_memory());
        let set = RecordSet::new()
            .with(user(), Record::new().with("address", json!({"city": "Oslo"})))
            .with(CacheKey::new("Item", "1"), Record::new().with("qty", json!(1)));

        let changed = cache.merge(&set);
        assert_eq!(changed, keys(&[CacheKey::new("Item", "1")]));
        assert!(cache.read(&user()).is_none());
        assert_eq!(cache.stats().skipped_records, 1);
    }

    #[test]
    fn test_durable_failure_falls_back_to_volatile() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tier");
        let cache = TieredCache::open(CacheConfig::with_durable(DurableConfig::new(&path)));
        assert!(cache.durable_available());

        fs::remove_dir_all(&path).unwrap();
        let changed = cache.merge(&RecordSet::new().with(user(), Record::new().with("name", "Ann")));

        assert!(changed.contains(&user()));
        assert!(!cache.durable_available());
        assert!(cache.read(&user()).is_some());
    }

    #[test]
    fn test_remove_and_clear_both_tiers() {
        let dir = TempDir::new().unwrap();
        let cache = tiered(&dir);
        cache.merge(
            &RecordSet::new()
                .with(user(), Record::new().with("name", "Ann"))
                .with(CacheKey::new("User", "2"), Record::new().with("name", "Bo"))
                .with(CacheKey::new("Item", "1"), Record::new().with("qty", json!(1))),
        );

        assert!(cache.remove(&user()));
        assert!(cache.read(&user()).is_none());

        let removed = cache.remove_matching(&KeyPattern::of_type("User"));
        assert_eq!(removed, keys(&[CacheKey::new("User", "2")]));

        cache.clear();
        assert!(cache.read(&CacheKey::new("Item", "1")).is_none());
        assert_eq!(cache.stats().volatile.current_size, 0);
    }
}
