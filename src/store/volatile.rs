//! Volatile tier: bounded in-memory record store.
//!
//! Holds what the running session is actively reading. When full, the
//! least recently used record is dropped; the durable tier still has it, so
//! dropping is invisible to watches.

use crate::error::CacheResult;
use crate::store::{KeyPattern, RecordStore};
use crate::types::{CacheKey, Record, RecordSet};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Volatile tier configuration.
#[derive(Debug, Clone)]
pub struct VolatileConfig {
    /// Maximum number of records held in memory
    pub capacity: usize,
}

impl Default for VolatileConfig {
    fn default() -> Self {
        Self { capacity: 5_000 }
    }
}

/// Volatile tier statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolatileStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub current_size: usize,
    pub capacity: usize,
}

/// Recency bookkeeping: each touch gets a fresh tick.
#[derive(Default)]
struct Recency {
    tick: u64,
    by_tick: BTreeMap<u64, CacheKey>,
    tick_of: HashMap<CacheKey, u64>,
}

impl Recency {
    fn touch(&mut self, key: &CacheKey) {
        self.tick += 1;
        if let Some(old) = self.tick_of.insert(key.clone(), self.tick) {
            self.by_tick.remove(&old);
        }
        self.by_tick.insert(self.tick, key.clone());
    }

    fn forget(&mut self, key: &CacheKey) {
        if let Some(old) = self.tick_of.remove(key) {
            self.by_tick.remove(&old);
        }
    }

    fn oldest(&mut self) -> Option<CacheKey> {
        let (&tick, _) = self.by_tick.iter().next()?;
        let key = self.by_tick.remove(&tick)?;
        self.tick_of.remove(&key);
        Some(key)
    }

    fn clear(&mut self) {
        self.by_tick.clear();
        self.tick_of.clear();
    }
}

/// In-memory record store with LRU bound.
pub struct VolatileStore {
    config: VolatileConfig,
    records: DashMap<CacheKey, Record>,
    recency: Mutex<Recency>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl VolatileStore {
    /// Create a store with default configuration.
    pub fn new() -> Self {
        Self::with_config(VolatileConfig::default())
    }

    /// Create a store with custom configuration.
    pub fn with_config(config: VolatileConfig) -> Self {
        let capacity = config.capacity;
        Self {
            config,
            records: DashMap::with_capacity(capacity.min(1024)),
            recency: Mutex::new(Recency::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get one record.
    pub fn get(&self, key: &CacheKey) -> Option<Record> {
        let found = self.records.get(key).map(|r| r.value().clone());
        match found {
            Some(record) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.recency.lock().touch(key);
                Some(record)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Check presence without touching recency or stats.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.records.contains_key(key)
    }

    /// Install records read from the durable tier. Never reported as a change.
    pub fn promote(&self, records: &HashMap<CacheKey, Record>) {
        for (key, record) in records {
            self.records.insert(key.clone(), record.clone());
            self.recency.lock().touch(key);
        }
        self.enforce_capacity();
    }

    /// Drop everything held in memory. Returns how many records were dropped.
    pub fn evict_all(&self) -> usize {
        let dropped = self.records.len();
        self.records.clear();
        self.recency.lock().clear();
        self.evictions.fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    /// Current record count.
    pub fn size(&self) -> usize {
        self.records.len()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> VolatileStats {
        VolatileStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            current_size: self.records.len(),
            capacity: self.config.capacity,
        }
    }

    fn enforce_capacity(&self) {
        while self.records.len() > self.config.capacity {
            let victim = self.recency.lock().oldest();
            match victim {
                Some(key) => {
                    self.records.remove(&key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }
}

impl Default for VolatileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for VolatileStore {
    fn load(&self, keys: &HashSet<CacheKey>) -> CacheResult<HashMap<CacheKey, Record>> {
        Ok(keys
            .iter()
            .filter_map(|key| self.get(key).map(|record| (key.clone(), record)))
            .collect())
    }

    fn merge(&self, records: &RecordSet) -> CacheResult<HashSet<CacheKey>> {
        let mut changed = HashSet::new();
        for (key, incoming) in records.iter() {
            let did_change = match self.records.entry(key.clone()) {
                Entry::Occupied(mut slot) => slot.get_mut().merge_from(incoming),
                Entry::Vacant(slot) => {
                    slot.insert(incoming.clone());
                    true
                }
            };
            self.recency.lock().touch(key);
            if did_change {
                changed.insert(key.clone());
            }
        }
        self.enforce_capacity();
        Ok(changed)
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<bool> {
        self.recency.lock().forget(key);
        Ok(self.records.remove(key).is_some())
    }

    fn remove_matching(&self, pattern: &KeyPattern) -> CacheResult<Vec<CacheKey>> {
        let victims: Vec<CacheKey> = self
            .records
            .iter()
            .filter(|entry| pattern.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        let mut recency = self.recency.lock();
        for key in &victims {
            self.records.remove(key);
            recency.forget(key);
        }
        Ok(victims)
    }

    fn clear(&self) -> CacheResult<()> {
        self.records.clear();
        self.recency.lock().clear();
        Ok(())
    }

    fn len(&self) -> CacheResult<usize> {
        Ok(self.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(id: u32) -> CacheKey {
        CacheKey::new("Item", id.to_string())
    }

    fn one(key: CacheKey, record: Record) -> RecordSet {
        RecordSet::new().with(key, record)
    }

    #[test]
    fn test_merge_reports_field_level_changes() {
        let store = VolatileStore::new();

        let changed = store
            .merge(&one(key(1), Record::new().with("name", "Milk")))
            .unwrap();
        assert!(changed.contains(&key(1)));

        let changed = store
            .merge(&one(key(1), Record::new().with("name", "Milk")))
            .unwrap();
        assert!(changed.is_empty());

        let changed = store
            .merge(&one(key(1), Record::new().with("qty", json!(2))))
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(store.get(&key(1)).unwrap().len(), 2);
    }

    #[test]
    fn test_load_partial_miss() {
        let store = VolatileStore::new();
        store
            .merge(&one(key(1), Record::new().with("name", "Milk")))
            .unwrap();

        let keys: HashSet<_> = [key(1), key(2)].into_iter().collect();
        let loaded = store.load(&keys).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key(&key(1)));

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_lru_eviction_keeps_recent() {
        let store = VolatileStore::with_config(VolatileConfig { capacity: 2 });
        store.merge(&one(key(1), Record::new().with("n", json!(1)))).unwrap();
        store.merge(&one(key(2), Record::new().with("n", json!(2)))).unwrap();

        // Touch 1 so 2 becomes the oldest.
        assert!(store.get(&key(1)).is_some());
        store.merge(&one(key(3), Record::new().with("n", json!(3)))).unwrap();

        assert!(store.contains(&key(1)));
        assert!(!store.contains(&key(2)));
        assert!(store.contains(&key(3)));
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_remove_matching_by_type() {
        let store = VolatileStore::new();
        let records = RecordSet::new()
            .with(key(1), Record::new().with("n", json!(1)))
            .with(key(2), Record::new().with("n", json!(2)))
            .with(CacheKey::new("User", "1"), Record::new().with("name", "Ann"));
        store.merge(&records).unwrap();

        let mut removed = store.remove_matching(&KeyPattern::of_type("Item")).unwrap();
        removed.sort();
        assert_eq!(removed, vec![key(1), key(2)]);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_evict_all_counts() {
        let store = VolatileStore::new();
        store.merge(&one(key(1), Record::new().with("n", json!(1)))).unwrap();
        store.merge(&one(key(2), Record::new().with("n", json!(2)))).unwrap();

        assert_eq!(store.evict_all(), 2);
        assert_eq!(store.size(), 0);
        assert_eq!(store.stats().evictions, 2);
    }
}
