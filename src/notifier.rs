//! Change notification: which watches does a changed-key set affect?
//!
//! Every live watch registers the dependency set captured at its last
//! projection. A merge reports the keys whose stored value changed; the
//! notifier maps those keys back to the watches that read them through a
//! reverse index, so watches that did not read any changed key are never
//! recomputed.
//!
//! Each non-empty change is also published as a [`ChangeBatch`] on a
//! broadcast channel for observers that are not watches (diagnostics,
//! sync indicators).

use crate::types::CacheKey;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity for change broadcasts.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Unique identifier for a query watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchId(pub u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch-{}", self.0)
    }
}

/// What produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeSource {
    /// A query response
    Query,
    /// A mutation response
    Mutation,
    /// A server push
    Push,
    /// A locally produced record set
    Local,
    /// Records removed by invalidation
    Invalidation,
}

/// One published change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeBatch {
    /// Keys whose stored value changed, sorted
    pub keys: Vec<CacheKey>,
    /// What produced the change
    pub source: ChangeSource,
    /// When the change was applied
    pub timestamp: DateTime<Utc>,
}

/// Notifier statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifierStats {
    pub batches_published: u64,
    pub tracked_watches: usize,
    pub tracked_keys: usize,
}

/// Reverse dependency index plus change broadcast.
pub struct ChangeNotifier {
    by_key: DashMap<CacheKey, HashSet<WatchId>>,
    by_watch: DashMap<WatchId, HashSet<CacheKey>>,
    sender: broadcast::Sender<ChangeBatch>,
    batches_published: AtomicU64,
}

impl ChangeNotifier {
    /// Create a notifier.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a notifier with a custom broadcast capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            by_key: DashMap::new(),
            by_watch: DashMap::new(),
            sender,
            batches_published: AtomicU64::new(0),
        }
    }

    /// Replace the dependency set recorded for `watch`.
    pub fn track(&self, watch: WatchId, dependencies: HashSet<CacheKey>) {
        let previous = self.by_watch.insert(watch, dependencies.clone());

        if let Some(previous) = previous {
            for key in previous.difference(&dependencies) {
                self.unindex(key, watch);
            }
        }
        for key in dependencies {
            self.by_key.entry(key).or_default().insert(watch);
        }
    }

    /// Forget `watch` entirely.
    pub fn untrack(&self, watch: WatchId) {
        if let Some((_, keys)) = self.by_watch.remove(&watch) {
            for key in &keys {
                self.unindex(key, watch);
            }
        }
    }

    fn unindex(&self, key: &CacheKey, watch: WatchId) {
        let now_empty = match self.by_key.get_mut(key) {
            Some(mut watchers) => {
                watchers.remove(&watch);
                watchers.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_key.remove_if(key, |_, watchers| watchers.is_empty());
        }
    }

    /// The dependency set recorded for `watch`.
    pub fn dependencies(&self, watch: WatchId) -> HashSet<CacheKey> {
        self.by_watch
            .get(&watch)
            .map(|deps| deps.value().clone())
            .unwrap_or_default()
    }

    /// Watches whose recorded dependencies intersect `changed`.
    pub fn affected(&self, changed: &HashSet<CacheKey>) -> HashSet<WatchId> {
        let mut watches = HashSet::new();
        for key in changed {
            if let Some(watchers) = self.by_key.get(key) {
                watches.extend(watchers.iter().copied());
            }
        }
        watches
    }

    /// Every key any live watch depends on.
    pub fn tracked_keys(&self) -> HashSet<CacheKey> {
        self.by_key.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Publish a change to broadcast observers. Empty changes are dropped.
    pub fn publish(&self, changed: &HashSet<CacheKey>, source: ChangeSource) {
        if changed.is_empty() {
            return;
        }
        let mut keys: Vec<CacheKey> = changed.iter().cloned().collect();
        keys.sort();
        trace!(count = keys.len(), ?source, "Publishing change batch");

        // No receivers is fine.
        let _ = self.sender.send(ChangeBatch {
            keys,
            source,
            timestamp: Utc::now(),
        });
        self.batches_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Receive published change batches.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> {
        self.sender.subscribe()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> NotifierStats {
        NotifierStats {
            batches_published: self.batches_published.load(Ordering::Relaxed),
            tracked_watches: self.by_watch.len(),
            tracked_keys: self.by_key.len(),
        }
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}
