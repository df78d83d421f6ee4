//! Live query subscriptions.
//!
//! The [`WatchRegistry`] owns every [`QueryWatch`] of a session, keyed by
//! [`DedupKey`]. Subscribing to a key that already has a watch attaches to
//! it (no second fetch) and immediately delivers its current state; the
//! watch is cancelled and removed when its last subscriber detaches, or by
//! [`WatchRegistry::cancel_all`] at session teardown.
//!
//! The registry only does bookkeeping. Fetching and recomputing are driven
//! by [`CacheClient`](crate::client::CacheClient), which owns the cache and
//! the transport.

pub mod handle;
pub mod query_watch;

pub use handle::SubscriptionHandle;
pub use query_watch::{
    DataSource, FetchPhase, QueryWatch, SubscriberId, WatchCallback, WatchInfo, WatchSnapshot,
};

use crate::notifier::{ChangeNotifier, WatchId};
use crate::operation::{CachePolicy, DedupKey, Operation};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Outcome of [`WatchRegistry::subscribe`].
pub(crate) struct Attached {
    pub handle: SubscriptionHandle,
    /// Set when this call created the watch and must start its fetch
    pub created: Option<Arc<QueryWatch>>,
}

/// Registry of live watches for one session.
pub struct WatchRegistry {
    watches: Mutex<HashMap<DedupKey, Arc<QueryWatch>>>,
    by_id: DashMap<WatchId, Arc<QueryWatch>>,
    notifier: Arc<ChangeNotifier>,
    next_watch: AtomicU64,
    next_subscriber: AtomicU64,
}

impl WatchRegistry {
    /// Create an empty registry reporting to `notifier`.
    pub fn new(notifier: Arc<ChangeNotifier>) -> Self {
        Self {
            watches: Mutex::new(HashMap::new()),
            by_id: DashMap::new(),
            notifier,
            next_watch: AtomicU64::new(1),
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Attach a subscriber, creating the watch if none exists for the key.
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        operation: Operation,
        arguments: JsonValue,
        policy: CachePolicy,
        callback: WatchCallback,
    ) -> Attached {
        let key = operation.dedup_key(&arguments);
        let subscriber = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));

        let (watch, created, token) = {
            let mut watches = self.watches.lock();
            let existing = watches.get(&key).filter(|w| !w.is_cancelled()).cloned();
            let (watch, created) = match existing {
                Some(watch) => (watch, false),
                None => {
                    let id = WatchId(self.next_watch.fetch_add(1, Ordering::Relaxed));
                    let watch = Arc::new(QueryWatch::new(id, operation, arguments, policy));
                    watches.insert(key.clone(), watch.clone());
                    self.by_id.insert(id, watch.clone());
                    debug!(watch = %id, key = %key, ?policy, "Created watch");
                    (watch, true)
                }
            };
            let token = watch.add_subscriber(subscriber, callback);
            (watch, created, token)
        };

        watch.prime_subscriber(subscriber);

        Attached {
            handle: SubscriptionHandle::new(self.clone(), watch.clone(), subscriber, token),
            created: created.then_some(watch),
        }
    }

    /// Detach one subscriber; cancel and remove the watch at zero.
    pub(crate) fn detach(&self, watch: &Arc<QueryWatch>, subscriber: SubscriberId) {
        let last = {
            let mut watches = self.watches.lock();
            let remaining = watch.remove_subscriber(subscriber);
            let registered = watches
                .get(watch.key())
                .is_some_and(|current| Arc::ptr_eq(current, watch));
            if remaining == 0 && registered {
                watches.remove(watch.key());
                self.by_id.remove(&watch.id());
                true
            } else {
                false
            }
        };

        // Cancel before untracking: a recompute that tracks the watch after
        // this point sees it cancelled and untracks it again.
        if last {
            watch.cancel();
            self.notifier.untrack(watch.id());
        } else {
            watch.barrier();
        }
    }

    /// Look up a live watch by id.
    pub fn get(&self, id: WatchId) -> Option<Arc<QueryWatch>> {
        self.by_id.get(&id).map(|w| w.value().clone())
    }

    /// Look up a live watch by dedup key.
    pub fn find(&self, key: &DedupKey) -> Option<Arc<QueryWatch>> {
        self.watches.lock().get(key).cloned()
    }

    /// Force-cancel every watch regardless of subscriber count.
    ///
    /// Returns the number of watches cancelled. When this returns, no
    /// watch callback will run again.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Arc<QueryWatch>> = {
            let mut watches = self.watches.lock();
            watches.drain().map(|(_, watch)| watch).collect()
        };
        for watch in &drained {
            self.by_id.remove(&watch.id());
            watch.cancel();
            self.notifier.untrack(watch.id());
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "Cancelled all watches");
        }
        drained.len()
    }

    /// Number of live watches.
    pub fn len(&self) -> usize {
        self.watches.lock().len()
    }

    /// True if no watch is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Diagnostic listing of live watches, ordered by id.
    pub fn list(&self) -> Vec<WatchInfo> {
        let watches: Vec<Arc<QueryWatch>> = self.watches.lock().values().cloned().collect();
        let mut infos: Vec<WatchInfo> = watches.iter().map(|w| w.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}
