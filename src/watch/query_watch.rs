//! One live, deduplicated query subscription.
//!
//! A [`QueryWatch`] holds the latest [`WatchSnapshot`] for one resolved
//! query and fans it out to its subscribers. All state changes go through
//! [`QueryWatch::emit`], which holds the watch's emission lock across the
//! state update and the callback fan-out, so subscribers of one watch see
//! snapshots strictly in the order they were produced.
//!
//! Fetch state machine (per network attempt):
//!
//! ```text
//! PendingCache ──hit──▶ CacheDelivered ──▶ PendingNetwork ──▶ Settled
//!      └──────────miss─────────────────────────▲
//! ```

use crate::error::CacheError;
use crate::notifier::WatchId;
use crate::operation::{CachePolicy, DedupKey, Operation};
use crate::projection::Projection;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Where the current value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSource {
    /// Projected from the cache without a network round trip
    Cache,
    /// Projected right after the network response was merged
    Network,
}

/// State delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WatchSnapshot {
    /// A fetch is in flight and no value for it has been delivered yet
    pub loading: bool,
    /// Latest projected value
    pub value: Option<Arc<JsonValue>>,
    /// Where `value` came from
    pub source: Option<DataSource>,
    /// Error of the last fetch, if it surfaced
    pub error: Option<CacheError>,
    /// The current fetch reached its terminal emission
    pub settled: bool,
}

impl WatchSnapshot {
    /// Convert a settled snapshot into a one-shot query result.
    pub fn to_result(&self) -> Result<Option<JsonValue>, CacheError> {
        match &self.error {
            Some(error) => Err(error.clone()),
            None => Ok(self.value.as_ref().map(|v| (**v).clone())),
        }
    }
}

/// Position in the fetch state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchPhase {
    PendingCache,
    CacheDelivered,
    PendingNetwork,
    Settled,
}

/// Identifier of one subscriber on one watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

/// Subscriber callback.
pub type WatchCallback = Arc<dyn Fn(&WatchSnapshot) + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    id: SubscriberId,
    token: CancellationToken,
    callback: WatchCallback,
    primed: bool,
}

/// Diagnostic view of a watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchInfo {
    pub id: WatchId,
    pub key: DedupKey,
    pub policy: CachePolicy,
    pub phase: FetchPhase,
    pub subscribers: usize,
    pub dependencies: usize,
    pub emissions: u64,
    pub created_at: DateTime<Utc>,
    pub last_suppressed_error: Option<String>,
}

struct WatchState {
    snapshot: WatchSnapshot,
    has_emitted: bool,
    phase: FetchPhase,
    generation: u64,
    cache_delivered: bool,
    dependencies: usize,
    subscribers: Vec<Subscriber>,
    last_suppressed_error: Option<CacheError>,
    emissions: u64,
}

/// A live query subscription shared by every subscriber of one dedup key.
pub struct QueryWatch {
    id: WatchId,
    key: DedupKey,
    operation: Operation,
    arguments: JsonValue,
    policy: CachePolicy,
    created_at: DateTime<Utc>,
    token: CancellationToken,
    emit_lock: ReentrantMutex<()>,
    state: Mutex<WatchState>,
}

impl QueryWatch {
    pub(crate) fn new(
        id: WatchId,
        operation: Operation,
        arguments: JsonValue,
        policy: CachePolicy,
    ) -> Self {
        let key = operation.dedup_key(&arguments);
        Self {
            id,
            key,
            operation,
            arguments,
            policy,
            created_at: Utc::now(),
            token: CancellationToken::new(),
            emit_lock: ReentrantMutex::new(()),
            state: Mutex::new(WatchState {
                snapshot: WatchSnapshot::default(),
                has_emitted: false,
                phase: FetchPhase::PendingCache,
                generation: 0,
                cache_delivered: false,
                dependencies: 0,
                subscribers: Vec::new(),
                last_suppressed_error: None,
                emissions: 0,
            }),
        }
    }

    pub fn id(&self) -> WatchId {
        self.id
    }

    pub fn key(&self) -> &DedupKey {
        &self.key
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn arguments(&self) -> &JsonValue {
        &self.arguments
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// True once the watch was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the watch is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> WatchSnapshot {
        self.state.lock().snapshot.clone()
    }

    /// Current fetch phase.
    pub fn phase(&self) -> FetchPhase {
        self.state.lock().phase
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Diagnostic view.
    pub fn info(&self) -> WatchInfo {
        let state = self.state.lock();
        WatchInfo {
            id: self.id,
            key: self.key.clone(),
            policy: self.policy,
            phase: state.phase,
            subscribers: state.subscribers.len(),
            dependencies: state.dependencies,
            emissions: state.emissions,
            created_at: self.created_at,
            last_suppressed_error: state.last_suppressed_error.as_ref().map(|e| e.to_string()),
        }
    }

    /// Apply a state update and deliver the resulting snapshot, if any.
    ///
    /// `update` returns `None` when nothing observable changed.
    fn emit(&self, update: impl FnOnce(&mut WatchState) -> Option<WatchSnapshot>) -> bool {
        let _emitting = self.emit_lock.lock();
        if self.token.is_cancelled() {
            return false;
        }

        let (snapshot, subscribers) = {
            let mut state = self.state.lock();
            let Some(snapshot) = update(&mut *state) else {
                return false;
            };
            state.snapshot = snapshot.clone();
            state.has_emitted = true;
            state.emissions += 1;
            let subscribers: Vec<Subscriber> =
                state.subscribers.iter().filter(|s| s.primed).cloned().collect();
            (snapshot, subscribers)
        };

        for subscriber in subscribers {
            if self.token.is_cancelled() {
                break;
            }
            if subscriber.token.is_cancelled() {
                continue;
            }
            (subscriber.callback)(&snapshot);
        }
        true
    }

    /// Register a subscriber without delivering anything yet.
    pub(crate) fn add_subscriber(&self, id: SubscriberId, callback: WatchCallback) -> CancellationToken {
        let token = self.token.child_token();
        self.state.lock().subscribers.push(Subscriber {
            id,
            token: token.clone(),
            callback,
            primed: false,
        });
        token
    }

    /// Deliver the current snapshot to a freshly added subscriber and start
    /// including it in emissions.
    pub(crate) fn prime_subscriber(&self, id: SubscriberId) {
        let _emitting = self.emit_lock.lock();
        if self.token.is_cancelled() {
            return;
        }

        let delivery = {
            let mut state = self.state.lock();
            let has_emitted = state.has_emitted;
            let snapshot = state.snapshot.clone();
            state
                .subscribers
                .iter_mut()
                .find(|s| s.id == id)
                .and_then(|subscriber| {
                    subscriber.primed = true;
                    has_emitted.then(|| (subscriber.callback.clone(), snapshot))
                })
        };

        if let Some((callback, snapshot)) = delivery {
            callback(&snapshot);
        }
    }

    /// Detach a subscriber. Returns the number of subscribers left.
    pub(crate) fn remove_subscriber(&self, id: SubscriberId) -> usize {
        let mut state = self.state.lock();
        if let Some(position) = state.subscribers.iter().position(|s| s.id == id) {
            let subscriber = state.subscribers.remove(position);
            subscriber.token.cancel();
        }
        state.subscribers.len()
    }

    /// Wait for any in-progress delivery on another thread to finish.
    pub(crate) fn barrier(&self) {
        drop(self.emit_lock.lock());
    }

    /// Cancel the watch. No callback runs after this returns.
    pub(crate) fn cancel(&self) {
        let _emitting = self.emit_lock.lock();
        self.token.cancel();
        let mut state = self.state.lock();
        state.subscribers.clear();
        state.phase = FetchPhase::Settled;
        debug!(watch = %self.id, key = %self.key, "Cancelled watch");
    }

    /// Begin a fetch: emit the loading state.
    pub(crate) fn begin_fetch(&self) {
        self.emit(|state| {
            state.phase = FetchPhase::PendingCache;
            state.cache_delivered = false;
            Some(WatchSnapshot {
                loading: true,
                value: state.snapshot.value.clone(),
                source: state.snapshot.source,
                error: None,
                settled: false,
            })
        });
    }

    /// Deliver a cached value that settles the fetch (cache-only or a
    /// complete hit for cache-else-network).
    pub(crate) fn settle_from_cache(&self, projection: &Projection) {
        let value = projection.complete_value().cloned().map(Arc::new);
        self.emit(|state| {
            state.phase = FetchPhase::Settled;
            state.dependencies = projection.dependencies.len();
            Some(WatchSnapshot {
                loading: false,
                value,
                source: Some(DataSource::Cache),
                error: None,
                settled: true,
            })
        });
    }

    /// Deliver a cached value ahead of the network (cache-then-network).
    pub(crate) fn deliver_cache(&self, projection: &Projection) {
        let Some(value) = projection.complete_value().cloned() else {
            return;
        };
        self.emit(|state| {
            state.phase = FetchPhase::CacheDelivered;
            state.cache_delivered = true;
            state.dependencies = projection.dependencies.len();
            Some(WatchSnapshot {
                loading: false,
                value: Some(Arc::new(value)),
                source: Some(DataSource::Cache),
                error: None,
                settled: false,
            })
        });
    }

    /// Enter `PendingNetwork` for a new attempt and return its generation.
    pub(crate) fn begin_network(&self) -> u64 {
        let mut state = self.state.lock();
        state.generation += 1;
        state.phase = FetchPhase::PendingNetwork;
        state.generation
    }

    /// Start a manual refetch: keep the current value, flag loading.
    pub(crate) fn begin_refetch(&self) -> u64 {
        let generation = {
            let mut state = self.state.lock();
            state.cache_delivered = false;
            state.generation += 1;
            state.phase = FetchPhase::PendingNetwork;
            state.generation
        };
        self.emit(|state| {
            if state.generation != generation {
                return None;
            }
            Some(WatchSnapshot {
                loading: true,
                value: state.snapshot.value.clone(),
                source: state.snapshot.source,
                error: None,
                settled: false,
            })
        });
        generation
    }

    /// True if `generation` is still the attempt this watch is waiting on.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        let state = self.state.lock();
        state.generation == generation && state.phase == FetchPhase::PendingNetwork
    }

    /// Terminal emission for a successful network attempt.
    pub(crate) fn settle_network(&self, generation: u64, projection: &Projection) -> bool {
        let value = projection.value.clone().map(Arc::new);
        self.emit(|state| {
            if state.generation != generation || state.phase != FetchPhase::PendingNetwork {
                return None;
            }
            state.phase = FetchPhase::Settled;
            state.dependencies = projection.dependencies.len();
            Some(WatchSnapshot {
                loading: false,
                value,
                source: Some(DataSource::Network),
                error: None,
                settled: true,
            })
        })
    }

    /// Terminal emission for a failed network attempt.
    ///
    /// If this attempt already delivered a cached value, the failure is
    /// logged and kept for diagnostics, and subscribers only see the fetch
    /// settle with the cached value they already have.
    pub(crate) fn fail_network(&self, generation: u64, error: CacheError) -> bool {
        let key = self.key.clone();
        self.emit(|state| {
            if state.generation != generation || state.phase != FetchPhase::PendingNetwork {
                return None;
            }
            state.phase = FetchPhase::Settled;

            if state.cache_delivered {
                warn!(key = %key, error = %error, "Network refresh failed after cached value was delivered");
                state.last_suppressed_error = Some(error);
                return Some(WatchSnapshot {
                    settled: true,
                    ..state.snapshot.clone()
                });
            }

            Some(WatchSnapshot {
                loading: false,
                value: state.snapshot.value.clone(),
                source: state.snapshot.source,
                error: Some(error),
                settled: true,
            })
        })
    }

    /// Re-emit after a cache change, only if the value actually changed.
    ///
    /// Watches that have not delivered a value yet only update their
    /// dependency count; their pending fetch will deliver.
    pub(crate) fn apply_recompute(&self, projection: &Projection) -> bool {
        let value = projection.value.clone().map(Arc::new);
        self.emit(|state| {
            state.dependencies = projection.dependencies.len();
            let delivered = matches!(state.phase, FetchPhase::CacheDelivered | FetchPhase::Settled)
                || state.snapshot.value.is_some();
            if !delivered || state.snapshot.value == value {
                return None;
            }
            Some(WatchSnapshot {
                value,
                source: Some(DataSource::Cache),
                ..state.snapshot.clone()
            })
        })
    }
}
