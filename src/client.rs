//! The per-session cache client.
//!
//! [`CacheClient`] is what view-models and business services talk to. It
//! owns the session's [`TieredCache`], [`WatchRegistry`], [`ChangeNotifier`]
//! and [`Transport`], and drives the data flow:
//!
//! ```text
//! transport ──▶ merge into TieredCache ──▶ changed keys
//!                                              │
//!                      ChangeNotifier ◀────────┘
//!                            │ affected watches
//!                            ▼
//!                  recompute projection ──▶ callbacks (only on change)
//! ```
//!
//! Every merge and its notification fan-out runs under one owner lock, so
//! merges never interleave and watches never observe half-applied writes.
//! Transport completions re-enter through the same lock.
//!
//! Cloning a client is cheap (Arc internally).

use crate::error::{CacheError, CacheResult};
use crate::notifier::{ChangeBatch, ChangeNotifier, ChangeSource, NotifierStats, WatchId};
use crate::operation::{CachePolicy, DedupKey, Operation, ROOT_RESULT_FIELD};
use crate::projection::{Projection, project_root, project_value};
use crate::store::{CacheConfig, KeyPattern, TieredCache, TieredStats};
use crate::transport::{OperationResult, Transport};
use crate::types::{CacheKey, Record, RecordSet};
use crate::watch::{QueryWatch, SubscriptionHandle, WatchInfo, WatchRegistry, WatchSnapshot};
use futures::StreamExt;
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Default channel capacity for session events.
const SESSION_EVENT_CAPACITY: usize = 64;

/// Session-level events raised by cache operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// The remote rejected the session while running `operation`.
    AuthenticationFailed {
        operation: String,
        message: String,
    },
}

/// Client-wide statistics.
#[derive(Debug, Clone)]
pub struct ClientStats {
    pub cache: TieredStats,
    pub notifier: NotifierStats,
    pub live_watches: usize,
    pub live_listeners: usize,
}

/// Handle to a server-push stream merged into the cache.
///
/// The stream keeps running when the handle is dropped; it stops on
/// [`ListenHandle::cancel`], at the end of the stream, or at teardown.
pub struct ListenHandle {
    operation: String,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenHandle {
    /// Name of the listened operation.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Stop merging pushes. Deliveries already in flight are dropped.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True once cancelled or the stream ended.
    pub fn is_finished(&self) -> bool {
        self.token.is_cancelled() || self.task.is_finished()
    }
}

struct ClientShared {
    cache: TieredCache,
    notifier: Arc<ChangeNotifier>,
    registry: Arc<WatchRegistry>,
    transport: Arc<dyn Transport>,
    owner: ReentrantMutex<()>,
    events: broadcast::Sender<SessionEvent>,
    closed: CancellationToken,
    listeners: CancellationToken,
    live_listeners: Mutex<Vec<CancellationToken>>,
}

/// Normalized reactive cache for one authenticated session.
#[derive(Clone)]
pub struct CacheClient {
    shared: Arc<ClientShared>,
}

impl CacheClient {
    /// Build a client over a fresh cache.
    ///
    /// In the application this is called by the lifecycle coordinator when
    /// a session starts hydrating; the client lives exactly as long as
    /// that session.
    pub fn new(config: CacheConfig, transport: Arc<dyn Transport>) -> Self {
        let notifier = Arc::new(ChangeNotifier::with_capacity(config.change_channel_capacity));
        let registry = Arc::new(WatchRegistry::new(notifier.clone()));
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);

        Self {
            shared: Arc::new(ClientShared {
                cache: TieredCache::open(config),
                notifier,
                registry,
                transport,
                owner: ReentrantMutex::new(()),
                events,
                closed: CancellationToken::new(),
                listeners: CancellationToken::new(),
                live_listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Subscribe to a query.
    ///
    /// Identical operation + arguments share one watch: only the first
    /// subscriber triggers a fetch, later ones immediately receive the
    /// current state. The policy of the first subscriber governs the fetch.
    pub fn subscribe<F>(
        &self,
        operation: Operation,
        arguments: JsonValue,
        policy: CachePolicy,
        on_update: F,
    ) -> SubscriptionHandle
    where
        F: Fn(&WatchSnapshot) + Send + Sync + 'static,
    {
        let _owner = self.shared.owner.lock();
        let attached =
            self.shared
                .registry
                .subscribe(operation, arguments, policy, Arc::new(on_update));
        if let Some(watch) = attached.created {
            self.shared.start(&watch);
        }
        attached.handle
    }

    /// Detach a subscription. Same as dropping the handle.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        handle.unsubscribe();
    }

    /// One-shot read: subscribe, wait for the first settled value, detach.
    ///
    /// Returns `Ok(None)` for a cache-only miss.
    pub async fn query(
        &self,
        operation: Operation,
        arguments: JsonValue,
        policy: CachePolicy,
    ) -> CacheResult<Option<JsonValue>> {
        let (sender, receiver) = oneshot::channel();
        let slot = Mutex::new(Some(sender));

        let handle = self.subscribe(operation, arguments, policy, move |snapshot| {
            if snapshot.settled {
                if let Some(sender) = slot.lock().take() {
                    let _ = sender.send(snapshot.to_result());
                }
            }
        });

        let result = receiver.await.map_err(|_| CacheError::WatchCancelled);
        drop(handle);
        result?
    }

    /// Execute a mutation, merge its result and let dependent watches
    /// refresh. Returns the mutation result projected through its selection.
    pub async fn mutate(&self, operation: Operation, arguments: JsonValue) -> CacheResult<JsonValue> {
        if self.is_closed() {
            return Err(CacheError::SessionUnavailable("client was torn down".to_string()));
        }
        let result = self
            .shared
            .transport
            .execute(&operation, &arguments, CachePolicy::NetworkOnly)
            .await;

        match result {
            Ok(OperationResult { records, root }) => {
                let _owner = self.shared.owner.lock();
                if self.shared.closed.is_cancelled() {
                    debug!(operation = %operation.name(), "Dropping mutation result after teardown");
                    return Err(CacheError::SessionUnavailable(
                        "client was torn down".to_string(),
                    ));
                }
                self.shared.apply(&records, ChangeSource::Mutation, None);
                let projection = project_value(&self.shared.cache, &root, operation.selection());
                Ok(projection.value.unwrap_or(JsonValue::Null))
            }
            Err(error) => {
                self.shared.report(&operation, &error);
                Err(error)
            }
        }
    }

    /// Open a server-push stream and merge every delivery.
    pub async fn listen(&self, operation: Operation, arguments: JsonValue) -> CacheResult<ListenHandle> {
        let mut stream = self.shared.transport.listen(&operation, &arguments).await?;
        let token = self.shared.listeners.child_token();
        {
            let mut live = self.shared.live_listeners.lock();
            live.retain(|token| !token.is_cancelled());
            live.push(token.clone());
        }

        let shared = self.shared.clone();
        let task_token = token.clone();
        let name = operation.name().to_string();
        let task = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(records)) => {
                        let _owner = shared.owner.lock();
                        if task_token.is_cancelled() {
                            break;
                        }
                        shared.apply(&records, ChangeSource::Push, None);
                    }
                    Some(Err(error)) => {
                        shared.report(&operation, &error);
                        if error.is_authentication() {
                            break;
                        }
                        warn!(operation = %operation.name(), error = %error, "Push delivery failed");
                    }
                    None => break,
                }
            }
            task_token.cancel();
            debug!(operation = %operation.name(), "Push stream closed");
        });

        Ok(ListenHandle {
            operation: name,
            token,
            task,
        })
    }

    /// Merge a locally produced record set (e.g. an optimistic update).
    pub fn merge(&self, records: &RecordSet) -> HashSet<CacheKey> {
        let _owner = self.shared.owner.lock();
        self.shared.apply(records, ChangeSource::Local, None)
    }

    /// Issue a fresh network fetch for the watch behind `handle`.
    pub fn refetch(&self, handle: &SubscriptionHandle) {
        let watch = handle.watch().clone();
        if watch.is_cancelled() {
            return;
        }
        let generation = {
            let _owner = self.shared.owner.lock();
            watch.begin_refetch()
        };
        self.shared.spawn_network(watch, generation);
    }

    /// Remove one entity from the cache; dependent watches recompute.
    pub fn invalidate(&self, entity_type: &str, id: &str) -> bool {
        let key = CacheKey::new(entity_type, id);
        let _owner = self.shared.owner.lock();
        if self.shared.closed.is_cancelled() || !self.shared.cache.remove(&key) {
            return false;
        }
        let changed: HashSet<CacheKey> = [key].into_iter().collect();
        self.shared.notify(&changed, ChangeSource::Invalidation, None);
        true
    }

    /// Remove every entity of one type.
    pub fn invalidate_type(&self, entity_type: &str) -> usize {
        self.invalidate_matching(&KeyPattern::of_type(entity_type))
    }

    /// Remove every record matching `pattern`.
    pub fn invalidate_matching(&self, pattern: &KeyPattern) -> usize {
        let _owner = self.shared.owner.lock();
        if self.shared.closed.is_cancelled() {
            return 0;
        }
        let removed = self.shared.cache.remove_matching(pattern);
        self.shared.notify(&removed, ChangeSource::Invalidation, None);
        removed.len()
    }

    /// Empty the cache. Live watches are told that everything they read
    /// is gone.
    pub fn clear_all(&self) {
        let _owner = self.shared.owner.lock();
        if self.shared.closed.is_cancelled() {
            return;
        }
        let tracked = self.shared.notifier.tracked_keys();
        self.shared.cache.clear();
        self.shared.notify(&tracked, ChangeSource::Invalidation, None);
    }

    /// React to a low-memory signal: drop the volatile tier. Silent.
    pub fn handle_memory_pressure(&self) -> usize {
        let _owner = self.shared.owner.lock();
        self.shared.cache.evict_volatile()
    }

    /// Read one record through both tiers.
    pub fn read(&self, key: &CacheKey) -> Option<Record> {
        self.shared.cache.read(key)
    }

    /// Project a query from the cache without subscribing.
    pub fn peek(&self, operation: &Operation, arguments: &JsonValue) -> Projection {
        let root = DedupKey::new(operation.name(), arguments).root_key();
        project_root(&self.shared.cache, &root, operation.selection())
    }

    /// Published change batches.
    pub fn changes(&self) -> broadcast::Receiver<ChangeBatch> {
        self.shared.notifier.subscribe()
    }

    /// Session events (authentication failures).
    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Cancel every watch. No watch callback runs after this returns.
    pub fn cancel_all(&self) -> usize {
        self.shared.registry.cancel_all()
    }

    /// Stop every push stream.
    pub fn cancel_listeners(&self) {
        self.shared.listeners.cancel();
        self.shared.live_listeners.lock().clear();
    }

    /// True once the client was torn down or closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Stop accepting writes. Responses still in flight are dropped.
    pub(crate) fn close(&self) {
        let _owner = self.shared.owner.lock();
        self.shared.closed.cancel();
    }

    /// Tear down for sign-out: writes first, then watches, then streams,
    /// then data.
    pub fn teardown(&self) {
        self.close();
        let cancelled = self.cancel_all();
        self.cancel_listeners();
        let _owner = self.shared.owner.lock();
        self.shared.cache.clear();
        debug!(cancelled, "Tore down cache client");
    }

    /// Live watch diagnostics.
    pub fn watches(&self) -> Vec<WatchInfo> {
        self.shared.registry.list()
    }

    /// Dependency set currently recorded for a watch.
    pub fn dependencies(&self, watch: WatchId) -> HashSet<CacheKey> {
        self.shared.notifier.dependencies(watch)
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> ClientStats {
        let live_listeners = {
            let mut listeners = self.shared.live_listeners.lock();
            listeners.retain(|token| !token.is_cancelled());
            listeners.len()
        };
        ClientStats {
            cache: self.shared.cache.stats(),
            notifier: self.shared.notifier.stats(),
            live_watches: self.shared.registry.len(),
            live_listeners,
        }
    }
}

impl ClientShared {
    /// Run the first fetch of a newly created watch according to its policy.
    /// Caller holds the owner lock.
    fn start(self: &Arc<Self>, watch: &Arc<QueryWatch>) {
        watch.begin_fetch();
        let root = watch.key().root_key();

        match watch.policy() {
            CachePolicy::CacheOnly => {
                let projection = self.project_and_track(watch, &root);
                watch.settle_from_cache(&projection);
            }
            CachePolicy::CacheElseNetwork => {
                let projection = self.project_and_track(watch, &root);
                if projection.complete {
                    watch.settle_from_cache(&projection);
                } else {
                    let generation = watch.begin_network();
                    self.spawn_network(watch.clone(), generation);
                }
            }
            CachePolicy::NetworkOnly => {
                let generation = watch.begin_network();
                self.spawn_network(watch.clone(), generation);
            }
            CachePolicy::CacheThenNetwork => {
                let projection = self.project_and_track(watch, &root);
                watch.deliver_cache(&projection);
                let generation = watch.begin_network();
                self.spawn_network(watch.clone(), generation);
            }
        }
    }

    fn spawn_network(self: &Arc<Self>, watch: Arc<QueryWatch>, generation: u64) {
        let shared = self.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = watch.cancelled() => return,
                result = shared.transport.execute(
                    watch.operation(),
                    watch.arguments(),
                    watch.policy(),
                ) => result,
            };
            shared.complete_network(&watch, generation, result);
        });
    }

    fn complete_network(
        &self,
        watch: &Arc<QueryWatch>,
        generation: u64,
        result: CacheResult<OperationResult>,
    ) {
        let _owner = self.owner.lock();
        if !watch.is_current(generation) {
            trace!(watch = %watch.id(), generation, "Dropping stale network completion");
            return;
        }

        match result {
            Ok(OperationResult { mut records, root }) => {
                let root_key = watch.key().root_key();
                records.insert(root_key.clone(), Record::new().with(ROOT_RESULT_FIELD, root));
                self.apply(&records, ChangeSource::Query, Some(watch.id()));
                let projection = self.project_and_track(watch, &root_key);
                watch.settle_network(generation, &projection);
            }
            Err(error) => {
                self.report(watch.operation(), &error);
                watch.fail_network(generation, error);
            }
        }
    }

    /// Merge, publish, and recompute affected watches. Caller holds the
    /// owner lock.
    fn apply(&self, records: &RecordSet, source: ChangeSource, exclude: Option<WatchId>) -> HashSet<CacheKey> {
        if self.closed.is_cancelled() {
            trace!(count = records.len(), ?source, "Dropping records for a closed client");
            return HashSet::new();
        }
        let changed = self.cache.merge(records);
        self.notify(&changed, source, exclude);
        changed
    }

    /// Publish a change and recompute the watches it affects. Caller holds
    /// the owner lock.
    fn notify(&self, changed: &HashSet<CacheKey>, source: ChangeSource, exclude: Option<WatchId>) {
        if changed.is_empty() || self.closed.is_cancelled() {
            return;
        }
        self.notifier.publish(changed, source);

        let mut affected: Vec<WatchId> = self.notifier.affected(changed).into_iter().collect();
        affected.sort();
        for id in affected {
            if Some(id) == exclude {
                continue;
            }
            let Some(watch) = self.registry.get(id) else {
                continue;
            };
            let root = watch.key().root_key();
            let projection = self.project_and_track(&watch, &root);
            watch.apply_recompute(&projection);
        }
    }

    fn project_and_track(&self, watch: &Arc<QueryWatch>, root: &CacheKey) -> Projection {
        let projection = project_root(&self.cache, root, watch.operation().selection());
        self.notifier.track(watch.id(), projection.dependencies.clone());
        if watch.is_cancelled() {
            self.notifier.untrack(watch.id());
        }
        projection
    }

    fn report(&self, operation: &Operation, error: &CacheError) {
        if error.is_authentication() {
            warn!(operation = %operation.name(), error = %error, "Authentication rejected");
            let _ = self.events.send(SessionEvent::AuthenticationFailed {
                operation: operation.name().to_string(),
                message: error.to_string(),
            });
        } else {
            debug!(operation = %operation.name(), error = %error, "Operation failed");
        }
    }
}
