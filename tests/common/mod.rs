//! Shared fixtures for the integration tests.
//!
//! A scripted transport with per-operation responses, call counters, gates
//! to hold a response until the test releases it, and push channels; plus
//! scripted lifecycle collaborators.
#![allow(dead_code)]

use async_trait::async_trait;
use futures::channel::mpsc;
use pantry_cache::prelude::*;
use pantry_cache::transport::RecordStream;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

type Scripted = CacheResult<OperationResult>;

/// In-memory transport driven by the test.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<HashMap<String, VecDeque<Scripted>>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    calls: Mutex<HashMap<String, usize>>,
    pushes: Mutex<HashMap<String, mpsc::UnboundedReceiver<CacheResult<RecordSet>>>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a response. The last queued response repeats.
    pub fn respond(&self, operation: &str, response: Scripted) {
        self.responses
            .lock()
            .entry(operation.to_string())
            .or_default()
            .push_back(response);
    }

    /// Hold responses for `operation` until [`Notify::notify_one`] is called
    /// on the returned gate, once per call.
    pub fn gate(&self, operation: &str) -> Arc<Notify> {
        self.gates
            .lock()
            .entry(operation.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Open a push channel the next `listen(operation)` will read from.
    pub fn push_channel(&self, operation: &str) -> mpsc::UnboundedSender<CacheResult<RecordSet>> {
        let (sender, receiver) = mpsc::unbounded();
        self.pushes.lock().insert(operation.to_string(), receiver);
        sender
    }

    /// Number of `execute` calls made for `operation`.
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    fn next_response(&self, operation: &str) -> Scripted {
        let mut responses = self.responses.lock();
        match responses.get_mut(operation) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => Err(CacheError::Transport(format!("no response for {}", operation))),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(
        &self,
        operation: &Operation,
        _arguments: &JsonValue,
        _policy: CachePolicy,
    ) -> CacheResult<OperationResult> {
        let name = operation.name().to_string();
        *self.calls.lock().entry(name.clone()).or_default() += 1;

        let gate = self.gates.lock().get(&name).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.next_response(&name)
    }

    async fn listen(&self, operation: &Operation, _arguments: &JsonValue) -> CacheResult<RecordStream> {
        match self.pushes.lock().remove(operation.name()) {
            Some(receiver) => Ok(Box::pin(receiver)),
            None => Err(CacheError::Transport(format!("no stream for {}", operation.name()))),
        }
    }
}

/// Records every snapshot a subscriber receives.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<WatchSnapshot>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl Fn(&WatchSnapshot) + Send + Sync + 'static {
        let seen = self.seen.clone();
        move |snapshot: &WatchSnapshot| seen.lock().push(snapshot.clone())
    }

    pub fn snapshots(&self) -> Vec<WatchSnapshot> {
        self.seen.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn last(&self) -> Option<WatchSnapshot> {
        self.seen.lock().last().cloned()
    }

    pub fn last_value(&self) -> Option<JsonValue> {
        self.last().and_then(|s| s.value.map(|v| (*v).clone()))
    }

    /// Wait until at least `count` snapshots arrived.
    pub async fn wait_for(&self, count: usize) {
        for _ in 0..200 {
            if self.count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} snapshots, got {:?}", count, self.snapshots());
    }
}

/// Give spawned tasks a chance to run.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

pub fn item(id: &str) -> CacheKey {
    CacheKey::new("Item", id)
}

/// A response holding one `Item` with the given fields.
pub fn item_response(id: &str, fields: &[(&str, JsonValue)]) -> Scripted {
    let mut record = Record::new();
    for (name, value) in fields {
        record.set(*name, value.clone());
    }
    Ok(OperationResult::new(
        RecordSet::new().with(item(id), record),
        item(id),
    ))
}

/// A response holding a list of `Item`s.
pub fn items_response(items: &[(&str, &str)]) -> Scripted {
    let mut records = RecordSet::new();
    let mut keys = Vec::new();
    for (id, name) in items {
        records.insert(item(id), Record::new().with("name", *name));
        keys.push(item(id));
    }
    Ok(OperationResult::new(records, keys))
}

pub fn item_query() -> Operation {
    Operation::query("item", Selection::fields(["name"]))
}

pub fn items_query() -> Operation {
    Operation::query("items", Selection::fields(["name"]))
}

/// Authenticator with scripted outcomes and a call log.
pub struct ScriptedAuth {
    pub restore: Mutex<CacheResult<Option<Session>>>,
    pub sign_in: Mutex<CacheResult<Session>>,
    pub refresh: Mutex<CacheResult<Session>>,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl ScriptedAuth {
    pub fn new(restored: Option<Session>) -> Arc<Self> {
        Arc::new(Self {
            restore: Mutex::new(Ok(restored)),
            sign_in: Mutex::new(Ok(Session::new("ann", "token"))),
            refresh: Mutex::new(Ok(Session::new("ann", "fresh"))),
            log: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl Authenticator for ScriptedAuth {
    async fn restore_session(&self) -> CacheResult<Option<Session>> {
        self.log.lock().push("restore".to_string());
        self.restore.lock().clone()
    }

    async fn sign_in(&self, credentials: &Credentials) -> CacheResult<Session> {
        self.log.lock().push(format!("sign_in:{}", credentials.identifier));
        self.sign_in.lock().clone()
    }

    async fn refresh(&self, _session: &Session) -> CacheResult<Session> {
        self.log.lock().push("refresh".to_string());
        self.refresh.lock().clone()
    }

    async fn sign_out(&self, session: &Session) -> CacheResult<()> {
        self.log.lock().push(format!("sign_out:{}", session.user_id));
        Ok(())
    }
}

/// Hands out one shared scripted transport.
pub struct SharedTransport {
    pub transport: Arc<ScriptedTransport>,
    pub connects: AtomicUsize,
    pub fail: Mutex<Option<CacheError>>,
}

impl SharedTransport {
    pub fn new(transport: Arc<ScriptedTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            connects: AtomicUsize::new(0),
            fail: Mutex::new(None),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportFactory for SharedTransport {
    async fn connect(&self, _session: &Session) -> CacheResult<Arc<dyn Transport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.fail.lock().clone() {
            return Err(error);
        }
        Ok(self.transport.clone())
    }
}

/// Fetches `items` as baseline and keeps a cache-only watch on it.
pub struct ItemsHydration {
    pub recorder: Recorder,
}

impl ItemsHydration {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            recorder: Recorder::new(),
        })
    }
}

#[async_trait]
impl HydrationPlan for ItemsHydration {
    async fn hydrate(&self, client: &CacheClient) -> CacheResult<Vec<SubscriptionHandle>> {
        client
            .query(items_query(), json!({"household": "h1"}), CachePolicy::NetworkOnly)
            .await?;
        let handle = client.subscribe(
            items_query(),
            json!({"household": "h1"}),
            CachePolicy::CacheOnly,
            self.recorder.callback(),
        );
        Ok(vec![handle])
    }
}

pub fn lifecycle_config(min_loading: Duration) -> LifecycleConfig {
    LifecycleConfig {
        min_loading_duration: min_loading,
        durable_enabled: false,
        ..LifecycleConfig::default()
    }
}
