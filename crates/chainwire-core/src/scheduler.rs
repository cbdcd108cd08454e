//! Request scheduler: de-duplication cache and batch windows.
//!
//! Every logical call is reduced to a [`Fingerprint`] of
//! `(transport key, method, canonical params)`. While an operation for a
//! fingerprint is in flight, further identical calls attach to it instead
//! of producing wire traffic; when it resolves, the single outcome is
//! broadcast to every attached caller in attach order and the entry leaves
//! the cache.
//!
//! ```text
//! call ─► fingerprint ─► DedupeCache ─┬─ hit:  attach waiter
//!                                     └─ miss: PendingOperation ─┬─ send()
//!                                                                └─ BatchWindow ─► send_batch()
//! ```
//!
//! Wire work runs on spawned tasks, so a caller that stops waiting never
//! aborts a request another caller may have joined.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{CallError, TransportError};
use crate::request::{IdAllocator, JsonRpcRequest, JsonRpcResponse};
use crate::transport::{BatchConfig, RpcTransport};

/// Stable identity of a logical request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(key: &str, method: &str, params: &[Value]) -> Self {
        let canonical = Value::Array(vec![
            Value::from(key),
            Value::from(method),
            Value::Array(params.iter().map(canonical).collect()),
        ]);
        Self(canonical.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rebuild `value` with object keys in sorted order at every depth.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonical(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// Bounded fingerprint map with least-recently-used eviction.
pub struct DedupeCache<V> {
    entries: LruCache<Fingerprint, V>,
}

impl<V> DedupeCache<V> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Look up an entry and mark it most recently used.
    pub fn get(&mut self, fingerprint: &Fingerprint) -> Option<&mut V> {
        self.entries.get_mut(fingerprint)
    }

    /// Look up an entry without touching its recency.
    pub fn peek(&self, fingerprint: &Fingerprint) -> Option<&V> {
        self.entries.peek(fingerprint)
    }

    /// Insert a new entry, returning the one evicted to make room.
    pub fn insert(&mut self, fingerprint: Fingerprint, value: V) -> Option<(Fingerprint, V)> {
        self.entries.push(fingerprint, value)
    }

    pub fn remove(&mut self, fingerprint: &Fingerprint) -> Option<V> {
        self.entries.pop(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of in-flight fingerprints tracked for de-duplication.
    pub cache_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 8192,
        }
    }
}

type Waiter = oneshot::Sender<Result<Value, CallError>>;
type Waiters = Arc<Mutex<Vec<Waiter>>>;

/// In-flight operation for one fingerprint.
///
/// The waiter list is shared with the task driving the wire work, so an
/// entry evicted from the cache still resolves everyone attached to it.
struct PendingOperation {
    seq: u64,
    waiters: Waiters,
}

/// An operation on its way to the wire.
struct Queued {
    fingerprint: Fingerprint,
    seq: u64,
    request: JsonRpcRequest,
    waiters: Waiters,
}

#[derive(Default)]
struct BatchWindow {
    /// Bumped on every flush so a stale timer cannot flush a newer window.
    generation: u64,
    queued: Vec<Queued>,
}

enum Action {
    Attached,
    /// Added to a window whose timer is already armed.
    Queued,
    Send(Queued),
    Arm { generation: u64, wait: Duration },
    Flush(Vec<Queued>),
}

struct State {
    cache: DedupeCache<PendingOperation>,
    windows: HashMap<String, BatchWindow>,
    next_seq: u64,
}

struct Inner {
    state: Mutex<State>,
    ids: IdAllocator,
}

/// De-duplicating, batching request scheduler.
///
/// Cheap to clone; clones share the same cache. Independent schedulers
/// never share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    cache: DedupeCache::new(config.cache_capacity),
                    windows: HashMap::new(),
                    next_seq: 0,
                }),
                ids: IdAllocator::new(),
            }),
        }
    }

    /// Number of fingerprints currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().cache.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.state.lock().cache.capacity()
    }

    /// Issue `method(params)` on `transport`, joining an identical call
    /// already in flight if there is one.
    pub async fn call(
        &self,
        transport: &Arc<dyn RpcTransport>,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, CallError> {
        let fingerprint = Fingerprint::new(transport.key(), method, &params);
        let (tx, rx) = oneshot::channel();

        match self.enqueue(transport, fingerprint.clone(), method, params, tx) {
            Action::Attached => {
                tracing::trace!(method, %fingerprint, "joined in-flight request");
            }
            Action::Queued => {}
            Action::Send(queued) => {
                let inner = self.inner.clone();
                let transport = transport.clone();
                tokio::spawn(async move { send_one(&inner, transport, queued).await });
            }
            Action::Arm { generation, wait } => self.arm(transport.clone(), generation, wait),
            Action::Flush(batch) => {
                let inner = self.inner.clone();
                let transport = transport.clone();
                tokio::spawn(async move { flush(&inner, transport, batch).await });
            }
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(CallError {
                method: method.to_string(),
                fingerprint: fingerprint.to_string(),
                source: TransportError::Other("request dropped before completion".into()),
            }),
        }
    }

    fn enqueue(
        &self,
        transport: &Arc<dyn RpcTransport>,
        fingerprint: Fingerprint,
        method: &str,
        params: Vec<Value>,
        tx: Waiter,
    ) -> Action {
        let mut state = self.inner.state.lock();

        if let Some(op) = state.cache.get(&fingerprint) {
            op.waiters.lock().push(tx);
            return Action::Attached;
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let waiters: Waiters = Arc::new(Mutex::new(vec![tx]));
        let op = PendingOperation {
            seq,
            waiters: waiters.clone(),
        };
        if let Some((evicted, _)) = state.cache.insert(fingerprint.clone(), op) {
            tracing::debug!(%evicted, "dedupe cache full, evicted least recently used entry");
        }

        let queued = Queued {
            fingerprint,
            seq,
            request: JsonRpcRequest::new(self.inner.ids.next_id(), method, params),
            waiters,
        };

        let Some(BatchConfig { wait, max_size }) = transport.batch_config() else {
            return Action::Send(queued);
        };
        let window = state.windows.entry(transport.key().to_string()).or_default();
        window.queued.push(queued);
        if window.queued.len() >= max_size.max(1) {
            window.generation += 1;
            Action::Flush(std::mem::take(&mut window.queued))
        } else if window.queued.len() == 1 {
            Action::Arm {
                generation: window.generation,
                wait,
            }
        } else {
            Action::Queued
        }
    }

    /// Flush the transport's window once `wait` has elapsed, unless it was
    /// flushed for size in the meantime.
    fn arm(&self, transport: Arc<dyn RpcTransport>, generation: u64, wait: Duration) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if wait.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(wait).await;
            }
            let batch = {
                let mut state = inner.state.lock();
                match state.windows.get_mut(transport.key()) {
                    Some(window) if window.generation == generation && !window.queued.is_empty() => {
                        window.generation += 1;
                        std::mem::take(&mut window.queued)
                    }
                    _ => return,
                }
            };
            flush(&inner, transport, batch).await;
        });
    }
}

fn into_value(resp: JsonRpcResponse) -> Result<Value, TransportError> {
    resp.into_result().map_err(TransportError::Rpc)
}

async fn send_one(inner: &Inner, transport: Arc<dyn RpcTransport>, queued: Queued) {
    let outcome = transport
        .send(queued.request.clone())
        .await
        .and_then(into_value);
    resolve(inner, queued, outcome);
}

async fn flush(inner: &Inner, transport: Arc<dyn RpcTransport>, batch: Vec<Queued>) {
    tracing::debug!(transport = transport.key(), size = batch.len(), "flushing batch");
    let reqs: Vec<JsonRpcRequest> = batch.iter().map(|q| q.request.clone()).collect();
    match transport.send_batch(reqs).await {
        Ok(results) => {
            let mut results = results.into_iter();
            for queued in batch {
                let outcome = results.next().unwrap_or_else(|| {
                    Err(TransportError::MissingResponse {
                        id: queued.request.id.clone(),
                    })
                });
                resolve(inner, queued, outcome.and_then(into_value));
            }
        }
        Err(e) => {
            for queued in batch {
                resolve(inner, queued, Err(e.clone()));
            }
        }
    }
}

/// Retire the operation and broadcast its outcome to every waiter.
fn resolve(inner: &Inner, queued: Queued, outcome: Result<Value, TransportError>) {
    let waiters = {
        let mut state = inner.state.lock();
        // The slot may already belong to a newer operation after an eviction.
        if state
            .cache
            .peek(&queued.fingerprint)
            .is_some_and(|op| op.seq == queued.seq)
        {
            state.cache.remove(&queued.fingerprint);
        }
        std::mem::take(&mut *queued.waiters.lock())
    };

    let outcome = outcome.map_err(|source| CallError {
        method: queued.request.method.clone(),
        fingerprint: queued.fingerprint.to_string(),
        source,
    });
    if let Err(e) = &outcome {
        tracing::debug!(error = %e, waiters = waiters.len(), "request failed");
    }
    for waiter in waiters {
        let _ = waiter.send(outcome.clone());
    }
}

/// A transport bound to a scheduler: the caller-facing entry point.
#[derive(Clone)]
pub struct RpcClient {
    transport: Arc<dyn RpcTransport>,
    scheduler: Scheduler,
}

impl RpcClient {
    /// Client with its own default scheduler.
    pub fn new(transport: Arc<dyn RpcTransport>) -> Self {
        Self::with_scheduler(transport, Scheduler::default())
    }

    /// Client sharing `scheduler` with other clients.
    pub fn with_scheduler(transport: Arc<dyn RpcTransport>, scheduler: Scheduler) -> Self {
        Self {
            transport,
            scheduler,
        }
    }

    pub fn transport(&self) -> &Arc<dyn RpcTransport> {
        &self.transport
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, CallError> {
        self.scheduler.call(&self.transport, method, params).await
    }

    /// Call and deserialize the result into `T`.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, CallError> {
        let fingerprint = Fingerprint::new(self.transport.key(), method, &params);
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(|e| CallError {
            method: method.to_string(),
            fingerprint: fingerprint.to_string(),
            source: e.into(),
        })
    }
}
