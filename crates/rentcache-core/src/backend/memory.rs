//! In-process backend holding tables of JSON rows.
//!
//! Writes apply to the tables and fan change events out to the matching push
//! subscriptions, the way a hosted database with realtime replication would.
//! Failure injection, write gating and call counters make it usable as a
//! deterministic stand-in for the remote service.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

use super::{
    Backend, ChangeEvent, ChangeKind, PushBackend, PushEvent, PushSink, PushSubscription, WriteOp,
    WriteRequest,
};
use crate::cache::key::field_as_string;
use crate::cache::{QueryKey, Scope, Topic};
use crate::error::BackendError;
use crate::models::QueryData;

struct Subscriber {
    id: u64,
    topic: Topic,
    scope: Scope,
    sink: PushSink,
}

#[derive(Default)]
struct Counters {
    queries: AtomicUsize,
    writes: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

#[derive(Default)]
struct MemoryInner {
    tables: Mutex<HashMap<Topic, Vec<Value>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    query_failures: Mutex<VecDeque<BackendError>>,
    write_failures: Mutex<VecDeque<BackendError>>,
    write_gate: Mutex<Option<Arc<Semaphore>>>,
    latency: Mutex<Option<Duration>>,
    counters: Counters,
}

/// Holds back backend writes until released, one permit per write.
#[derive(Clone)]
pub struct WriteGate {
    permits: Arc<Semaphore>,
}

impl WriteGate {
    pub fn release(&self, writes: usize) {
        self.permits.add_permits(writes);
    }
}

/// Clone is cheap and shares the same tables.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
}

fn row_id(row: &Value) -> Option<String> {
    row.get("id").map(field_as_string)
}

fn merge(row: &mut Value, patch: &Value) {
    if let (Some(target), Some(fields)) = (row.as_object_mut(), patch.as_object()) {
        for (column, value) in fields {
            target.insert(column.clone(), value.clone());
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents of `topic`'s table without emitting events.
    pub fn seed(&self, topic: Topic, rows: Vec<Value>) {
        self.inner.tables.lock().insert(topic, rows);
    }

    /// Authoritative rows of `topic`, as the server currently holds them.
    pub fn rows(&self, topic: &Topic) -> Vec<Value> {
        self.inner.tables.lock().get(topic).cloned().unwrap_or_default()
    }

    pub fn row(&self, topic: &Topic, id: &str) -> Option<Value> {
        self.rows(topic)
            .into_iter()
            .find(|row| row_id(row).as_deref() == Some(id))
    }

    pub fn fail_next_query(&self, error: BackendError) {
        self.inner.query_failures.lock().push_back(error);
    }

    pub fn fail_next_write(&self, error: BackendError) {
        self.inner.write_failures.lock().push_back(error);
    }

    /// Make every subsequent write wait for a permit from the returned gate.
    pub fn gate_writes(&self) -> WriteGate {
        let permits = Arc::new(Semaphore::new(0));
        *self.inner.write_gate.lock() = Some(Arc::clone(&permits));
        WriteGate { permits }
    }

    /// Delay applied to every query and write.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.inner.latency.lock() = latency;
    }

    /// Apply a write immediately, as another client would, and emit its event.
    pub fn remote_write(&self, request: WriteRequest) -> Result<Value, BackendError> {
        self.apply(request)
    }

    /// Report a terminal channel failure to every subscription on `topic`.
    pub fn emit_error(&self, topic: &Topic, message: &str) {
        let sinks: Vec<PushSink> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .filter(|s| s.topic == *topic)
            .map(|s| s.sink.clone())
            .collect();
        for sink in sinks {
            sink.deliver(PushEvent::Error(message.to_string()));
        }
    }

    pub fn query_count(&self) -> usize {
        self.inner.counters.queries.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.inner.counters.writes.load(Ordering::SeqCst)
    }

    pub fn opened_subscriptions(&self) -> usize {
        self.inner.counters.opened.load(Ordering::SeqCst)
    }

    pub fn closed_subscriptions(&self) -> usize {
        self.inner.counters.closed.load(Ordering::SeqCst)
    }

    pub fn open_subscriptions(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    fn apply(&self, request: WriteRequest) -> Result<Value, BackendError> {
        let WriteRequest { topic, op } = request;
        let (kind, record) = {
            let mut tables = self.inner.tables.lock();
            let table = tables.entry(topic.clone()).or_default();
            match op {
                WriteOp::Insert(row) => {
                    table.push(row.clone());
                    (ChangeKind::Insert, row)
                }
                WriteOp::Update { id, patch } => {
                    let row = table
                        .iter_mut()
                        .find(|row| row_id(row).as_deref() == Some(id.as_str()))
                        .ok_or_else(|| BackendError::NotFound(format!("{} {}", topic, id)))?;
                    merge(row, &patch);
                    (ChangeKind::Update, row.clone())
                }
                WriteOp::Delete { id } => {
                    let position = table
                        .iter()
                        .position(|row| row_id(row).as_deref() == Some(id.as_str()))
                        .ok_or_else(|| BackendError::NotFound(format!("{} {}", topic, id)))?;
                    (ChangeKind::Delete, table.remove(position))
                }
            }
        };
        debug!(topic = %topic, kind = %kind, "Applied write");
        self.broadcast(&topic, ChangeEvent { kind, record: record.clone() });
        Ok(record)
    }

    fn broadcast(&self, topic: &Topic, event: ChangeEvent) {
        let sinks: Vec<PushSink> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .filter(|s| s.topic == *topic && s.scope.matches_record(&event.record))
            .map(|s| s.sink.clone())
            .collect();
        trace!(topic = %topic, subscribers = sinks.len(), "Broadcasting change");
        for sink in sinks {
            sink.deliver(PushEvent::Change(event.clone()));
        }
    }

    fn latency(&self) -> Option<Duration> {
        *self.inner.latency.lock()
    }
}

impl Backend for MemoryBackend {
    fn query(&self, key: &QueryKey) -> BoxFuture<'static, Result<QueryData, BackendError>> {
        self.inner.counters.queries.fetch_add(1, Ordering::SeqCst);
        let failure = self.inner.query_failures.lock().pop_front();
        let latency = self.latency();
        let backend = self.clone();
        let key = key.clone();

        async move {
            if let Some(delay) = latency {
                tokio::time::sleep(delay).await;
            }
            if let Some(error) = failure {
                return Err(error);
            }
            let rows: Vec<Value> = backend
                .rows(&key.topic)
                .into_iter()
                .filter(|row| key.scope.matches_record(row))
                .collect();
            QueryData::from_rows(&key.topic, rows)
        }
        .boxed()
    }

    fn write(&self, request: WriteRequest) -> BoxFuture<'static, Result<(), BackendError>> {
        self.inner.counters.writes.fetch_add(1, Ordering::SeqCst);
        let gate = self.inner.write_gate.lock().clone();
        let latency = self.latency();
        let backend = self.clone();

        async move {
            if let Some(gate) = gate {
                match gate.acquire().await {
                    Ok(permit) => permit.forget(),
                    Err(_) => return Err(BackendError::Transient("write gate closed".into())),
                }
            }
            if let Some(delay) = latency {
                tokio::time::sleep(delay).await;
            }
            if let Some(error) = backend.inner.write_failures.lock().pop_front() {
                return Err(error);
            }
            backend.apply(request).map(|_| ())
        }
        .boxed()
    }
}

struct MemorySubscription {
    backend: Weak<MemoryInner>,
    id: u64,
    closed: AtomicBool,
}

impl PushSubscription for MemorySubscription {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.backend.upgrade() {
            inner.subscribers.lock().retain(|s| s.id != self.id);
            inner.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl PushBackend for MemoryBackend {
    fn subscribe(
        &self,
        topic: &Topic,
        scope: &Scope,
        sink: PushSink,
    ) -> Result<Box<dyn PushSubscription>, BackendError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.subscribers.lock().push(Subscriber {
            id,
            topic: topic.clone(),
            scope: scope.clone(),
            sink,
        });
        self.inner.counters.opened.fetch_add(1, Ordering::SeqCst);
        debug!(topic = %topic, scope = %scope, subscription = id, "Push subscription opened");

        Ok(Box::new(MemorySubscription {
            backend: Arc::downgrade(&self.inner),
            id,
            closed: AtomicBool::new(false),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tenant(id: &str, agent: &str) -> Value {
        json!({"id": id, "name": format!("Tenant {}", id), "agent_id": agent, "unit": null})
    }

    fn recording_sink() -> (Arc<Mutex<Vec<PushEvent>>>, PushSink) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let held = Arc::clone(&events);
        (events, PushSink::new(move |event| held.lock().push(event)))
    }

    #[tokio::test]
    async fn test_query_filters_by_scope() {
        let backend = MemoryBackend::new();
        backend.seed(Topic::TENANTS, vec![tenant("t1", "a1"), tenant("t2", "a2")]);

        let data = backend
            .query(&QueryKey::scoped(Topic::TENANTS, "agent_id", "a1"))
            .await
            .unwrap();
        let tenants = data.tenants().unwrap();
        assert_eq!(tenants.len(), 1);
        assert_eq!(tenants[0].id, "t1");
        assert_eq!(backend.query_count(), 1);
    }

    #[tokio::test]
    async fn test_write_emits_to_matching_subscriptions() {
        let backend = MemoryBackend::new();
        backend.seed(Topic::TENANTS, vec![tenant("t1", "a1")]);
        let (a1_events, a1_sink) = recording_sink();
        let (a2_events, a2_sink) = recording_sink();
        let _a1 = backend.subscribe(&Topic::TENANTS, &Scope::eq("agent_id", "a1"), a1_sink).unwrap();
        let _a2 = backend.subscribe(&Topic::TENANTS, &Scope::eq("agent_id", "a2"), a2_sink).unwrap();

        backend
            .write(WriteRequest::update(Topic::TENANTS, "t1", json!({"unit": "9"})))
            .await
            .unwrap();

        let events = a1_events.lock();
        assert_eq!(events.len(), 1);
        match &events[0] {
            PushEvent::Change(change) => {
                assert_eq!(change.kind, ChangeKind::Update);
                assert_eq!(change.record["unit"], "9");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(a2_events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_injected_write_failure_leaves_table_untouched() {
        let backend = MemoryBackend::new();
        backend.seed(Topic::TENANTS, vec![tenant("t1", "a1")]);
        backend.fail_next_write(BackendError::Rejected("unit is required".into()));

        let result = backend
            .write(WriteRequest::update(Topic::TENANTS, "t1", json!({"unit": null})))
            .await;
        assert!(matches!(result, Err(BackendError::Rejected(_))));
        assert_eq!(backend.row(&Topic::TENANTS, "t1").unwrap()["name"], "Tenant t1");
    }

    #[tokio::test]
    async fn test_update_of_missing_row_is_not_found() {
        let backend = MemoryBackend::new();
        let result = backend
            .write(WriteRequest::update(Topic::TENANTS, "nope", json!({})))
            .await;
        assert!(matches!(result, Err(BackendError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_and_insert() {
        let backend = MemoryBackend::new();
        backend.seed(Topic::TENANTS, vec![tenant("t1", "a1")]);
        backend.remote_write(WriteRequest::insert(Topic::TENANTS, tenant("t2", "a1"))).unwrap();
        backend.remote_write(WriteRequest::delete(Topic::TENANTS, "t1")).unwrap();

        let ids: Vec<String> = backend.rows(&Topic::TENANTS).iter().filter_map(row_id).collect();
        assert_eq!(ids, vec!["t2".to_string()]);
    }

    #[tokio::test]
    async fn test_gated_write_waits_for_release() {
        let backend = MemoryBackend::new();
        backend.seed(Topic::TENANTS, vec![tenant("t1", "a1")]);
        let gate = backend.gate_writes();

        let pending = tokio::spawn({
            let backend = backend.clone();
            async move {
                backend
                    .write(WriteRequest::update(Topic::TENANTS, "t1", json!({"unit": "2"})))
                    .await
            }
        });
        tokio::task::yield_now().await;
        assert!(backend.row(&Topic::TENANTS, "t1").unwrap()["unit"].is_null());

        gate.release(1);
        pending.await.unwrap().unwrap();
        assert_eq!(backend.row(&Topic::TENANTS, "t1").unwrap()["unit"], "2");
    }

    #[test]
    fn test_close_is_counted_once() {
        let backend = MemoryBackend::new();
        let (_, sink) = recording_sink();
        let subscription = backend.subscribe(&Topic::TENANTS, &Scope::All, sink).unwrap();
        assert_eq!(backend.open_subscriptions(), 1);

        subscription.close();
        subscription.close();
        assert_eq!(backend.open_subscriptions(), 0);
        assert_eq!(backend.opened_subscriptions(), 1);
        assert_eq!(backend.closed_subscriptions(), 1);
    }

    #[test]
    fn test_emit_error_reaches_topic_subscribers() {
        let backend = MemoryBackend::new();
        let (events, sink) = recording_sink();
        let _sub = backend.subscribe(&Topic::COLLECTIONS, &Scope::All, sink).unwrap();

        backend.emit_error(&Topic::COLLECTIONS, "socket closed");
        assert_eq!(*events.lock(), vec![PushEvent::Error("socket closed".into())]);
    }
}
