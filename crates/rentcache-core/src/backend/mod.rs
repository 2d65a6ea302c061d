//! Boundary contracts with the remote data backend.
//!
//! The sync layer consumes three primitives:
//! - `Backend::query` / `Backend::write`: opaque request/response calls
//! - `PushBackend::subscribe`: a standing subscription that reports remote
//!   changes for a `(topic, scope)` pair until closed
//!
//! Two implementations ship with the crate: `MemoryBackend` (tests, demo)
//! and `RestBackend` (HTTP, PostgREST-style URLs).

pub mod memory;
pub mod rest;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{Fetcher, QueryKey, Scope, Topic};
use crate::error::BackendError;
use crate::models::QueryData;

pub use memory::{MemoryBackend, WriteGate};
pub use rest::RestBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "insert"),
            ChangeKind::Update => write!(f, "update"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

/// A committed remote write, as reported by a push subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub record: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Change(ChangeEvent),
    /// Terminal failure of the channel; no further events follow.
    Error(String),
}

/// Where a push subscription delivers its events.
#[derive(Clone)]
pub struct PushSink {
    deliver: Arc<dyn Fn(PushEvent) + Send + Sync>,
}

impl PushSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(PushEvent) + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn deliver(&self, event: PushEvent) {
        (self.deliver)(event)
    }
}

impl fmt::Debug for PushSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PushSink")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    Insert(Value),
    Update { id: String, patch: Value },
    Delete { id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub topic: Topic,
    pub op: WriteOp,
}

impl WriteRequest {
    pub fn update(topic: Topic, id: impl Into<String>, patch: Value) -> Self {
        Self {
            topic,
            op: WriteOp::Update {
                id: id.into(),
                patch,
            },
        }
    }

    pub fn insert(topic: Topic, row: Value) -> Self {
        Self {
            topic,
            op: WriteOp::Insert(row),
        }
    }

    pub fn delete(topic: Topic, id: impl Into<String>) -> Self {
        Self {
            topic,
            op: WriteOp::Delete { id: id.into() },
        }
    }
}

/// Request/response half of the backend.
pub trait Backend: Send + Sync {
    fn query(&self, key: &QueryKey) -> BoxFuture<'static, Result<QueryData, BackendError>>;

    fn write(&self, request: WriteRequest) -> BoxFuture<'static, Result<(), BackendError>>;
}

/// Push half of the backend.
pub trait PushBackend: Send + Sync {
    fn subscribe(
        &self,
        topic: &Topic,
        scope: &Scope,
        sink: PushSink,
    ) -> Result<Box<dyn PushSubscription>, BackendError>;
}

/// A live push subscription. `close` releases it; later events are dropped.
pub trait PushSubscription: Send + Sync {
    fn close(&self);
}

/// Adapts a `Backend` into the cache store's fetch source.
pub struct BackendFetcher<B: ?Sized> {
    backend: Arc<B>,
}

impl<B: ?Sized> BackendFetcher<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }
}

impl<B> Fetcher<QueryData> for BackendFetcher<B>
where
    B: Backend + ?Sized,
{
    fn fetch(&self, key: &QueryKey) -> BoxFuture<'static, Result<QueryData, BackendError>> {
        self.backend.query(key)
    }
}
