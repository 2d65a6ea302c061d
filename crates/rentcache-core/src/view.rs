//! Thin view consumer: what a screen holds while it shows one query.
//!
//! A `View` keeps the push subscription for its key alive, observes the key
//! in the store, and turns every write into a `changed()` wakeup. Reading is
//! always synchronous from the store.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::cache::{CacheEntry, CacheStore, EntryStatus, ObserverHandle, QueryKey};
use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::models::QueryData;
use crate::subscription::Lease;

pub struct View {
    key: QueryKey,
    store: CacheStore<QueryData>,
    changes: watch::Receiver<u64>,
    _observer: ObserverHandle<QueryData>,
    _lease: Lease,
}

impl View {
    /// Lease the key's subscription, observe it and start loading it if
    /// nothing fresh is cached. Must be called within a tokio runtime.
    pub fn open(context: &SyncContext, key: QueryKey) -> Result<Self> {
        let lease = context.subscriptions().ensure_key(&key)?;
        let store = context.store().clone();

        let (notify, changes) = watch::channel(0u64);
        let observer = store.observe(&key, move |_| {
            notify.send_modify(|writes| *writes += 1);
        });

        let cached_fresh = store.read(&key).map_or(false, |entry| entry.is_fresh());
        if !cached_fresh {
            store.spawn_refetch(&key);
        }
        debug!(key = %key, cached_fresh, "View opened");

        Ok(Self {
            key,
            store,
            changes,
            _observer: observer,
            _lease: lease,
        })
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Current entry, whatever its status.
    pub fn snapshot(&self) -> Option<Arc<CacheEntry<QueryData>>> {
        self.store.read(&self.key)
    }

    /// Wait for the next write to the key.
    pub async fn changed(&mut self) -> Result<()> {
        self.changes.changed().await.map_err(|_| SyncError::ShutDown)
    }

    /// Wait until the key holds a settled (non-pending) entry and return it.
    pub async fn settled(&mut self) -> Result<Arc<CacheEntry<QueryData>>> {
        loop {
            if let Some(entry) = self.snapshot() {
                if entry.status != EntryStatus::Pending && !self.store.is_fetching(&self.key) {
                    return Ok(entry);
                }
            }
            self.changed().await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, WriteRequest};
    use crate::cache::Topic;
    use crate::config::SyncConfig;
    use crate::error::BackendError;
    use serde_json::json;

    fn context() -> (SyncContext, MemoryBackend) {
        let backend = MemoryBackend::new();
        backend.seed(
            Topic::TENANTS,
            vec![json!({"id": "t1", "name": "Ada", "agent_id": "a1", "unit": "1A"})],
        );
        (SyncContext::new(SyncConfig::default(), Arc::new(backend.clone())), backend)
    }

    #[tokio::test]
    async fn test_open_loads_and_follows_remote_changes() {
        let (context, backend) = context();
        let key = QueryKey::all(Topic::TENANTS);
        let mut view = View::open(&context, key.clone()).unwrap();

        let loaded = view.settled().await.unwrap();
        assert_eq!(loaded.status, EntryStatus::Fresh);
        assert_eq!(loaded.data.tenants().unwrap()[0].display_unit(), "Unit 1A");

        backend
            .remote_write(WriteRequest::update(Topic::TENANTS, "t1", json!({"unit": "7F"})))
            .unwrap();
        view.changed().await.unwrap();

        let refreshed = loop {
            let entry = view.settled().await.unwrap();
            if entry.status == EntryStatus::Fresh {
                break entry;
            }
            view.changed().await.unwrap();
        };
        assert_eq!(refreshed.data.tenants().unwrap()[0].unit.as_deref(), Some("7F"));
    }

    #[tokio::test]
    async fn test_failed_refetch_keeps_last_data_visible() {
        let (context, backend) = context();
        let mut view = View::open(&context, QueryKey::all(Topic::TENANTS)).unwrap();
        view.settled().await.unwrap();

        backend.fail_next_query(BackendError::ServerError("maintenance".into()));
        backend
            .remote_write(WriteRequest::update(Topic::TENANTS, "t1", json!({"unit": "7F"})))
            .unwrap();

        let failed = loop {
            let entry = view.settled().await.unwrap();
            if entry.status == EntryStatus::Error {
                break entry;
            }
            view.changed().await.unwrap();
        };
        assert_eq!(failed.data.tenants().unwrap()[0].unit.as_deref(), Some("1A"));
        assert!(failed.error.as_deref().unwrap().contains("maintenance"));
    }

    #[tokio::test]
    async fn test_dropping_view_releases_subscription_and_observer() {
        let (context, backend) = context();
        let key = QueryKey::all(Topic::TENANTS);
        let view = View::open(&context, key.clone()).unwrap();
        assert_eq!(backend.open_subscriptions(), 1);
        assert_eq!(context.store().observer_count(&key), 1);

        drop(view);
        assert_eq!(backend.open_subscriptions(), 0);
        assert_eq!(backend.closed_subscriptions(), 1);
        assert_eq!(context.store().observer_count(&key), 0);
    }
}
