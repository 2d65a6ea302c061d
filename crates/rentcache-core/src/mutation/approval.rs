//! Approve, reject and undo on collection records.
//!
//! Each action is an optimistic mutation on every cached collections query
//! that holds the record. The returned `ApprovalReceipt` carries the review
//! fields exactly as they were before the action, so `undo` can put them
//! back rather than reset them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::MutationEngine;
use crate::backend::{Backend, WriteRequest};
use crate::cache::{CacheStore, QueryKey, Topic};
use crate::error::{Result, SyncError};
use crate::models::{ApprovalState, QueryData};

/// What an approval action replaced and what it wrote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalReceipt {
    /// Query the action was taken from.
    pub key: QueryKey,
    pub collection_id: String,
    pub prior: ApprovalState,
    pub applied: ApprovalState,
    pub at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Approvals {
    engine: MutationEngine<QueryData>,
    backend: Arc<dyn Backend>,
}

impl Approvals {
    pub fn new(engine: MutationEngine<QueryData>, backend: Arc<dyn Backend>) -> Self {
        Self { engine, backend }
    }

    fn store(&self) -> &CacheStore<QueryData> {
        self.engine.store()
    }

    /// Mark a pending collection verified by `approver`.
    pub async fn approve(&self, key: &QueryKey, collection_id: &str, approver: &str) -> Result<ApprovalReceipt> {
        let next = ApprovalState::verified(approver, Utc::now());
        self.apply(key, collection_id, next).await
    }

    pub async fn reject(
        &self,
        key: &QueryKey,
        collection_id: &str,
        approver: &str,
        reason: &str,
    ) -> Result<ApprovalReceipt> {
        let next = ApprovalState::rejected(approver, Utc::now(), reason);
        self.apply(key, collection_id, next).await
    }

    /// Restore the review fields `receipt` replaced. The returned receipt
    /// undoes the undo.
    pub async fn undo(&self, receipt: &ApprovalReceipt) -> Result<ApprovalReceipt> {
        self.apply(&receipt.key, &receipt.collection_id, receipt.prior.clone())
            .await
    }

    async fn apply(&self, key: &QueryKey, collection_id: &str, next: ApprovalState) -> Result<ApprovalReceipt> {
        let loaded = self.store().query(key).await?;
        let mut prior = loaded
            .data
            .collection(collection_id)
            .map(|record| record.approval())
            .ok_or_else(|| SyncError::RecordNotFound {
                key: key.clone(),
                id: collection_id.to_string(),
            })?;

        // Every cached collections query showing the record, the acting one first
        let mut targets = vec![key.clone()];
        targets.extend(
            self.store()
                .keys()
                .into_iter()
                .filter(|k| k.topic == Topic::COLLECTIONS && k != key),
        );

        let write = WriteRequest::update(Topic::COLLECTIONS, collection_id, next.to_patch());
        let call = self.backend.write(write);

        let mut captured = false;
        let applied = next.clone();
        self.engine
            .run(
                &targets,
                |target, current| {
                    let mut data = current?.clone();
                    let record = data.collection_mut(collection_id)?;
                    if !captured && target == key {
                        prior = record.approval();
                        captured = true;
                    }
                    record.set_approval(applied.clone());
                    Some(data)
                },
                call,
            )
            .await?;

        info!(
            collection = collection_id,
            from = %prior.status,
            to = %next.status,
            "Approval state changed"
        );
        Ok(ApprovalReceipt {
            key: key.clone(),
            collection_id: collection_id.to_string(),
            prior,
            applied: next,
            at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendFetcher, MemoryBackend};
    use crate::bus::ChangeBus;
    use crate::cache::{EntryStatus, Scope};
    use crate::config::CacheConfig;
    use crate::error::BackendError;
    use crate::models::{ApprovalStatus, Collection};
    use crate::subscription::SubscriptionManager;
    use serde_json::{json, Value};

    fn pending_row(id: &str, agent: &str) -> Value {
        json!({
            "id": id, "tenant_id": "t1", "agent_id": agent, "amount": 1200,
            "collected_on": "2026-03-01", "status": "pending",
            "approved_by": null, "approved_at": null, "rejection_reason": null
        })
    }

    struct Client {
        store: CacheStore<QueryData>,
        approvals: Approvals,
        subscriptions: SubscriptionManager,
    }

    fn client(backend: &MemoryBackend) -> Client {
        let shared = Arc::new(backend.clone());
        let store = CacheStore::new(
            Arc::new(BackendFetcher::new(shared.clone())),
            CacheConfig::default(),
            None,
        );
        let engine = MutationEngine::new(store.clone(), None);
        let subscriptions = SubscriptionManager::new(shared.clone(), store.clone(), ChangeBus::new());
        Client {
            approvals: Approvals::new(engine, shared),
            store,
            subscriptions,
        }
    }

    fn seeded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.seed(Topic::COLLECTIONS, vec![pending_row("c1", "a1"), pending_row("c2", "a2")]);
        backend
    }

    fn cached(store: &CacheStore<QueryData>, key: &QueryKey, id: &str) -> Collection {
        store
            .read(key)
            .and_then(|entry| entry.data.collection(id).cloned())
            .expect("collection cached")
    }

    fn server(backend: &MemoryBackend, id: &str) -> Collection {
        serde_json::from_value(backend.row(&Topic::COLLECTIONS, id).expect("row exists")).unwrap()
    }

    #[tokio::test]
    async fn test_approve_then_undo_restores_pending_exactly() {
        let backend = seeded();
        let c = client(&backend);
        let key = QueryKey::all(Topic::COLLECTIONS);

        let receipt = c.approvals.approve(&key, "c1", "m1").await.unwrap();
        assert_eq!(receipt.prior, ApprovalState::default());
        let approved = server(&backend, "c1");
        assert_eq!(approved.status, ApprovalStatus::Verified);
        assert_eq!(approved.approved_by.as_deref(), Some("m1"));
        assert!(approved.approved_at.is_some());

        c.approvals.undo(&receipt).await.unwrap();
        let restored = server(&backend, "c1");
        assert_eq!(restored.approval(), ApprovalState::default());
        assert_eq!(c.store.query(&key).await.unwrap().data.collection("c1").unwrap().approval(), ApprovalState::default());
    }

    #[tokio::test]
    async fn test_undo_restores_state_before_second_actor_reject() {
        let backend = seeded();
        let manager = client(&backend);
        let second = client(&backend);
        let key = QueryKey::all(Topic::COLLECTIONS);

        manager.approvals.approve(&key, "c1", "m1").await.unwrap();
        let verified = server(&backend, "c1").approval();

        let rejection = second
            .approvals
            .reject(&key, "c1", "m2", "duplicate")
            .await
            .unwrap();
        assert_eq!(rejection.prior, verified);
        let rejected = server(&backend, "c1");
        assert_eq!(rejected.status, ApprovalStatus::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("duplicate"));

        second.approvals.undo(&rejection).await.unwrap();
        assert_eq!(server(&backend, "c1").approval(), verified);
    }

    #[tokio::test]
    async fn test_failed_approve_rolls_back_every_view() {
        let backend = seeded();
        let c = client(&backend);
        let all = QueryKey::all(Topic::COLLECTIONS);
        let mine = QueryKey::scoped(Topic::COLLECTIONS, "agent_id", "a1");
        c.store.query(&mine).await.unwrap();
        c.store.query(&all).await.unwrap();
        let before_all = c.store.read(&all).unwrap();
        let before_mine = c.store.read(&mine).unwrap();

        backend.fail_next_write(BackendError::Transient("socket closed".into()));
        let result = c.approvals.approve(&all, "c1", "m1").await;

        assert!(matches!(result, Err(SyncError::Backend(BackendError::Transient(_)))));
        assert_eq!(c.store.read(&all).unwrap().data, before_all.data);
        assert_eq!(c.store.read(&all).unwrap().status, EntryStatus::Stale);
        assert_eq!(c.store.read(&mine).unwrap().data, before_mine.data);
        assert_eq!(c.store.read(&mine).unwrap().status, EntryStatus::Stale);
        assert_eq!(server(&backend, "c1").status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn test_approve_is_visible_before_write_confirms() {
        let backend = seeded();
        let c = client(&backend);
        let key = QueryKey::all(Topic::COLLECTIONS);
        c.store.query(&key).await.unwrap();
        let gate = backend.gate_writes();

        let approving = tokio::spawn({
            let approvals = c.approvals.clone();
            let key = key.clone();
            async move { approvals.approve(&key, "c1", "m1").await }
        });
        while c.store.read(&key).unwrap().status != EntryStatus::Pending {
            tokio::task::yield_now().await;
        }
        let speculative = cached(&c.store, &key, "c1");
        assert_eq!(speculative.status, ApprovalStatus::Verified);
        assert_eq!(speculative.approved_by.as_deref(), Some("m1"));
        assert_eq!(server(&backend, "c1").status, ApprovalStatus::Pending);

        gate.release(1);
        approving.await.unwrap().unwrap();
        assert_eq!(server(&backend, "c1").status, ApprovalStatus::Verified);
    }

    #[tokio::test]
    async fn test_unknown_record_is_reported() {
        let backend = seeded();
        let c = client(&backend);
        let result = c.approvals.approve(&QueryKey::all(Topic::COLLECTIONS), "nope", "m1").await;
        assert!(matches!(result, Err(SyncError::RecordNotFound { .. })));
        assert_eq!(backend.write_count(), 0);
    }

    #[tokio::test]
    async fn test_push_during_pending_mutation_converges_to_server() {
        let backend = seeded();
        let c = client(&backend);
        let key = QueryKey::all(Topic::COLLECTIONS);
        let _lease = c.subscriptions.ensure(Topic::COLLECTIONS, Scope::All).unwrap();
        let _observer = c.store.observe(&key, |_| {});
        c.store.query(&key).await.unwrap();
        let gate = backend.gate_writes();

        let approving = tokio::spawn({
            let approvals = c.approvals.clone();
            let key = key.clone();
            async move { approvals.approve(&key, "c1", "m1").await }
        });
        while c.store.read(&key).unwrap().status != EntryStatus::Pending {
            tokio::task::yield_now().await;
        }

        // Another actor changes the same record while ours is in flight
        backend
            .remote_write(WriteRequest::update(
                Topic::COLLECTIONS,
                "c1",
                ApprovalState::rejected("m2", Utc::now(), "duplicate").to_patch(),
            ))
            .unwrap();

        gate.release(1);
        approving.await.unwrap().unwrap();

        let authoritative = server(&backend, "c1");
        let settled = c.store.refetch(&key).await.unwrap();
        assert_eq!(settled.data.collection("c1").unwrap(), &authoritative);
        assert_eq!(settled.status, EntryStatus::Fresh);
    }
}
