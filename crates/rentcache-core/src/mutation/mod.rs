//! Optimistic mutations over the cache store.
//!
//! A mutation writes its speculative values into the store (status
//! `pending`), awaits the network call, then either commits (mark fresh) or
//! restores the exact snapshot it took. Commit and rollback only touch a key
//! whose data still carries the stamp the speculative write produced; if a
//! fetch or another write replaced it in between, that later value stands.
//! Either way the targets are invalidated afterwards so they converge on
//! what the server holds.
//!
//! Settlement runs in its own task, so a caller that stops awaiting `run`
//! never leaves keys stuck in `pending`.

pub mod approval;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, QueryKey, SpeculativeWrite};
use crate::deadline::guarded;
use crate::error::{BackendError, Result, SyncError};

pub use approval::{ApprovalReceipt, Approvals};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Pending,
    Committed,
    RolledBack,
}

impl fmt::Display for MutationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationOutcome::Pending => write!(f, "pending"),
            MutationOutcome::Committed => write!(f, "committed"),
            MutationOutcome::RolledBack => write!(f, "rolled-back"),
        }
    }
}

/// Speculative writes of one `run`, owned until settlement.
struct MutationRecord<V> {
    id: u64,
    writes: Vec<SpeculativeWrite<V>>,
    outcome: MutationOutcome,
}

impl<V> MutationRecord<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn commit(&mut self, store: &CacheStore<V>) {
        for write in &self.writes {
            let Some(stamp) = write.stamp else {
                continue;
            };
            if !store.mark_fresh(&write.key, stamp) {
                debug!(mutation = self.id, key = %write.key, "Key rewritten before commit, keeping newer value");
            }
        }
        self.reconcile(store, self.writes.iter().map(|w| &w.key));
        for write in &self.writes {
            store.spawn_refetch(&write.key);
        }
        self.outcome = MutationOutcome::Committed;
    }

    fn roll_back(&mut self, store: &CacheStore<V>, error: &SyncError) {
        for write in &self.writes {
            let Some(stamp) = write.stamp else {
                continue;
            };
            if !store.restore(&write.key, write.snapshot.clone(), stamp) {
                warn!(mutation = self.id, key = %write.key, error = %error, "Rollback skipped, key was rewritten");
            }
        }
        // The server may have applied the write before failing
        self.reconcile(store, self.writes.iter().map(|w| &w.key));
        self.outcome = MutationOutcome::RolledBack;
    }

    fn reconcile<'a>(&self, store: &CacheStore<V>, keys: impl Iterator<Item = &'a QueryKey>) {
        let keys: Vec<&QueryKey> = keys.collect();
        if keys.is_empty() {
            return;
        }
        store.invalidate(|key| keys.contains(&key));
    }
}

/// Runs optimistic mutations against one store.
pub struct MutationEngine<V> {
    store: CacheStore<V>,
    timeout: Option<Duration>,
    next_id: Arc<AtomicU64>,
}

impl<V> Clone for MutationEngine<V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            timeout: self.timeout,
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<V> MutationEngine<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(store: CacheStore<V>, timeout: Option<Duration>) -> Self {
        Self {
            store,
            timeout,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn store(&self) -> &CacheStore<V> {
        &self.store
    }

    /// Apply `speculate` to every target, await `call`, then commit or roll back.
    ///
    /// `speculate` runs under the store lock and must not touch the store;
    /// returning `None` leaves that key out of the mutation.
    pub async fn run<T, S, N>(&self, targets: &[QueryKey], speculate: S, call: N) -> Result<T>
    where
        S: FnMut(&QueryKey, Option<&V>) -> Option<V>,
        N: Future<Output = Result<T, BackendError>> + Send + 'static,
        T: Send + 'static,
    {
        self.run_with_cancel(targets, speculate, call, CancellationToken::new())
            .await
    }

    /// Like `run`; cancelling `cancel` before the call completes rolls back.
    pub async fn run_with_cancel<T, S, N>(
        &self,
        targets: &[QueryKey],
        mut speculate: S,
        call: N,
        cancel: CancellationToken,
    ) -> Result<T>
    where
        S: FnMut(&QueryKey, Option<&V>) -> Option<V>,
        N: Future<Output = Result<T, BackendError>> + Send + 'static,
        T: Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let writes: Vec<SpeculativeWrite<V>> = targets
            .iter()
            .map(|key| self.store.speculate(key, |current| speculate(key, current)))
            .collect();
        let applied = writes.iter().filter(|w| w.stamp.is_some()).count();
        debug!(mutation = id, targets = targets.len(), applied, "Speculative writes applied");

        let mut record = MutationRecord {
            id,
            writes,
            outcome: MutationOutcome::Pending,
        };
        let store = self.store.clone();
        let timeout = self.timeout;

        let settlement = tokio::spawn(async move {
            let result = guarded(call, timeout, &cancel).await;
            match &result {
                Ok(_) => record.commit(&store),
                Err(e) => record.roll_back(&store, e),
            }
            info!(mutation = record.id, outcome = %record.outcome, "Mutation settled");
            result
        });

        match settlement.await {
            Ok(result) => result,
            Err(e) => Err(SyncError::Task(e.to_string())),
        }
    }
}
