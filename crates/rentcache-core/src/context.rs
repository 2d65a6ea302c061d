//! The sync layer as one object.
//!
//! `SyncContext` builds and owns the store, bus, subscription manager,
//! mutation engine and status indicator for one backend. Components receive
//! their collaborators at construction; nothing is global, so every test can
//! stand up an isolated context.

use std::sync::Arc;

use tracing::info;

use crate::backend::{Backend, BackendFetcher, PushBackend};
use crate::bus::ChangeBus;
use crate::cache::CacheStore;
use crate::config::SyncConfig;
use crate::models::QueryData;
use crate::mutation::{Approvals, MutationEngine};
use crate::status::SyncStatus;
use crate::subscription::SubscriptionManager;

pub struct SyncContext {
    config: SyncConfig,
    store: CacheStore<QueryData>,
    bus: ChangeBus,
    subscriptions: SubscriptionManager,
    engine: MutationEngine<QueryData>,
    approvals: Approvals,
    status: SyncStatus,
}

impl SyncContext {
    pub fn new<B>(config: SyncConfig, backend: Arc<B>) -> Self
    where
        B: Backend + PushBackend + 'static,
    {
        let store = CacheStore::new(
            Arc::new(BackendFetcher::new(Arc::clone(&backend))),
            config.cache.clone(),
            config.fetch_timeout(),
        );
        let bus = ChangeBus::new();
        let subscriptions = SubscriptionManager::new(backend.clone(), store.clone(), bus.clone());
        let engine = MutationEngine::new(store.clone(), config.mutation_timeout());
        let approvals = Approvals::new(engine.clone(), backend);
        let status = SyncStatus::new(&bus);

        info!(
            fetch_timeout = ?config.fetch_timeout(),
            mutation_timeout = ?config.mutation_timeout(),
            max_entries = ?config.cache.max_entries(),
            "Sync context ready"
        );
        Self {
            config,
            store,
            bus,
            subscriptions,
            engine,
            approvals,
            status,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &CacheStore<QueryData> {
        &self.store
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn engine(&self) -> &MutationEngine<QueryData> {
        &self.engine
    }

    pub fn approvals(&self) -> &Approvals {
        &self.approvals
    }

    pub fn status(&self) -> &SyncStatus {
        &self.status
    }

    /// Stop background fetches. Mutations already in flight still settle.
    pub fn shutdown(&self) {
        self.store.shutdown();
        info!("Sync context shut down");
    }
}
