//! Process-wide keyed store of query results.
//!
//! Every entry lives in a slot that also tracks the key's observers, its
//! in-flight fetch, and an invalidation counter. All slot state sits behind a
//! single short-lived lock; observers are always invoked after it is released.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::config::CacheConfig;
use crate::deadline::guarded;
use crate::error::{BackendError, Result, SyncError};

use super::{CacheEntry, EntryStatus, QueryKey};

/// Source of truth for cache misses and refetches.
pub trait Fetcher<V>: Send + Sync {
    fn fetch(&self, key: &QueryKey) -> BoxFuture<'static, Result<V, BackendError>>;
}

pub type Observer = Arc<dyn Fn(&QueryKey) + Send + Sync>;

type SharedFetch<V> = Shared<BoxFuture<'static, Result<Arc<CacheEntry<V>>>>>;

struct InFlight<V> {
    id: u64,
    shared: SharedFetch<V>,
    /// Invalidation count observed when the request went out.
    started_at: Option<u64>,
}

struct Slot<V> {
    entry: Option<Arc<CacheEntry<V>>>,
    /// Version of `entry`; unique across the whole store.
    version: u64,
    /// Version of the last write that replaced the data. Stale-marking
    /// leaves it alone, so speculative stamps survive invalidation.
    data_version: u64,
    invalidations: u64,
    last_access: Instant,
    observers: Vec<(u64, Observer)>,
    fetch: Option<InFlight<V>>,
}

impl<V> Slot<V> {
    fn new() -> Self {
        Self {
            entry: None,
            version: 0,
            data_version: 0,
            invalidations: 0,
            last_access: Instant::now(),
            observers: Vec::new(),
            fetch: None,
        }
    }

    fn observer_fns(&self) -> Vec<Observer> {
        self.observers.iter().map(|(_, f)| Arc::clone(f)).collect()
    }

    fn is_evictable(&self) -> bool {
        self.observers.is_empty()
            && self.fetch.is_none()
            && self
                .entry
                .as_ref()
                .map_or(true, |e| e.status != EntryStatus::Pending)
    }
}

struct StoreState<V> {
    slots: HashMap<QueryKey, Slot<V>>,
    next_version: u64,
    next_id: u64,
}

impl<V> StoreState<V> {
    fn bump_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    fn bump_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct StoreInner<V> {
    state: Mutex<StoreState<V>>,
    fetcher: Arc<dyn Fetcher<V>>,
    config: CacheConfig,
    fetch_timeout: Option<Duration>,
    shutdown: CancellationToken,
}

/// Result of an atomic snapshot-and-speculate step on one key.
#[derive(Debug, Clone)]
pub struct SpeculativeWrite<V> {
    pub key: QueryKey,
    /// Entry as it was before the speculative write, `None` if absent.
    pub snapshot: Option<Arc<CacheEntry<V>>>,
    /// Version written by the speculation, `None` when the update declined.
    pub stamp: Option<u64>,
}

/// Keyed cache of query results with per-key observers and deduplicated fetches.
/// Clone is cheap and shares the same store.
pub struct CacheStore<V> {
    inner: Arc<StoreInner<V>>,
}

impl<V> Clone for CacheStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Registration of a per-key observer. Dropping it unregisters.
pub struct ObserverHandle<V> {
    store: Weak<StoreInner<V>>,
    key: QueryKey,
    id: u64,
}

impl<V> ObserverHandle<V> {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl<V> Drop for ObserverHandle<V> {
    fn drop(&mut self) {
        if let Some(inner) = self.store.upgrade() {
            inner.remove_observer(&self.key, self.id);
            trace!(key = %self.key, observer = self.id, "Cache observer unregistered");
        }
    }
}

impl<V> StoreInner<V> {
    fn remove_observer(&self, key: &QueryKey, id: u64) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(key) {
            slot.observers.retain(|(observer_id, _)| *observer_id != id);
        }
    }
}

fn notify(key: &QueryKey, observers: Vec<Observer>) {
    for observer in observers {
        if catch_unwind(AssertUnwindSafe(|| observer(key))).is_err() {
            error!(key = %key, "Cache observer panicked");
        }
    }
}

impl<V> StoreInner<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Join the key's in-flight fetch or start one. Caller holds the lock.
    fn start_fetch_locked(self: &Arc<Self>, state: &mut StoreState<V>, key: &QueryKey) -> SharedFetch<V> {
        if self.shutdown.is_cancelled() {
            return future::ready(Err(SyncError::ShutDown)).boxed().shared();
        }

        let id = state.bump_id();
        let slot = state.slots.entry(key.clone()).or_insert_with(Slot::new);
        if let Some(in_flight) = &slot.fetch {
            trace!(key = %key, "Joining in-flight fetch");
            return in_flight.shared.clone();
        }

        debug!(key = %key, fetch = id, "Starting fetch");
        let handle = tokio::spawn(Self::run_fetch(Arc::clone(self), key.clone(), id));
        let shared = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(SyncError::Task(e.to_string())),
            }
        }
        .boxed()
        .shared();

        slot.fetch = Some(InFlight {
            id,
            shared: shared.clone(),
            started_at: None,
        });
        shared
    }

    fn run_fetch(self: Arc<Self>, key: QueryKey, id: u64) -> BoxFuture<'static, Result<Arc<CacheEntry<V>>>> {
        async move {
            let request = {
                let mut state = self.state.lock();
                let Some(slot) = state.slots.get_mut(&key) else {
                    return Err(SyncError::MissingEntry(key));
                };
                if let Some(in_flight) = slot.fetch.as_mut() {
                    if in_flight.id == id {
                        in_flight.started_at = Some(slot.invalidations);
                    }
                }
                self.fetcher.fetch(&key)
            };

            let outcome = match guarded(request, self.fetch_timeout, &self.shutdown).await {
                Err(SyncError::Cancelled) => Err(SyncError::ShutDown),
                other => other,
            };
            self.settle_fetch(&key, id, outcome)
        }
        .boxed()
    }

    fn settle_fetch(
        self: &Arc<Self>,
        key: &QueryKey,
        id: u64,
        outcome: Result<V>,
    ) -> Result<Arc<CacheEntry<V>>> {
        let (result, observers) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let version = state.bump_version();
            let Some(slot) = state.slots.get_mut(key) else {
                return Err(SyncError::MissingEntry(key.clone()));
            };

            let started_at = match slot.fetch.take() {
                Some(in_flight) if in_flight.id == id => in_flight.started_at,
                other => {
                    slot.fetch = other;
                    None
                }
            };
            let invalidated = started_at.map_or(false, |seen| slot.invalidations > seen);

            let result = match outcome {
                Ok(data) => {
                    // An invalidation that raced the request leaves the result stale
                    let status = if invalidated {
                        EntryStatus::Stale
                    } else {
                        EntryStatus::Fresh
                    };
                    let entry = Arc::new(CacheEntry {
                        key: key.clone(),
                        data,
                        status,
                        updated_at: Utc::now(),
                        version,
                        error: None,
                    });
                    slot.version = version;
                    slot.data_version = version;
                    slot.entry = Some(Arc::clone(&entry));
                    debug!(key = %key, version, status = %status, "Fetch settled");
                    Ok(entry)
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Fetch failed, keeping last known data");
                    if let Some(current) = slot.entry.as_ref() {
                        slot.entry = Some(Arc::new(CacheEntry {
                            status: EntryStatus::Error,
                            error: Some(e.to_string()),
                            ..(**current).clone()
                        }));
                    }
                    Err(e)
                }
            };

            let follow_up = invalidated && !slot.observers.is_empty();
            let observers = slot.observer_fns();
            if follow_up {
                debug!(key = %key, "Invalidated during fetch, queueing follow-up");
                drop(self.start_fetch_locked(state, key));
            }
            (result, observers)
        };

        notify(key, observers);
        result
    }
}

impl<V> CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(fetcher: Arc<dyn Fetcher<V>>, config: CacheConfig, fetch_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState {
                    slots: HashMap::new(),
                    next_version: 0,
                    next_id: 0,
                }),
                fetcher,
                config,
                fetch_timeout,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Last-known entry for `key`, whatever its status.
    pub fn read(&self, key: &QueryKey) -> Option<Arc<CacheEntry<V>>> {
        let mut state = self.inner.state.lock();
        let slot = state.slots.get_mut(key)?;
        slot.last_access = Instant::now();
        slot.entry.clone()
    }

    /// Replace the entry for `key` and notify its observers. Returns the new version.
    pub fn write(&self, key: &QueryKey, data: V, status: EntryStatus) -> u64 {
        let (version, observers) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let version = state.bump_version();
            let created = !state.slots.contains_key(key);
            let slot = state.slots.entry(key.clone()).or_insert_with(Slot::new);
            slot.version = version;
            slot.data_version = version;
            slot.last_access = Instant::now();
            slot.entry = Some(Arc::new(CacheEntry {
                key: key.clone(),
                data,
                status,
                updated_at: Utc::now(),
                version,
                error: None,
            }));
            let observers = slot.observer_fns();
            if created {
                self.evict_locked(state, Some(key));
            }
            (version, observers)
        };
        trace!(key = %key, version, status = %status, "Cache write");
        notify(key, observers);
        version
    }

    /// Cached entry if fresh, otherwise fetch (joining any in-flight fetch).
    pub async fn query(&self, key: &QueryKey) -> Result<Arc<CacheEntry<V>>> {
        let pending = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if let Some(slot) = state.slots.get_mut(key) {
                slot.last_access = Instant::now();
                if let Some(entry) = slot.entry.as_ref() {
                    if entry.is_fresh() && !self.is_expired(entry) && slot.fetch.is_none() {
                        return Ok(Arc::clone(entry));
                    }
                }
            }
            self.inner.start_fetch_locked(state, key)
        };
        pending.await
    }

    /// Fetch regardless of freshness, deduplicated with any in-flight fetch.
    pub async fn refetch(&self, key: &QueryKey) -> Result<Arc<CacheEntry<V>>> {
        let pending = {
            let mut state = self.inner.state.lock();
            self.inner.start_fetch_locked(&mut state, key)
        };
        pending.await
    }

    /// Start a refetch in the background unless one is already running.
    pub fn spawn_refetch(&self, key: &QueryKey) {
        let mut state = self.inner.state.lock();
        drop(self.inner.start_fetch_locked(&mut state, key));
    }

    /// Mark matching entries stale and refetch the observed ones.
    /// Returns the number of keys matched.
    ///
    /// Marking moves the entry's version but not its data version, so a
    /// pending mutation can still settle the key.
    pub fn invalidate<P>(&self, predicate: P) -> usize
    where
        P: Fn(&QueryKey) -> bool,
    {
        self.mark(predicate, true)
    }

    /// Mark matching entries stale without triggering any fetch.
    pub fn mark_stale<P>(&self, predicate: P) -> usize
    where
        P: Fn(&QueryKey) -> bool,
    {
        self.mark(predicate, false)
    }

    fn mark<P>(&self, predicate: P, refetch: bool) -> usize
    where
        P: Fn(&QueryKey) -> bool,
    {
        let mut notifications = Vec::new();
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let keys: Vec<QueryKey> = state.slots.keys().filter(|k| predicate(k)).cloned().collect();

            for key in &keys {
                let version = state.bump_version();
                let Some(slot) = state.slots.get_mut(key) else {
                    continue;
                };
                if refetch {
                    slot.invalidations += 1;
                }
                slot.version = version;
                if let Some(current) = slot.entry.as_ref() {
                    slot.entry = Some(Arc::new(CacheEntry {
                        status: EntryStatus::Stale,
                        version,
                        ..(**current).clone()
                    }));
                }
                notifications.push((key.clone(), slot.observer_fns()));

                let should_fetch = refetch && !slot.observers.is_empty() && slot.fetch.is_none();
                if should_fetch {
                    drop(self.inner.start_fetch_locked(state, key));
                }
            }
            debug!(matched = keys.len(), refetch, "Cache entries marked stale");
        }

        let matched = notifications.len();
        for (key, observers) in notifications {
            notify(&key, observers);
        }
        matched
    }

    /// Atomically snapshot `key` and apply `update` to its current data.
    ///
    /// `update` runs under the store lock and must not call back into the store.
    /// Returning `None` leaves the entry untouched.
    pub fn speculate<F>(&self, key: &QueryKey, update: F) -> SpeculativeWrite<V>
    where
        F: FnOnce(Option<&V>) -> Option<V>,
    {
        let (write, observers) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let version = state.bump_version();
            let slot = state.slots.entry(key.clone()).or_insert_with(Slot::new);
            let snapshot = slot.entry.clone();

            match update(snapshot.as_ref().map(|e| &e.data)) {
                Some(data) => {
                    slot.version = version;
                    slot.data_version = version;
                    slot.last_access = Instant::now();
                    slot.entry = Some(Arc::new(CacheEntry {
                        key: key.clone(),
                        data,
                        status: EntryStatus::Pending,
                        updated_at: Utc::now(),
                        version,
                        error: None,
                    }));
                    let write = SpeculativeWrite {
                        key: key.clone(),
                        snapshot,
                        stamp: Some(version),
                    };
                    (write, slot.observer_fns())
                }
                None => {
                    let write = SpeculativeWrite {
                        key: key.clone(),
                        snapshot,
                        stamp: None,
                    };
                    (write, Vec::new())
                }
            }
        };
        notify(key, observers);
        write
    }

    /// Put `snapshot` back if no write replaced the data since `stamp`.
    /// Returns whether it applied.
    pub fn restore(&self, key: &QueryKey, snapshot: Option<Arc<CacheEntry<V>>>, stamp: u64) -> bool {
        let observers = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let version = state.bump_version();
            let Some(slot) = state.slots.get_mut(key) else {
                return false;
            };
            if slot.data_version != stamp {
                return false;
            }
            slot.version = version;
            slot.data_version = version;
            slot.entry = snapshot.map(|prior| {
                Arc::new(CacheEntry {
                    version,
                    ..(*prior).clone()
                })
            });
            slot.observer_fns()
        };
        notify(key, observers);
        true
    }

    /// Mark the entry fresh if no write replaced the data since `stamp`.
    pub fn mark_fresh(&self, key: &QueryKey, stamp: u64) -> bool {
        let observers = {
            let mut state = self.inner.state.lock();
            let Some(slot) = state.slots.get_mut(key) else {
                return false;
            };
            if slot.data_version != stamp {
                return false;
            }
            let Some(current) = slot.entry.as_ref() else {
                return false;
            };
            slot.entry = Some(Arc::new(CacheEntry {
                status: EntryStatus::Fresh,
                updated_at: Utc::now(),
                ..(**current).clone()
            }));
            slot.observer_fns()
        };
        notify(key, observers);
        true
    }

    /// Register `observer` to run after every write to `key`.
    pub fn observe<F>(&self, key: &QueryKey, observer: F) -> ObserverHandle<V>
    where
        F: Fn(&QueryKey) + Send + Sync + 'static,
    {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let id = state.bump_id();
        let slot = state.slots.entry(key.clone()).or_insert_with(Slot::new);
        slot.observers.push((id, Arc::new(observer)));
        trace!(key = %key, observer = id, "Cache observer registered");
        ObserverHandle {
            store: Arc::downgrade(&self.inner),
            key: key.clone(),
            id,
        }
    }

    pub fn observer_count(&self, key: &QueryKey) -> usize {
        let state = self.inner.state.lock();
        state.slots.get(key).map_or(0, |slot| slot.observers.len())
    }

    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        let state = self.inner.state.lock();
        state.slots.get(key).map_or(false, |slot| slot.fetch.is_some())
    }

    pub fn version(&self, key: &QueryKey) -> Option<u64> {
        let state = self.inner.state.lock();
        state.slots.get(key).map(|slot| slot.version)
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        let state = self.inner.state.lock();
        state.slots.keys().cloned().collect()
    }

    /// Number of keys holding data.
    pub fn len(&self) -> usize {
        let state = self.inner.state.lock();
        state.slots.values().filter(|slot| slot.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop idle and over-capacity entries. Returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        let mut state = self.inner.state.lock();
        self.evict_locked(&mut state, None)
    }

    fn evict_locked(&self, state: &mut StoreState<V>, keep: Option<&QueryKey>) -> usize {
        let before = state.slots.len();

        if let Some(ttl) = self.inner.config.idle_ttl() {
            state
                .slots
                .retain(|key, slot| {
                    Some(key) == keep || !(slot.is_evictable() && slot.last_access.elapsed() > ttl)
                });
        }

        if let Some(max) = self.inner.config.max_entries() {
            while state.slots.len() > max {
                let oldest = state
                    .slots
                    .iter()
                    .filter(|(key, slot)| Some(*key) != keep && slot.is_evictable())
                    .min_by_key(|(_, slot)| slot.last_access)
                    .map(|(key, _)| key.clone());
                match oldest {
                    Some(key) => {
                        state.slots.remove(&key);
                    }
                    None => break,
                }
            }
        }

        let evicted = before - state.slots.len();
        if evicted > 0 {
            debug!(evicted, remaining = state.slots.len(), "Evicted cache entries");
        }
        evicted
    }

    fn is_expired(&self, entry: &CacheEntry<V>) -> bool {
        match self.inner.config.stale_after() {
            Some(limit) => match chrono::Duration::from_std(limit) {
                Ok(limit) => Utc::now() - entry.updated_at > limit,
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Cancel background fetches and refuse new ones.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}
