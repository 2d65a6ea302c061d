//! Reference-counted push subscriptions per `(topic, scope)`.
//!
//! Each `ensure` call hands out a `Lease`; the backend subscription stays
//! open while at least one lease is alive and is closed exactly once when the
//! last one goes away. Inbound change events invalidate the matching cache
//! keys and are republished on the `ChangeBus`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::backend::{ChangeEvent, ChangeKind, PushBackend, PushEvent, PushSink, PushSubscription};
use crate::bus::{ChangeBus, SyncEvent};
use crate::cache::{CacheStore, QueryKey, Scope, Topic};
use crate::error::Result;
use crate::models::QueryData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Live,
    /// The channel reported a terminal error; cached data is kept but stale.
    Lost,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Live => write!(f, "live"),
            Health::Lost => write!(f, "lost"),
        }
    }
}

/// One row of `SubscriptionManager::active`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveSubscription {
    pub topic: Topic,
    pub scope: Scope,
    pub leases: usize,
    pub health: Health,
}

type Pair = (Topic, Scope);

struct TopicSubscription {
    leases: usize,
    /// Identifies the backend subscription the sink was created for.
    id: u64,
    handle: Option<Box<dyn PushSubscription>>,
    health: Health,
}

struct ManagerInner {
    backend: Arc<dyn PushBackend>,
    store: CacheStore<QueryData>,
    bus: ChangeBus,
    subscriptions: Mutex<HashMap<Pair, TopicSubscription>>,
    next_id: Mutex<u64>,
}

/// Clone is cheap and shares the same subscription table.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

/// Claim on a push subscription; released on `release()` or drop.
pub struct Lease {
    manager: Weak<ManagerInner>,
    topic: Topic,
    scope: Scope,
    released: bool,
}

impl Lease {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        if let Some(inner) = self.manager.upgrade() {
            inner.release(&self.topic, &self.scope);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("topic", &self.topic)
            .field("scope", &self.scope)
            .finish()
    }
}

impl ManagerInner {
    fn next_id(&self) -> u64 {
        let mut next = self.next_id.lock();
        *next += 1;
        *next
    }

    fn subscribe(self: &Arc<Self>, topic: &Topic, scope: &Scope, id: u64) -> Result<Box<dyn PushSubscription>> {
        let manager = Arc::downgrade(self);
        let (sink_topic, sink_scope) = (topic.clone(), scope.clone());
        let sink = PushSink::new(move |event| {
            if let Some(inner) = manager.upgrade() {
                inner.on_event(&sink_topic, &sink_scope, id, event);
            }
        });

        let handle = self.backend.subscribe(topic, scope, sink)?;
        info!(topic = %topic, scope = %scope, subscription = id, "Push subscription opened");
        Ok(handle)
    }

    /// Open the backend subscription reserved as `id` and attach its handle.
    /// Called without the table lock: the backend may deliver events, a
    /// terminal error included, before `subscribe` returns.
    fn attach(self: &Arc<Self>, topic: &Topic, scope: &Scope, id: u64) -> Result<()> {
        let opened = self.subscribe(topic, scope, id);
        let stray = {
            let mut subscriptions = self.subscriptions.lock();
            let current = subscriptions
                .get_mut(&(topic.clone(), scope.clone()))
                .filter(|s| s.id == id);
            match (opened, current) {
                (Ok(handle), Some(subscription)) if subscription.health == Health::Live => {
                    subscription.handle = Some(handle);
                    None
                }
                // Released or lost while opening
                (Ok(handle), _) => Some(handle),
                (Err(e), Some(subscription)) => {
                    subscription.health = Health::Lost;
                    return Err(e);
                }
                (Err(e), None) => return Err(e),
            }
        };

        if let Some(handle) = stray {
            handle.close();
            debug!(topic = %topic, scope = %scope, subscription = id, "Closed subscription superseded while opening");
        }
        Ok(())
    }

    fn release(&self, topic: &Topic, scope: &Scope) {
        let closing = {
            let mut subscriptions = self.subscriptions.lock();
            let pair = (topic.clone(), scope.clone());
            let Some(subscription) = subscriptions.get_mut(&pair) else {
                return;
            };
            subscription.leases = subscription.leases.saturating_sub(1);
            trace!(topic = %topic, scope = %scope, leases = subscription.leases, "Lease released");
            if subscription.leases > 0 {
                return;
            }
            subscriptions.remove(&pair)
        };

        if let Some(subscription) = closing {
            if let Some(handle) = subscription.handle {
                handle.close();
            }
            info!(topic = %topic, scope = %scope, subscription = subscription.id, "Push subscription closed");
        }
    }

    fn is_current(&self, topic: &Topic, scope: &Scope, id: u64) -> bool {
        let subscriptions = self.subscriptions.lock();
        subscriptions
            .get(&(topic.clone(), scope.clone()))
            .map_or(false, |s| s.id == id && s.health == Health::Live)
    }

    fn on_event(&self, topic: &Topic, scope: &Scope, id: u64, event: PushEvent) {
        if !self.is_current(topic, scope, id) {
            trace!(topic = %topic, scope = %scope, subscription = id, "Dropping event for closed subscription");
            return;
        }
        match event {
            PushEvent::Change(change) => self.on_change(topic, scope, change),
            PushEvent::Error(message) => self.on_lost(topic, scope, id, &message),
        }
    }

    fn on_change(&self, topic: &Topic, scope: &Scope, change: ChangeEvent) {
        // Updates and deletes may move a record out of a scope, so only
        // inserts can be narrowed by the record's own fields.
        let record = match change.kind {
            ChangeKind::Insert => Some(&change.record),
            ChangeKind::Update | ChangeKind::Delete => None,
        };
        let invalidated = self
            .store
            .invalidate(|key| key.topic == *topic && key.scope.affected_by(scope, record));
        debug!(topic = %topic, scope = %scope, kind = %change.kind, invalidated, "Remote change received");

        self.bus
            .publish_event(SyncEvent::now(topic.clone()).with_kind(change.kind));
    }

    fn on_lost(&self, topic: &Topic, scope: &Scope, id: u64, message: &str) {
        warn!(topic = %topic, scope = %scope, subscription = id, error = %message, "Push subscription lost, keeping cached data");

        let handle = {
            let mut subscriptions = self.subscriptions.lock();
            match subscriptions.get_mut(&(topic.clone(), scope.clone())) {
                Some(subscription) if subscription.id == id => {
                    subscription.health = Health::Lost;
                    subscription.handle.take()
                }
                _ => None,
            }
        };
        if let Some(handle) = handle {
            handle.close();
        }

        self.store
            .mark_stale(|key| key.topic == *topic && key.scope.affected_by(scope, None));
    }
}

impl SubscriptionManager {
    pub fn new(backend: Arc<dyn PushBackend>, store: CacheStore<QueryData>, bus: ChangeBus) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                backend,
                store,
                bus,
                subscriptions: Mutex::new(HashMap::new()),
                next_id: Mutex::new(0),
            }),
        }
    }

    /// Open or reuse the push subscription for `(topic, scope)`.
    ///
    /// A subscription previously reported lost is reopened.
    pub fn ensure(&self, topic: Topic, scope: Scope) -> Result<Lease> {
        let pair = (topic.clone(), scope.clone());
        let opening = {
            let mut subscriptions = self.inner.subscriptions.lock();
            match subscriptions.get_mut(&pair) {
                Some(subscription) if subscription.health == Health::Live => {
                    subscription.leases += 1;
                    trace!(topic = %topic, scope = %scope, leases = subscription.leases, "Reusing push subscription");
                    None
                }
                Some(subscription) => {
                    let id = self.inner.next_id();
                    debug!(topic = %topic, scope = %scope, subscription = id, "Reopening lost push subscription");
                    subscription.id = id;
                    subscription.health = Health::Live;
                    subscription.leases += 1;
                    Some(id)
                }
                None => {
                    let id = self.inner.next_id();
                    subscriptions.insert(
                        pair,
                        TopicSubscription {
                            leases: 1,
                            id,
                            handle: None,
                            health: Health::Live,
                        },
                    );
                    Some(id)
                }
            }
        };

        let lease = Lease {
            manager: Arc::downgrade(&self.inner),
            topic,
            scope,
            released: false,
        };
        if let Some(id) = opening {
            self.inner.attach(&lease.topic, &lease.scope, id)?;
        }
        Ok(lease)
    }

    /// Lease for the subscription that keeps `key` current.
    pub fn ensure_key(&self, key: &QueryKey) -> Result<Lease> {
        self.ensure(key.topic.clone(), key.scope.clone())
    }

    pub fn active(&self) -> Vec<ActiveSubscription> {
        let subscriptions = self.inner.subscriptions.lock();
        let mut active: Vec<ActiveSubscription> = subscriptions
            .iter()
            .map(|((topic, scope), s)| ActiveSubscription {
                topic: topic.clone(),
                scope: scope.clone(),
                leases: s.leases,
                health: s.health,
            })
            .collect();
        active.sort_by(|a, b| (&a.topic, &a.scope).cmp(&(&b.topic, &b.scope)));
        active
    }

    pub fn health(&self, topic: &Topic, scope: &Scope) -> Option<Health> {
        let subscriptions = self.inner.subscriptions.lock();
        subscriptions
            .get(&(topic.clone(), scope.clone()))
            .map(|s| s.health)
    }

    pub fn lease_count(&self, topic: &Topic, scope: &Scope) -> usize {
        let subscriptions = self.inner.subscriptions.lock();
        subscriptions
            .get(&(topic.clone(), scope.clone()))
            .map_or(0, |s| s.leases)
    }
}
