//! Topic-keyed change notifications.
//!
//! The `ChangeBus` fans a `SyncEvent` out to every callback registered for
//! its topic, plus the catch-all callbacks, in registration order. Callbacks
//! run synchronously inside `publish` and are expected to enqueue work
//! (schedule a refetch, flip a flag) rather than perform it inline.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, trace};

use crate::backend::ChangeKind;
use crate::cache::Topic;

/// One change notification for a topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncEvent {
    pub topic: Topic,
    pub at: DateTime<Utc>,
    pub kind: Option<ChangeKind>,
}

impl SyncEvent {
    pub fn now(topic: Topic) -> Self {
        Self {
            topic,
            at: Utc::now(),
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: ChangeKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

pub type Callback = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Outcome of a single `publish`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Topic(Topic),
    Any,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    topics: HashMap<Topic, Vec<(u64, Callback)>>,
    any: Vec<(u64, Callback)>,
}

struct BusInner {
    registry: Mutex<Registry>,
}

impl BusInner {
    fn unregister(&self, target: &Target, id: u64) -> bool {
        let mut registry = self.registry.lock();
        let list = match target {
            Target::Topic(topic) => match registry.topics.get_mut(topic) {
                Some(list) => list,
                None => return false,
            },
            Target::Any => &mut registry.any,
        };
        let before = list.len();
        list.retain(|(callback_id, _)| *callback_id != id);
        let removed = list.len() != before;

        if let Target::Topic(topic) = target {
            if registry.topics.get(topic).map_or(false, Vec::is_empty) {
                registry.topics.remove(topic);
            }
        }
        removed
    }
}

/// Handle returned by `register`; unregisters on `unregister()` or drop.
pub struct Registration {
    bus: Weak<BusInner>,
    target: Target,
    id: u64,
}

impl Registration {
    pub fn unregister(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            if bus.unregister(&self.target, self.id) {
                trace!(callback = self.id, "Bus callback unregistered");
            }
        }
        self.bus = Weak::new();
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("target", &self.target)
            .field("id", &self.id)
            .finish()
    }
}

/// Registry of observer callbacks per topic. Clone shares the same registry.
#[derive(Clone)]
pub struct ChangeBus {
    inner: Arc<BusInner>,
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Invoke `callback` on every publish for `topic`.
    pub fn register<F>(&self, topic: Topic, callback: F) -> Registration
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.add(Target::Topic(topic), Arc::new(callback))
    }

    /// Invoke `callback` on every publish, whatever the topic.
    pub fn register_all<F>(&self, callback: F) -> Registration
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.add(Target::Any, Arc::new(callback))
    }

    fn add(&self, target: Target, callback: Callback) -> Registration {
        let mut registry = self.inner.registry.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        match &target {
            Target::Topic(topic) => registry
                .topics
                .entry(topic.clone())
                .or_default()
                .push((id, callback)),
            Target::Any => registry.any.push((id, callback)),
        }
        trace!(callback = id, target = ?target, "Bus callback registered");
        Registration {
            bus: Arc::downgrade(&self.inner),
            target,
            id,
        }
    }

    pub fn publish(&self, topic: Topic) -> PublishReport {
        self.publish_event(SyncEvent::now(topic))
    }

    /// Deliver `event` to the callbacks registered at the time of the call.
    pub fn publish_event(&self, event: SyncEvent) -> PublishReport {
        let mut callbacks: Vec<(u64, Callback)> = {
            let registry = self.inner.registry.lock();
            registry
                .topics
                .get(&event.topic)
                .into_iter()
                .flatten()
                .chain(registry.any.iter())
                .map(|(id, callback)| (*id, Arc::clone(callback)))
                .collect()
        };
        callbacks.sort_by_key(|(id, _)| *id);

        let mut report = PublishReport::default();
        for (id, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                Ok(()) => report.delivered += 1,
                Err(_) => {
                    report.failed += 1;
                    error!(topic = %event.topic, callback = id, "Bus callback panicked");
                }
            }
        }
        trace!(
            topic = %event.topic,
            delivered = report.delivered,
            failed = report.failed,
            "Published change"
        );
        report
    }

    pub fn callback_count(&self, topic: &Topic) -> usize {
        let registry = self.inner.registry.lock();
        registry.topics.get(topic).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&SyncEvent) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move |_: &SyncEvent| {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_each_registered_callback_runs_once_per_publish() {
        let bus = ChangeBus::new();
        let (a, cb_a) = counter();
        let (b, cb_b) = counter();
        let _ra = bus.register(Topic::TENANTS, cb_a);
        let _rb = bus.register(Topic::TENANTS, cb_b);

        let report = bus.publish(Topic::TENANTS);
        assert_eq!(report, PublishReport { delivered: 2, failed: 0 });
        bus.publish(Topic::TENANTS);

        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_delivery_follows_registration_order() {
        let bus = ChangeBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        let _r1 = bus.register(Topic::COLLECTIONS, move |_| o1.lock().push("first"));
        let o2 = Arc::clone(&order);
        let _r2 = bus.register_all(move |_| o2.lock().push("any"));
        let o3 = Arc::clone(&order);
        let _r3 = bus.register(Topic::COLLECTIONS, move |_| o3.lock().push("third"));

        bus.publish(Topic::COLLECTIONS);
        assert_eq!(*order.lock(), vec!["first", "any", "third"]);
    }

    #[test]
    fn test_topics_are_isolated() {
        let bus = ChangeBus::new();
        let (tenants, cb) = counter();
        let _r = bus.register(Topic::TENANTS, cb);

        let report = bus.publish(Topic::PROFILES);
        assert_eq!(report.delivered, 0);
        assert_eq!(tenants.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_callback_does_not_stop_others() {
        let bus = ChangeBus::new();
        let _bad = bus.register(Topic::TENANTS, |_| panic!("render failed"));
        let (good, cb) = counter();
        let _good = bus.register(Topic::TENANTS, cb);

        let report = bus.publish(Topic::TENANTS);
        assert_eq!(report, PublishReport { delivered: 1, failed: 1 });
        assert_eq!(good.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_and_drop_remove_callbacks() {
        let bus = ChangeBus::new();
        let (count, cb) = counter();
        let registration = bus.register(Topic::TENANTS, cb);
        let (other, cb2) = counter();
        let dropped = bus.register(Topic::TENANTS, cb2);
        assert_eq!(bus.callback_count(&Topic::TENANTS), 2);

        registration.unregister();
        drop(dropped);
        bus.publish(Topic::TENANTS);

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(other.load(Ordering::SeqCst), 0);
        assert_eq!(bus.callback_count(&Topic::TENANTS), 0);
    }

    #[test]
    fn test_callback_registered_during_publish_waits_for_next_one() {
        let bus = ChangeBus::new();
        let (late, late_cb) = counter();
        let late_cb = Arc::new(late_cb);
        let held = Arc::new(Mutex::new(Vec::new()));

        let registering_bus = bus.clone();
        let holder = Arc::clone(&held);
        let _r = bus.register(Topic::TENANTS, move |_| {
            let cb = Arc::clone(&late_cb);
            let registration = registering_bus.register(Topic::TENANTS, move |e| cb(e));
            holder.lock().push(registration);
        });

        bus.publish(Topic::TENANTS);
        assert_eq!(late.load(Ordering::SeqCst), 0);

        bus.publish(Topic::TENANTS);
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_carries_kind() {
        let event = SyncEvent::now(Topic::TENANTS).with_kind(ChangeKind::Update);
        assert_eq!(event.kind, Some(ChangeKind::Update));
        assert_eq!(event.topic, Topic::TENANTS);
    }
}
