//! "Last synced" timestamps derived from change bus traffic.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::bus::{ChangeBus, Registration};
use crate::cache::{age_display, Topic};

#[derive(Default)]
struct Seen {
    topics: HashMap<Topic, DateTime<Utc>>,
    latest: Option<DateTime<Utc>>,
}

/// Records when each topic last changed. Never touches the cache or the
/// subscriptions; dropping it unregisters from the bus.
pub struct SyncStatus {
    seen: Arc<Mutex<Seen>>,
    _registration: Registration,
}

impl SyncStatus {
    pub fn new(bus: &ChangeBus) -> Self {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let recorder = Arc::clone(&seen);
        let registration = bus.register_all(move |event| {
            let mut seen = recorder.lock();
            let entry = seen.topics.entry(event.topic.clone()).or_insert(event.at);
            *entry = (*entry).max(event.at);
            seen.latest = Some(seen.latest.map_or(event.at, |t| t.max(event.at)));
        });
        Self {
            seen,
            _registration: registration,
        }
    }

    /// Most recent event for `topic`, or across all topics when `None`.
    pub fn last_sync_time(&self, topic: Option<&Topic>) -> Option<DateTime<Utc>> {
        let seen = self.seen.lock();
        match topic {
            Some(topic) => seen.topics.get(topic).copied(),
            None => seen.latest,
        }
    }

    /// Human-friendly age of the last sync, e.g. "5m ago".
    pub fn age_display(&self, topic: Option<&Topic>) -> String {
        match self.last_sync_time(topic) {
            Some(at) => age_display(at),
            None => "never".to_string(),
        }
    }

    pub fn topics(&self) -> Vec<(Topic, DateTime<Utc>)> {
        let seen = self.seen.lock();
        let mut topics: Vec<_> = seen.topics.iter().map(|(t, at)| (t.clone(), *at)).collect();
        topics.sort_by(|a, b| a.0.cmp(&b.0));
        topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SyncEvent;
    use chrono::Duration;

    #[test]
    fn test_records_per_topic_and_overall() {
        let bus = ChangeBus::new();
        let status = SyncStatus::new(&bus);
        assert!(status.last_sync_time(None).is_none());
        assert_eq!(status.age_display(Some(&Topic::TENANTS)), "never");

        let earlier = Utc::now() - Duration::hours(2);
        bus.publish_event(SyncEvent {
            topic: Topic::TENANTS,
            at: earlier,
            kind: None,
        });
        bus.publish(Topic::COLLECTIONS);

        assert_eq!(status.last_sync_time(Some(&Topic::TENANTS)), Some(earlier));
        assert_eq!(status.age_display(Some(&Topic::TENANTS)), "2h ago");
        assert_eq!(status.age_display(Some(&Topic::COLLECTIONS)), "just now");
        assert!(status.last_sync_time(None).unwrap() > earlier);
        assert!(status.last_sync_time(Some(&Topic::PROFILES)).is_none());
        assert_eq!(status.topics().len(), 2);
    }

    #[test]
    fn test_out_of_order_events_keep_latest() {
        let bus = ChangeBus::new();
        let status = SyncStatus::new(&bus);
        let now = Utc::now();
        for at in [now, now - Duration::minutes(10)] {
            bus.publish_event(SyncEvent {
                topic: Topic::TENANTS,
                at,
                kind: None,
            });
        }
        assert_eq!(status.last_sync_time(Some(&Topic::TENANTS)), Some(now));
    }

    #[test]
    fn test_drop_unregisters() {
        let bus = ChangeBus::new();
        let status = SyncStatus::new(&bus);
        drop(status);
        assert_eq!(bus.publish(Topic::TENANTS).delivered, 0);
    }
}
