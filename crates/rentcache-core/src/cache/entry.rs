//! Cached query results and their freshness.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::QueryKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Fresh,
    Stale,
    Pending,
    Error,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryStatus::Fresh => write!(f, "fresh"),
            EntryStatus::Stale => write!(f, "stale"),
            EntryStatus::Pending => write!(f, "pending"),
            EntryStatus::Error => write!(f, "error"),
        }
    }
}

/// One immutable version of a cached query result.
///
/// The store replaces entries whole, so a reader holding an entry always sees
/// a consistent `data`/`status` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub key: QueryKey,
    pub data: V,
    pub status: EntryStatus,
    pub updated_at: DateTime<Utc>,
    /// Monotonic per key; bumped by every write.
    pub version: u64,
    pub error: Option<String>,
}

impl<V> CacheEntry<V> {
    pub fn age_minutes(&self) -> i64 {
        let now = Utc::now();
        (now - self.updated_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        age_display(self.updated_at)
    }

    pub fn is_fresh(&self) -> bool {
        self.status == EntryStatus::Fresh
    }
}

/// Human-readable age of a timestamp: "just now", "5m ago", "2h ago", "3d ago".
pub fn age_display(at: DateTime<Utc>) -> String {
    let minutes = (Utc::now() - at).num_minutes();
    if minutes < 1 {
        // Covers clock skew as well
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        if minutes % 60 >= 30 {
            // Round up: 1h 30m+ becomes 2h
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        if (minutes % 1440) / 60 >= 12 {
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}
