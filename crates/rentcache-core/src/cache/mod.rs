//! In-memory cache of query results.
//!
//! This module provides the `CacheStore`, a keyed store mapping a
//! `QueryKey` (topic plus scope) to its last-known result and status.
//!
//! - At most one fetch per key is in flight; later callers join it.
//! - Writes replace entries whole and notify the key's observers.
//! - Invalidation marks entries stale and refetches the observed ones.
//! - Idle and over-capacity entries are evicted unless observed.

pub mod entry;
pub mod key;
pub mod store;

pub use entry::{age_display, CacheEntry, EntryStatus};
pub use key::{QueryKey, Scope, Topic};
pub use store::{CacheStore, Fetcher, Observer, ObserverHandle, SpeculativeWrite};
