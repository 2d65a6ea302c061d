//! rentcache core - client-side state synchronization for rent collection.
//!
//! Keeps cached query results in step with a remote backend:
//!
//! - `cache`: keyed store of query results with per-key observers
//! - `bus`: topic-keyed change notifications
//! - `subscription`: reference-counted push subscriptions
//! - `mutation`: optimistic writes with exact rollback, plus approvals
//! - `status`: "last synced" timestamps
//! - `view`: what a screen holds while showing one query
//! - `backend`: the query/write/push boundary and its implementations
//!
//! `SyncContext` wires all of them together for one backend.

pub mod backend;
pub mod bus;
pub mod cache;
pub mod config;
pub mod context;
mod deadline;
pub mod error;
pub mod models;
pub mod mutation;
pub mod status;
pub mod subscription;
pub mod view;

pub use backend::{Backend, MemoryBackend, PushBackend, RestBackend, WriteRequest};
pub use bus::{ChangeBus, SyncEvent};
pub use cache::{CacheEntry, CacheStore, EntryStatus, QueryKey, Scope, Topic};
pub use config::SyncConfig;
pub use context::SyncContext;
pub use error::{BackendError, Result, SyncError};
pub use models::{ApprovalState, ApprovalStatus, Collection, Profile, QueryData, Tenant};
pub use mutation::{ApprovalReceipt, Approvals, MutationEngine, MutationOutcome};
pub use status::SyncStatus;
pub use subscription::{Health, Lease, SubscriptionManager};
pub use view::View;
