//! Distributed mutual-exclusion lock on a Redis-compatible key-value store.
//!
//! Processes race to create a lease key with an atomic set-if-absent; the
//! winner holds the lock until it releases the key or the key's TTL expires.
//! See [`GlobalLock`] for the protocol.

pub mod config;
pub mod coordination;
pub mod error;
pub mod metrics;

pub use config::{Config, LockConfig, OwnershipCheck, OwnershipMode, SpinPolicy, StoreConfig};
pub use coordination::locks::{GlobalLock, Lease};
pub use coordination::memory::InMemoryLockStore;
pub use coordination::ownership::ContextId;
pub use coordination::store::{LockStore, RedisLockStore};
pub use error::LockError;
pub use metrics::{LockMetrics, MetricsRegistry};
