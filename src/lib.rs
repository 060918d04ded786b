//! A generic, cache-coherent document store with optimistic
//! concurrency and change-stream fan-out.
//!
//! [`Store`] is the façade: construct one over a [`Database`]
//! collaborator and a [`Cache`] backing, then call `create`/`get`/
//! `find_many`/`update`/`upsert`/`delete`/`watch`. See [`StoreConfig`]
//! for the knobs and their defaults.

pub mod cache;
pub mod config;
pub mod db;
pub mod diff;
pub mod document;
pub mod error;
pub mod hot;
pub mod retry;
pub mod store;
pub mod version;
pub mod watch;

pub use cache::memory::MemoryCache;
pub use cache::{Cache, CacheEntry, CacheStats};
pub use config::{EvictionPolicy, SlowConsumerPolicy, StoreConfig};
pub use db::{ChangeStreamOpenOptions, Database, Predicate, UpdateClauses};
pub use diff::{diff, Diff, DiffOp};
pub use document::{Document, Id};
pub use error::{ErrorKind, Result, StoreError};
pub use hot::HotDataReconciler;
pub use store::{ReadOptions, Store, Updated};
pub use version::VersionReflector;
pub use watch::{DeliveredEvent, Operation, RawChangeEvent, SubscribeOptions, SubscriptionHandle, WatchEvent, WatchFilter, WatchRouter};
