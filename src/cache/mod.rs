//! The Cache plug interface (spec: §4.1, §6.3).
//!
//! Any implementation satisfying the contract below may be supplied to
//! a [`crate::store::Store`]; the Store invokes the cache only through
//! these operations and never relies on implementation-specific
//! eviction timing (spec §6.3). [`memory::MemoryCache`] is the only
//! in-tree backing.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::document::{Document, Id};

/// A cached document plus the bookkeeping the Store and reconciler need
/// (spec: §3 `CacheEntry`).
#[derive(Debug, Clone)]
pub struct CacheEntry<D> {
    pub value: D,
    pub inserted_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub access_count: u64,
    /// This entry's TTL: the `ttl` passed to `Cache::set` when present,
    /// otherwise the backing's configured default (spec §4.1: "TTL
    /// defaults to the Store configuration").
    pub ttl: Duration,
}

/// Point-in-time counters exposed by a cache implementation (spec
/// §4.1: `stats() -> (hits, misses, evictions, size)`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: u64,
}

/// Typed operations over `(K -> D)` (spec §4.1).
///
/// Implementations must never let an internal fault become visible to
/// the Store: a failed `get` is treated as a miss, a failed `set`/
/// `delete` as a no-op, with the fault only recorded in `stats()`
/// (spec: "Failure model").
#[async_trait]
pub trait Cache<K, D>: Send + Sync
where
    K: Id,
    D: Document,
{
    /// Returns a deep copy of the resident, unexpired value for `id`,
    /// if any.
    async fn get(&self, id: &K) -> Option<D>;

    /// Insert a deep copy of `value` for `id`. `ttl` overrides the
    /// Store's configured default when provided.
    async fn set(&self, id: K, value: D, ttl: Option<Duration>);

    /// Remove the entry for `id` if present.
    async fn delete(&self, id: &K);

    /// Remove every entry (spec: "cleared on Store shutdown").
    async fn clear(&self);

    /// Current counters.
    async fn stats(&self) -> CacheStats;
}
