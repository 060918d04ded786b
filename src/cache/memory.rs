//! The in-memory `Cache` implementation (spec: §4.1).
//!
//! Uses a sharded concurrent map (`dashmap`, generalized from the
//! teacher's fine-grained locking around pooled connections in
//! `pool.rs`) plus a single background sweeper task that removes
//! expired entries every `sweep_interval`. Capacity enforcement, when
//! configured, evicts on insert using the configured policy; policy is
//! a fixed choice for the cache's lifetime, not per-entry (spec §4.1).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{Cache, CacheEntry, CacheStats};
use crate::config::EvictionPolicy;
use crate::document::{Document, Id};

/// In-memory, process-local cache backing.
///
/// Constructed via [`MemoryCache::spawn`], which returns an `Arc` and
/// starts the sweeper task bound to that `Arc`'s lifetime: the sweeper
/// holds only a [`Weak`] reference, so it stops on its own once every
/// strong reference (including the `Store`'s) is dropped, without
/// requiring an explicit shutdown call.
pub struct MemoryCache<K, D> {
    map: dashmap::DashMap<K, CacheEntry<D>>,
    default_ttl: Duration,
    max_items: Option<usize>,
    policy: EvictionPolicy,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K, D> MemoryCache<K, D>
where
    K: Id,
    D: Document,
{
    /// Build the cache and start its background sweeper.
    pub fn spawn(
        default_ttl: Duration,
        max_items: Option<usize>,
        policy: EvictionPolicy,
        sweep_interval: Duration,
    ) -> Arc<Self> {
        let cache = Arc::new(Self {
            map: dashmap::DashMap::new(),
            default_ttl,
            max_items,
            policy,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        });

        let weak: Weak<Self> = Arc::downgrade(&cache);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(strong) => strong.sweep_expired(),
                    None => return,
                }
            }
        });

        cache
    }

    fn sweep_expired(&self) {
        let now = Utc::now();
        let mut expired = Vec::new();
        for entry in self.map.iter() {
            if is_expired(entry.value(), now) {
                expired.push(entry.key().clone());
            }
        }
        for key in expired {
            if self.map.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Evict one entry per the configured policy, making room for an
    /// insert. No-op if under capacity or capacity is unbounded.
    fn evict_if_at_capacity(&self) {
        let Some(max_items) = self.max_items else { return };
        if self.map.len() < max_items {
            return;
        }

        let victim = match self.policy {
            EvictionPolicy::Lru => self
                .map
                .iter()
                .min_by_key(|e| e.value().last_access)
                .map(|e| e.key().clone()),
            EvictionPolicy::Lfu => self
                .map
                .iter()
                .min_by_key(|e| e.value().access_count)
                .map(|e| e.key().clone()),
            EvictionPolicy::Fifo => self
                .map
                .iter()
                .min_by_key(|e| e.value().inserted_at)
                .map(|e| e.key().clone()),
        };

        if let Some(key) = victim {
            if self.map.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn is_expired<D>(entry: &CacheEntry<D>, now: chrono::DateTime<Utc>) -> bool {
    let age = now.signed_duration_since(entry.inserted_at);
    match chrono::Duration::from_std(entry.ttl) {
        Ok(ttl) => age >= ttl,
        Err(_) => false,
    }
}

#[async_trait]
impl<K, D> Cache<K, D> for MemoryCache<K, D>
where
    K: Id,
    D: Document,
{
    async fn get(&self, id: &K) -> Option<D> {
        let now = Utc::now();
        if let Some(mut entry) = self.map.get_mut(id) {
            if is_expired(entry.value(), now) {
                drop(entry);
                self.map.remove(id);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            entry.last_access = now;
            entry.access_count += 1;
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn set(&self, id: K, value: D, ttl: Option<Duration>) {
        if !self.map.contains_key(&id) {
            self.evict_if_at_capacity();
        }
        let now = Utc::now();
        self.map.insert(
            id,
            CacheEntry {
                value,
                inserted_at: now,
                last_access: now,
                access_count: 0,
                ttl: ttl.unwrap_or(self.default_ttl),
            },
        );
    }

    async fn delete(&self, id: &K) {
        self.map.remove(id);
    }

    async fn clear(&self) {
        self.map.clear();
    }

    async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.map.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache: Arc<MemoryCache<String, i64>> =
            MemoryCache::spawn(StdDuration::from_secs(60), None, EvictionPolicy::Lru, StdDuration::from_secs(60));
        cache.set("a".to_string(), 1, None).await;
        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.size, 1);
    }

    #[tokio::test]
    async fn miss_is_counted() {
        let cache: Arc<MemoryCache<String, i64>> =
            MemoryCache::spawn(StdDuration::from_secs(60), None, EvictionPolicy::Lru, StdDuration::from_secs(60));
        assert_eq!(cache.get(&"missing".to_string()).await, None);
        assert_eq!(cache.stats().await.misses, 1);
    }

    #[tokio::test]
    async fn lru_eviction_picks_oldest_access() {
        let cache: Arc<MemoryCache<String, i64>> =
            MemoryCache::spawn(StdDuration::from_secs(60), Some(2), EvictionPolicy::Lru, StdDuration::from_secs(60));
        cache.set("a".to_string(), 1, None).await;
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        cache.set("b".to_string(), 2, None).await;
        // Touch `b` so `a` becomes the least-recently-used entry.
        cache.get(&"b".to_string()).await;
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        cache.set("c".to_string(), 3, None).await;

        assert_eq!(cache.get(&"a".to_string()).await, None);
        assert_eq!(cache.get(&"b".to_string()).await, Some(2));
        assert_eq!(cache.get(&"c".to_string()).await, Some(3));
        assert!(cache.stats().await.evictions >= 1);
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let cache: Arc<MemoryCache<String, i64>> =
            MemoryCache::spawn(StdDuration::from_secs(60), None, EvictionPolicy::Lru, StdDuration::from_secs(60));
        cache.set("a".to_string(), 1, None).await;
        cache.delete(&"a".to_string()).await;
        assert_eq!(cache.get(&"a".to_string()).await, None);

        cache.set("b".to_string(), 2, None).await;
        cache.clear().await;
        assert_eq!(cache.stats().await.size, 0);
    }
}
