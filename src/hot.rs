//! The Hot-Data Reconciler (spec: §4.6).
//!
//! Defends against Cache staleness for frequently read documents
//! during the brief windows where the watch router hasn't yet
//! delivered an external writer's event (a reconnect, a dropped
//! event under `DropOldest`). Strictly read-only towards the backing
//! store: it refreshes or invalidates the Cache, never writes to the
//! DB.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::cache::Cache;
use crate::db::Database;
use crate::document::{Document, Id};
use crate::error::ErrorKind;
use crate::version::TypedReflector;

/// Access-frequency bookkeeping for one id, decayed over time (spec:
/// "counters decay by a fixed factor every decayInterval").
#[derive(Debug, Clone, Copy, Default)]
struct Heat {
    count: f64,
}

struct Tracker<K> {
    heat: HashMap<K, Heat>,
    max_items: usize,
}

impl<K: Id> Tracker<K> {
    fn new(max_items: usize) -> Self {
        Self {
            heat: HashMap::new(),
            max_items,
        }
    }

    fn touch(&mut self, id: &K) {
        self.heat.entry(id.clone()).or_default().count += 1.0;
        if self.heat.len() > self.max_items {
            self.evict_coldest();
        }
    }

    fn decay(&mut self, factor: f64) {
        self.heat.retain(|_, heat| {
            heat.count *= factor;
            heat.count > 0.01
        });
    }

    fn evict_coldest(&mut self) {
        if let Some(coldest) = self
            .heat
            .iter()
            .min_by(|a, b| a.1.count.partial_cmp(&b.1.count).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(k, _)| k.clone())
        {
            self.heat.remove(&coldest);
        }
    }

    fn snapshot_ids(&self) -> Vec<K> {
        self.heat.keys().cloned().collect()
    }
}

/// Tracks per-id access heat and periodically reconciles the hot set
/// against the DB (spec §4.6).
pub struct HotDataReconciler<K, D, DB, C> {
    db: Arc<DB>,
    cache: Arc<C>,
    reflector: Arc<TypedReflector<D>>,
    tracker: AsyncMutex<Tracker<K>>,
    watch_interval: Duration,
    decay_interval: Duration,
    decay_factor: f64,
}

impl<K, D, DB, C> HotDataReconciler<K, D, DB, C>
where
    K: Id,
    D: Document,
    DB: Database<K, D> + 'static,
    C: Cache<K, D> + 'static,
{
    pub fn new(
        db: Arc<DB>,
        cache: Arc<C>,
        reflector: Arc<TypedReflector<D>>,
        max_items: usize,
        watch_interval: Duration,
        decay_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            cache,
            reflector,
            tracker: AsyncMutex::new(Tracker::new(max_items)),
            watch_interval,
            decay_interval,
            decay_factor: 0.5,
        })
    }

    /// Record a `Get`/`Update` access against `id` (spec: "each
    /// Get/Update call increments a per-ID access counter").
    pub async fn record_access(&self, id: &K) {
        self.tracker.lock().await.touch(id);
    }

    /// Start the decay loop and the refresh loop as independent tasks
    /// bound to this `Arc`'s lifetime.
    pub fn start(self: &Arc<Self>) {
        let decay = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(decay.decay_interval);
            loop {
                ticker.tick().await;
                decay.tracker.lock().await.decay(decay.decay_factor);
            }
        });

        let refresh = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh.watch_interval);
            loop {
                ticker.tick().await;
                refresh.reconcile_once().await;
            }
        });
    }

    async fn reconcile_once(&self) {
        let ids = self.tracker.lock().await.snapshot_ids();
        for id in ids {
            match self.db.find_one(&id).await {
                Ok(fresh) => {
                    let fresh_version = match self.reflector.get(&fresh) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    let stale = match self.cache.get(&id).await {
                        Some(cached) => match self.reflector.get(&cached) {
                            Ok(cached_version) => fresh_version > cached_version,
                            Err(_) => true,
                        },
                        None => false,
                    };
                    if stale {
                        self.cache.set(id.clone(), fresh, None).await;
                        debug!(id = ?id, "hot reconciler: refreshed stale cache entry");
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    self.cache.delete(&id).await;
                }
                Err(_) => {
                    // Transient DB failure: leave the cache as-is and
                    // retry on the next tick.
                }
            }
        }
    }
}
