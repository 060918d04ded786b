//! The Store Core (spec: §4.4).
//!
//! Wires the Cache, the abstract DB collaborator, the Version
//! Reflector, the Diff Engine, and the Watch Router into the typed
//! CRUD surface applications call. Every operation's own concurrency
//! is just the CAS predicate on `update_one`/`find_one_and_upsert`; the
//! Store holds no per-id lock (spec §4.4 "Concurrency contract").

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{Cache, CacheStats};
use crate::config::StoreConfig;
use crate::db::{Database, Predicate, UpdateClauses};
use crate::diff::{self, Diff, DiffOp};
use crate::document::{Document, Id};
use crate::error::{Result, StoreError};
use crate::hot::HotDataReconciler;
use crate::retry::{Exhausted, RetryBudget};
use crate::version::TypedReflector;
use crate::watch::{SubscribeOptions, SubscriptionHandle, WatchFilter, WatchRouter};

/// Per-call override for [`Store::update`]/[`Store::get`] (spec §4.4
/// step 1: "reconciling against DB when the operation requires a
/// guaranteed-fresh read (configurable per call)").
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    pub require_fresh: bool,
}

/// The outcome of a successful [`Store::update`]/[`Store::upsert`]: the
/// new value plus the diff that produced it, for callers that want to
/// audit or re-derive the update without recomputing it (spec §4.4
/// step 7: "return `(after, Δ)`").
#[derive(Debug, Clone)]
pub struct Updated<D> {
    pub value: D,
    pub diff: Diff,
}

/// The typed, cache-coherent, retry-aware Store (spec §1).
pub struct Store<K, D, DB, C> {
    db: Arc<DB>,
    cache: Arc<C>,
    config: StoreConfig,
    reflector: Arc<TypedReflector<D>>,
    router: Arc<WatchRouter<K, D, DB, C>>,
    reconciler: Option<Arc<HotDataReconciler<K, D, DB, C>>>,
    writer_tag: String,
}

impl<K, D, DB, C> Store<K, D, DB, C>
where
    K: Id,
    D: Document,
    DB: Database<K, D> + 'static,
    C: Cache<K, D> + 'static,
{
    /// Build a Store and, if `config.watch_enabled`, start its root
    /// watch stream.
    pub fn new(db: Arc<DB>, cache: Arc<C>, config: StoreConfig) -> Self {
        let writer_tag = Uuid::new_v4().to_string();
        let router = WatchRouter::new(
            Arc::clone(&db),
            Arc::clone(&cache),
            writer_tag.clone(),
            config.watch_full_document,
        );
        if config.watch_enabled {
            router.start();
        }
        let reflector = Arc::new(TypedReflector::new(config.version_field.clone()));

        let reconciler = if config.hot_data_enabled {
            let reconciler = HotDataReconciler::new(
                Arc::clone(&db),
                Arc::clone(&cache),
                Arc::clone(&reflector),
                config.hot_max_items,
                config.hot_watch_interval,
                config.hot_decay_interval,
            );
            reconciler.start();
            Some(reconciler)
        } else {
            None
        };

        Self {
            db,
            cache,
            config,
            reflector,
            router,
            reconciler,
            writer_tag,
        }
    }

    pub async fn shutdown(&self) {
        self.router.shutdown().await;
        self.cache.clear().await;
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// **Create(doc)** (spec §4.4).
    pub async fn create(&self, doc: D) -> Result<(K, D)> {
        self.reflector.ensure_declared(&doc)?;
        let versioned = self.reflector.set(&doc, 1)?;
        let id = self.db.insert_one(&versioned, &self.writer_tag).await?;
        self.cache.set(id.clone(), versioned.clone(), None).await;
        Ok((id, versioned))
    }

    /// **Get(id)** (spec §4.4).
    pub async fn get(&self, id: &K, opts: ReadOptions) -> Result<D> {
        self.record_access(id).await;
        if !opts.require_fresh {
            if let Some(cached) = self.cache.get(id).await {
                return Ok(cached);
            }
        }
        let value = self.db.find_one(id).await?;
        self.cache.set(id.clone(), value.clone(), None).await;
        Ok(value)
    }

    async fn record_access(&self, id: &K) {
        if let Some(reconciler) = &self.reconciler {
            reconciler.record_access(id).await;
        }
    }

    /// **FindMany(filter)** (spec §4.4): never cached individually,
    /// since results may be partial projections.
    pub async fn find_many(
        &self,
        filter: bson::Document,
    ) -> Result<futures::stream::BoxStream<'static, Result<D>>> {
        self.db.find_many(filter).await
    }

    /// **Update(id, mutate)** (spec §4.4): the CAS retry loop.
    ///
    /// `mutate` receives a deep copy of the current value and returns
    /// the desired next value, or an error that aborts the operation
    /// without retry (spec step 3).
    pub async fn update<F, E>(&self, id: &K, opts: ReadOptions, mut mutate: F) -> Result<Updated<D>>
    where
        F: FnMut(D) -> std::result::Result<D, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut budget = RetryBudget::new(
            self.config.max_retries,
            self.config.max_retry_elapsed,
            self.config.retry_backoff_initial,
            self.config.retry_backoff_jitter,
        );
        let mut require_fresh = opts.require_fresh;

        loop {
            let before = self.get(id, ReadOptions { require_fresh }).await?;
            let before_version = self.reflector.get(&before)?;

            let after = mutate(before.clone()).map_err(|e| StoreError::MutateRejected(Box::new(e)))?;

            let delta = diff::diff(&before, &after, &self.config.array_identifier_field)?;
            if delta.is_empty() {
                return Ok(Updated { value: before, diff: delta });
            }

            let bumped = self.reflector.set(&after, before_version + 1)?;
            let mut clauses = clauses_from_diff(&delta, &bumped)?;
            clauses.set.push((self.config.version_field.clone(), bson::Bson::Int64(before_version + 1)));

            let predicate = Predicate::with_version(id.clone(), before_version);
            let matched = self.db.update_one(predicate, clauses, &self.writer_tag).await?;

            if matched == 0 {
                require_fresh = true;
                match budget.wait().await {
                    Ok(()) => {
                        debug!(id = ?id, attempt = budget.attempt(), "store: CAS predicate missed, retrying update");
                        continue;
                    }
                    Err(reason) => {
                        let elapsed_ms = match reason {
                            Exhausted::MaxRetries => budget.elapsed_ms(),
                            Exhausted::MaxElapsed => self.config.max_retry_elapsed.as_millis() as u64,
                        };
                        warn!(
                            id = ?id,
                            attempts = budget.attempt(),
                            elapsed_ms,
                            "store: update exhausted its retry budget"
                        );
                        return Err(StoreError::ConcurrencyExhausted {
                            id: format!("{id:?}"),
                            attempts: budget.attempt(),
                            elapsed_ms,
                        });
                    }
                }
            }

            self.cache.set(id.clone(), bumped.clone(), None).await;
            return Ok(Updated { value: bumped, diff: delta });
        }
    }

    /// **Upsert(doc)** (spec §4.4): Create on absent id, else Update
    /// that replaces fields via the DB's find-one-and-upsert primitive.
    ///
    /// The not-found path's predicate carries `expected_version: 0` --
    /// a version no real document can ever hold (spec I1: `version >= 1`
    /// after creation) -- rather than an unconditional `by_id` match.
    /// That way a concurrent writer creating the same id between our
    /// `get` and this call surfaces as a `VersionMismatch` instead of
    /// silently matching the race winner's document under our empty
    /// clause set and handing the caller's fields back discarded; on
    /// that mismatch we fall through to the CAS update path so the
    /// caller's `doc` still lands against whatever now exists.
    pub async fn upsert(&self, id: K, doc: D) -> Result<Updated<D>> {
        match self.get(&id, ReadOptions::default()).await {
            Err(e) if e.kind() == crate::error::ErrorKind::NotFound => {
                let versioned = self.reflector.set(&doc, 1)?;
                let predicate = Predicate::with_version(id.clone(), 0);
                match self
                    .db
                    .find_one_and_upsert(predicate, &versioned, UpdateClauses::default(), &self.writer_tag)
                    .await
                {
                    Ok(result) => {
                        self.cache.set(id, result.clone(), None).await;
                        Ok(Updated {
                            value: result,
                            diff: Diff::default(),
                        })
                    }
                    Err(e) if e.kind() == crate::error::ErrorKind::VersionMismatch => {
                        let before = self.db.find_one(&id).await?;
                        self.cache.set(id.clone(), before.clone(), None).await;
                        self.upsert_against(id, doc, before).await
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
            Ok(before) => self.upsert_against(id, doc, before).await,
        }
    }

    /// The CAS-update half of [`Store::upsert`]: diff `doc` against the
    /// already-read `before` image and apply it under the predicate
    /// matching `before`'s version.
    async fn upsert_against(&self, id: K, doc: D, before: D) -> Result<Updated<D>> {
        let before_version = self.reflector.get(&before)?;
        let delta = diff::diff(&before, &doc, &self.config.array_identifier_field)?;
        if delta.is_empty() {
            return Ok(Updated { value: before, diff: delta });
        }
        let bumped = self.reflector.set(&doc, before_version + 1)?;
        let mut clauses = clauses_from_diff(&delta, &bumped)?;
        clauses.set.push((self.config.version_field.clone(), bson::Bson::Int64(before_version + 1)));
        let predicate = Predicate::with_version(id.clone(), before_version);
        let result = self
            .db
            .find_one_and_upsert(predicate, &bumped, clauses, &self.writer_tag)
            .await?;
        self.cache.set(id, result.clone(), None).await;
        Ok(Updated { value: result, diff: delta })
    }

    /// **Delete(id)** (spec §4.4): conditional on version if supplied.
    pub async fn delete(&self, id: &K, expected_version: Option<i64>) -> Result<()> {
        let predicate = match expected_version {
            Some(v) => Predicate::with_version(id.clone(), v),
            None => Predicate::by_id(id.clone()),
        };
        let matched = self.db.delete_one(predicate, &self.writer_tag).await?;
        if matched == 0 {
            return Err(StoreError::not_found(format!("{id:?}")));
        }
        self.cache.delete(id).await;
        Ok(())
    }

    /// **Watch(filterPipeline?)** (spec §4.4/§4.5).
    pub async fn watch(&self, filter: WatchFilter, opts: SubscribeOptions) -> SubscriptionHandle<K, D> {
        self.router.watch(filter, opts).await
    }

    /// Default subscription buffer/policy drawn from config, for
    /// callers that don't need a per-call override.
    pub fn default_subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            buffer_size: self.config.watch_buffer_default,
            policy: crate::config::SlowConsumerPolicy::default(),
        }
    }

    pub fn writer_tag(&self) -> &str {
        &self.writer_tag
    }
}

/// Translate a structural [`Diff`] into the flat set/unset clauses
/// [`Database::update_one`] understands. `Set`/`Unset` map directly
/// since dotted paths are the same vocabulary the abstract DB
/// predicate speaks; array ops (`ArrayAdd`/`ArrayRemove`/
/// `ArrayUpdate`) have no flat equivalent, so every distinct array path
/// touched collapses into one `Set` of that path's fully patched value
/// read back out of `after`.
fn clauses_from_diff<D: Document>(delta: &Diff, after: &D) -> Result<UpdateClauses> {
    let after_bson = bson::to_bson(after)
        .map_err(|e| StoreError::ValidationError(format!("document is not structurally serializable: {e}")))?;

    let mut clauses = UpdateClauses::default();
    let mut array_paths_done = std::collections::BTreeSet::new();

    for op in &delta.ops {
        match op {
            DiffOp::Set { path, value } => clauses.set.push((path.clone(), value.clone())),
            DiffOp::Unset { path } => clauses.unset.push(path.clone()),
            DiffOp::ArrayAdd { path, .. } | DiffOp::ArrayRemove { path, .. } | DiffOp::ArrayUpdate { path, .. } => {
                if array_paths_done.insert(path.clone()) {
                    let value = bson_at_path(&after_bson, path).ok_or_else(|| {
                        StoreError::ValidationError(format!("array path `{path}` missing from patched document"))
                    })?;
                    clauses.set.push((path.clone(), value));
                }
            }
        }
    }
    Ok(clauses)
}

fn bson_at_path(root: &bson::Bson, path: &str) -> Option<bson::Bson> {
    let mut cursor = root;
    for part in path.split('.') {
        cursor = cursor.as_document()?.get(part)?;
    }
    Some(cursor.clone())
}
