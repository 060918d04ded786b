//! The Watch Router (spec: §4.5).
//!
//! Translates the database's change feed into a fan-out of typed
//! channels, one per [`WatchRouter::watch`] subscription. A single root
//! task pulls from [`crate::db::Database::open_change_stream`]; a
//! per-subscription dispatcher task pushes into that subscriber's
//! channel according to its [`SlowConsumerPolicy`]. The structure
//! mirrors the teacher's own `ChangeStream`: a resumable cursor
//! (`document_resume_token`/`post_batch_resume_token` in
//! `change_stream/mod.rs`) rebuilt on a recoverable error via
//! `new_cursor`, generalized from "one cursor per `ChangeStream`
//! handle" to "one root cursor multiplexed to N subscriptions".

mod channel;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::config::SlowConsumerPolicy;
use crate::db::{ChangeStreamOpenOptions, Database};
use crate::diff::{self, Diff};
use crate::document::{Document, Id};
use crate::error::ErrorKind;

/// The kind of mutation a change event describes (spec: §3 `WatchEvent
/// E`, `operation ∈ {create, update, replace, delete}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Replace,
    Delete,
}

/// The event shape handed back by [`crate::db::Database::
/// open_change_stream`], before the router attaches a diff or resolves
/// `originated_locally`.
#[derive(Debug, Clone)]
pub struct RawChangeEvent<K, D> {
    pub operation: Operation,
    pub id: K,
    /// Full post-image, present for non-delete operations when
    /// full-document lookup is enabled.
    pub data: Option<D>,
    pub resume_token: bson::Bson,
    /// The per-process write tag the Store stamped onto the mutation
    /// that produced this event, if the backing surfaces it (spec
    /// §4.5 "External-origin policy"). `None` when the backend can't
    /// carry arbitrary metadata through to its change feed, in which
    /// case every event is treated as externally originated.
    pub writer_tag: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// The consumer-visible change event (spec §6.4).
#[derive(Clone)]
pub struct WatchEvent<K, D> {
    pub operation: Operation,
    pub id: K,
    pub data: Option<D>,
    /// Populated when the event is an update and the Store held a
    /// prior cache image to diff against (spec §4.5).
    pub diff: Option<Diff>,
    pub resume_token: bson::Bson,
    pub originated_locally: bool,
    pub timestamp: DateTime<Utc>,
}

/// What actually crosses a subscriber's channel: either a real change,
/// or the synthetic marker telling the consumer its view may have
/// skipped history and it should re-read from the Store (spec §4.5).
#[derive(Debug, Clone)]
pub enum DeliveredEvent<K, D> {
    Change(WatchEvent<K, D>),
    Resync,
}

/// A server-side filter stage, re-checked client-side for robustness
/// (spec §4.5). Modeled as flat field-equality predicates against the
/// post-image, which is the common case for the aggregation `$match`
/// stages the teacher's own pipeline builder assembles
/// (`change_stream/pipelines.rs`); richer predicates are intentionally
/// out of scope for the Store core.
#[derive(Debug, Clone, Default)]
pub struct WatchFilter {
    equals: Vec<(String, bson::Bson)>,
}

impl WatchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<bson::Bson>) -> Self {
        self.equals.push((field.into(), value.into()));
        self
    }

    fn matches<D: Document>(&self, data: &Option<D>) -> bool {
        if self.equals.is_empty() {
            return true;
        }
        let Some(data) = data else { return false };
        let Ok(bson::Bson::Document(doc)) = bson::to_bson(data) else {
            return false;
        };
        self.equals.iter().all(|(field, value)| doc.get(field) == Some(value))
    }
}

/// Per-call overrides for [`WatchRouter::watch`] (spec §6.1
/// `watchBufferDefault`, §4.5 policy).
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub buffer_size: usize,
    pub policy: SlowConsumerPolicy,
}

/// A live subscription (spec §3 `Subscription S`).
pub struct SubscriptionHandle<K, D> {
    pub id: u64,
    receiver: channel::Receiver<DeliveredEvent<K, D>>,
    cancel: CancellationToken,
}

impl<K, D> SubscriptionHandle<K, D> {
    pub async fn recv(&mut self) -> Option<DeliveredEvent<K, D>> {
        self.receiver.recv().await
    }

    /// The only way to end a subscription other than dropping the
    /// handle (spec §4.5 "Router restart is idempotent...").
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

struct SubscriptionState<K, D> {
    filter: WatchFilter,
    sender: channel::Sender<DeliveredEvent<K, D>>,
    cancel: CancellationToken,
    created: DateTime<Utc>,
    last_resume_token: AsyncMutex<Option<bson::Bson>>,
}

/// Router-wide counters, exposed for the `dropped` stat named in spec
/// §4.5.
#[derive(Debug, Default)]
pub struct WatchStats {
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub resyncs: AtomicU64,
}

/// Fan-out router over a single root change feed.
pub struct WatchRouter<K, D, DB, C> {
    db: Arc<DB>,
    cache: Arc<C>,
    writer_tag: String,
    full_document: bool,
    subscriptions: AsyncMutex<HashMap<u64, Arc<SubscriptionState<K, D>>>>,
    next_id: AtomicU64,
    stats: WatchStats,
    shutdown: CancellationToken,
}

impl<K, D, DB, C> WatchRouter<K, D, DB, C>
where
    K: Id,
    D: Document,
    DB: Database<K, D> + 'static,
    C: Cache<K, D> + 'static,
{
    pub fn new(db: Arc<DB>, cache: Arc<C>, writer_tag: String, full_document: bool) -> Arc<Self> {
        Arc::new(Self {
            db,
            cache,
            writer_tag,
            full_document,
            subscriptions: AsyncMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stats: WatchStats::default(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the root reader task. A no-op to call more than once;
    /// only the first call spawns a task (spec: "Router restart is
    /// idempotent").
    pub fn start(self: &Arc<Self>) {
        let router = Arc::clone(self);
        tokio::spawn(async move { router.run_root_loop().await });
    }

    /// Closes the root stream and every subscriber channel (spec §5:
    /// "closed on Store shutdown, which in turn closes all subscriber
    /// channels").
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let subs = self.subscriptions.lock().await;
        for sub in subs.values() {
            sub.sender.close();
            sub.cancel.cancel();
        }
    }

    pub async fn watch(self: &Arc<Self>, filter: WatchFilter, opts: SubscribeOptions) -> SubscriptionHandle<K, D> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = channel::bounded(opts.buffer_size, opts.policy);
        let cancel = CancellationToken::new();
        let state = Arc::new(SubscriptionState {
            filter,
            sender,
            cancel: cancel.clone(),
            created: Utc::now(),
            last_resume_token: AsyncMutex::new(None),
        });
        self.subscriptions.lock().await.insert(id, state);
        SubscriptionHandle { id, receiver, cancel }
    }

    async fn unregister(&self, id: u64) {
        self.subscriptions.lock().await.remove(&id);
    }

    /// The oldest resume token across live subscriptions, used to
    /// reopen the root stream so "no subscriber misses events" (spec
    /// §4.5).
    async fn oldest_resume_token(&self) -> Option<bson::Bson> {
        let subs = self.subscriptions.lock().await;
        let mut oldest: Option<bson::Bson> = None;
        for sub in subs.values() {
            let token = sub.last_resume_token.lock().await.clone();
            if token.is_none() {
                // A subscription that has never received an event must
                // resume from the very beginning of what's available;
                // there is no older point than "no token at all".
                return None;
            }
            oldest = token;
        }
        oldest
    }

    async fn run_root_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let resume_token = self.oldest_resume_token().await;
            let open_result = self
                .db
                .open_change_stream(
                    Vec::new(),
                    ChangeStreamOpenOptions {
                        full_document: self.full_document,
                        resume_token,
                    },
                )
                .await;

            let mut stream = match open_result {
                Ok(stream) => stream,
                Err(err) if err.kind() == ErrorKind::ResumePointInvalid => {
                    // Resume point beyond the DB's history window: the
                    // router resyncs every subscriber and resumes from
                    // "now" (spec §4.5).
                    warn!(error = %err, "watch router: resume point beyond history window, resyncing subscribers");
                    self.broadcast_resync().await;
                    continue;
                }
                Err(err) => {
                    warn!(error = %err, "watch router: root stream reopen failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    continue;
                }
            };

            use futures::StreamExt;
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    next = stream.next() => {
                        match next {
                            Some(Ok(raw)) => self.dispatch(raw).await,
                            Some(Err(_)) => {
                                warn!("watch router: root stream error, reopening");
                                break;
                            }
                            None => {
                                debug!("watch router: root stream ended, reopening");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn broadcast_resync(&self) {
        self.stats.resyncs.fetch_add(1, Ordering::Relaxed);
        let subs = self.subscriptions.lock().await;
        for sub in subs.values() {
            let _ = sub.sender.dispatch(DeliveredEvent::Resync).await;
            *sub.last_resume_token.lock().await = None;
        }
    }

    async fn dispatch(&self, raw: RawChangeEvent<K, D>) {
        let originated_locally = raw.writer_tag.as_deref() == Some(self.writer_tag.as_str());

        let diff = if matches!(raw.operation, Operation::Update) {
            match (&raw.data, self.cache.get(&raw.id).await) {
                (Some(after), Some(prior)) => diff::diff(&prior, after, "id").ok(),
                _ => None,
            }
        } else {
            None
        };

        if !originated_locally {
            match (&raw.operation, &raw.data) {
                (Operation::Delete, _) => {
                    self.cache.delete(&raw.id).await;
                }
                (_, Some(data)) => {
                    self.cache.set(raw.id.clone(), data.clone(), None).await;
                }
                (_, None) => {
                    self.cache.delete(&raw.id).await;
                }
            }
            info!(id = ?raw.id, "watch router: invalidated cache for externally originated change");
        }

        let event = WatchEvent {
            operation: raw.operation,
            id: raw.id,
            data: raw.data,
            diff,
            resume_token: raw.resume_token,
            originated_locally,
            timestamp: raw.timestamp,
        };

        let subs: Vec<(u64, Arc<SubscriptionState<K, D>>)> =
            self.subscriptions.lock().await.iter().map(|(id, sub)| (*id, Arc::clone(sub))).collect();
        for (id, sub) in subs {
            if !sub.filter.matches(&event.data) {
                continue;
            }
            let outcome = sub.sender.dispatch(DeliveredEvent::Change(event.clone())).await;
            *sub.last_resume_token.lock().await = Some(event.resume_token.clone());
            match outcome {
                channel::DispatchOutcome::Delivered => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                channel::DispatchOutcome::DroppedOldest => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
                channel::DispatchOutcome::ClosedLagging => {
                    warn!(subscription = id, "watch router: subscription closed for lagging under Close policy");
                    self.unregister(id).await;
                }
            }
        }
    }
}

impl<K, D> std::fmt::Debug for WatchEvent<K, D>
where
    K: std::fmt::Debug,
    D: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchEvent")
            .field("operation", &self.operation)
            .field("id", &self.id)
            .field("originated_locally", &self.originated_locally)
            .finish()
    }
}
