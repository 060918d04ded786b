//! Store-wide configuration (spec: §6.1).
//!
//! Follows the teacher's `ChangeStreamOptions` shape: a `TypedBuilder`
//! struct with a field-level default for every option, so callers only
//! set what they need to override.

use std::time::Duration;
use typed_builder::TypedBuilder;

/// Cache eviction policy, chosen once for the lifetime of a `MemoryCache`
/// (spec: §4.1 -- "a fixed config choice, not per-entry").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Evict the entry with the oldest `last_access`.
    Lru,
    /// Evict the entry with the lowest `access_count`.
    Lfu,
    /// Evict the entry with the oldest `inserted_at`.
    Fifo,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        EvictionPolicy::Lru
    }
}

/// Delivery policy for a watch subscription whose channel is full
/// (spec: §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowConsumerPolicy {
    /// Stall this subscriber only; other subscribers continue.
    Block,
    /// Drop the oldest buffered event, push the new one, and increment
    /// the subscription's `dropped` counter.
    DropOldest,
    /// Close the channel and unregister the subscription with a
    /// "lagging" error.
    Close,
}

impl Default for SlowConsumerPolicy {
    fn default() -> Self {
        SlowConsumerPolicy::Block
    }
}

/// Top-level Store configuration.
///
/// All durations are expressed as [`Duration`] even though spec.md's
/// table lists them in minutes/milliseconds/seconds; defaults below
/// match the table exactly.
#[derive(Debug, Clone, TypedBuilder)]
pub struct StoreConfig {
    /// Name of the document field used for CAS (spec: `versionField`).
    #[builder(default = "version".to_string())]
    pub version_field: String,

    /// Default TTL for cache entries (spec: `cacheTTL`, default 10 min).
    #[builder(default = Duration::from_secs(600))]
    pub cache_ttl: Duration,

    /// Hard cap on cache size (spec: `cacheMaxItems`, default unlimited).
    #[builder(default, setter(strip_option))]
    pub cache_max_items: Option<usize>,

    /// Cache eviction policy (spec: `evictionPolicy`, default LRU).
    #[builder(default)]
    pub eviction_policy: EvictionPolicy,

    /// How often the cache's background sweeper removes expired entries.
    ///
    /// Not named in spec.md's configuration table, but required by the
    /// Cache contract (spec: §4.1, "a single background sweeper that
    /// runs every `sweepInterval`"); exposed here so it is not a hidden
    /// constant.
    #[builder(default = Duration::from_secs(30))]
    pub sweep_interval: Duration,

    /// Start the root change stream on init (spec: `watchEnabled`).
    #[builder(default = true)]
    pub watch_enabled: bool,

    /// Ask the DB to include the post-image on updates (spec:
    /// `watchFullDocument`).
    #[builder(default = true)]
    pub watch_full_document: bool,

    /// Per-subscription channel capacity default (spec:
    /// `watchBufferDefault`).
    #[builder(default = 100)]
    pub watch_buffer_default: usize,

    /// Cap on CAS retries per operation (spec: `maxRetries`).
    #[builder(default = 5)]
    pub max_retries: u32,

    /// Time budget for CAS retries per operation (spec:
    /// `maxRetryElapsed`).
    #[builder(default = Duration::from_secs(5))]
    pub max_retry_elapsed: Duration,

    /// Exponential backoff starting point (spec: `retryBackoffInitial`).
    #[builder(default = Duration::from_millis(10))]
    pub retry_backoff_initial: Duration,

    /// Multiplicative jitter applied to each backoff (spec:
    /// `retryBackoffJitter`).
    #[builder(default = 0.2)]
    pub retry_backoff_jitter: f64,

    /// Enable the hot-data reconciler (spec: `hotDataEnabled`).
    #[builder(default = false)]
    pub hot_data_enabled: bool,

    /// Top-K size for the hot set (spec: `hotMaxItems`).
    #[builder(default = 100)]
    pub hot_max_items: usize,

    /// Reconciler refresh period (spec: `hotWatchInterval`).
    #[builder(default = Duration::from_secs(10))]
    pub hot_watch_interval: Duration,

    /// Access-counter decay period (spec: `hotDecayInterval`).
    #[builder(default = Duration::from_secs(60))]
    pub hot_decay_interval: Duration,

    /// Field used as the stable element identifier when diffing arrays
    /// (spec §4.3/§9 open question (a)); default mirrors the common
    /// convention of an `id`-keyed array element.
    #[builder(default = "id".to_string())]
    pub array_identifier_field: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::builder().build()
    }
}
