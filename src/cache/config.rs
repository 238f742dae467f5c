//! Configuration for the cache system
//!
//! Defaults mirror what a browser-hosted image cache needs: a small volatile
//! tier (100 entries, 5 minute TTL), a durable tier policed to a few
//! megabytes, and a 3 second acknowledgment window for the intermediary.

use crate::cache::types::{Priority, TierKind, TierSet};
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Volatile (in-process) tier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolatileConfig {
    /// Entry-count ceiling; one entry is evicted per insert beyond it
    pub max_entries: usize,

    /// TTL used when the caller gives none
    pub default_ttl: Duration,

    /// TTL jitter factor (0.0 - 1.0) applied to `default_ttl` only
    pub ttl_jitter: f64,

    /// Enable the periodic expiry sweep
    pub enable_auto_cleanup: bool,

    /// Interval between expiry sweeps
    pub sweep_interval: Duration,

    /// Debounce window for batched physical deletes
    pub batch_delete_delay: Duration,
}

impl Default for VolatileConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            default_ttl: Duration::from_secs(5 * 60),
            ttl_jitter: 0.0,
            enable_auto_cleanup: true,
            sweep_interval: Duration::from_secs(60),
            batch_delete_delay: Duration::from_millis(100),
        }
    }
}

impl VolatileConfig {
    /// Calculate the default TTL with jitter applied
    pub fn ttl_with_jitter(&self) -> Duration {
        if self.ttl_jitter == 0.0 {
            return self.default_ttl;
        }

        let base_secs = self.default_ttl.as_secs_f64();
        let jitter_range = base_secs * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(1.0);

        Duration::from_secs_f64(final_secs)
    }
}

/// Durable (persistent snapshot) tier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableConfig {
    /// Whether the tier participates at all
    pub enabled: bool,

    /// Storage blob name holding the snapshot
    pub namespace: String,

    /// Snapshots written by any other schema version are discarded
    pub schema_version: u32,

    /// Soft entry-count ceiling that triggers pruning
    pub max_entries: usize,

    /// Approximate storage quota the tier polices itself against
    pub capacity_bytes: usize,

    /// Fraction of `capacity_bytes` at which pruning starts
    pub usage_threshold: f64,

    /// Fraction of entries removed by one prune pass
    pub prune_fraction: f64,

    /// TTL for structured records when the caller gives none
    pub record_ttl: Duration,

    /// TTL for URL entries when the caller gives none
    pub url_ttl: Duration,
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "cache:durable".to_string(),
            schema_version: 1,
            max_entries: 500,
            // ~5 MB, the usual per-origin quota
            capacity_bytes: 5 * 1024 * 1024,
            usage_threshold: 0.8,
            prune_fraction: 0.25,
            record_ttl: Duration::from_secs(15 * 60),
            url_ttl: Duration::from_secs(30 * 60),
        }
    }
}

impl DurableConfig {
    /// Serialized size at which a prune pass runs
    pub fn prune_threshold_bytes(&self) -> usize {
        (self.capacity_bytes as f64 * self.usage_threshold) as usize
    }
}

/// Network intermediary notifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Bounded wait for an acknowledgment
    pub ack_timeout: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(3),
        }
    }
}

/// Version token settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionConfig {
    /// How long a version read from the store is reused in-process
    pub read_cache_duration: Duration,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            read_cache_duration: Duration::from_secs(5 * 60),
        }
    }
}

/// Configuration for the cache coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub volatile: VolatileConfig,
    pub durable: DurableConfig,
    pub notifier: NotifierConfig,
    pub versions: VersionConfig,

    /// Priority used when the caller gives none
    pub default_priority: Priority,

    /// Buffer size of the cache event broadcast channel
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            volatile: VolatileConfig::default(),
            durable: DurableConfig::default(),
            notifier: NotifierConfig::default(),
            versions: VersionConfig::default(),
            default_priority: Priority::NORMAL,
            event_capacity: 64,
        }
    }
}

impl CoordinatorConfig {
    /// Create a new builder for coordinator configuration
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.volatile.max_entries == 0 {
            return Err("volatile.max_entries must be greater than 0".to_string());
        }

        if self.volatile.ttl_jitter < 0.0 || self.volatile.ttl_jitter > 1.0 {
            return Err("volatile.ttl_jitter must be between 0.0 and 1.0".to_string());
        }

        if self.volatile.sweep_interval.is_zero() {
            return Err("volatile.sweep_interval must be non-zero".to_string());
        }

        if self.durable.namespace.trim().is_empty() {
            return Err("durable.namespace must not be empty".to_string());
        }

        if self.durable.max_entries == 0 || self.durable.capacity_bytes == 0 {
            return Err("durable limits must be greater than 0".to_string());
        }

        if self.durable.prune_fraction <= 0.0 || self.durable.prune_fraction > 1.0 {
            return Err("durable.prune_fraction must be in (0.0, 1.0]".to_string());
        }

        if self.durable.usage_threshold <= 0.0 || self.durable.usage_threshold > 1.0 {
            return Err("durable.usage_threshold must be in (0.0, 1.0]".to_string());
        }

        if self.notifier.ack_timeout.is_zero() {
            return Err("notifier.ack_timeout must be non-zero".to_string());
        }

        if self.event_capacity == 0 {
            return Err("event_capacity must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Load configuration from `LAYERED_CACHE_*` environment variables,
    /// reading a `.env` file first if one exists.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Self::default();

        if let Some(v) = env_parse::<usize>("LAYERED_CACHE_MAX_ENTRIES")? {
            config.volatile.max_entries = v;
        }
        if let Some(ms) = env_parse::<u64>("LAYERED_CACHE_DEFAULT_TTL_MS")? {
            config.volatile.default_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("LAYERED_CACHE_SWEEP_INTERVAL_MS")? {
            config.volatile.sweep_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("LAYERED_CACHE_BATCH_DELETE_MS")? {
            config.volatile.batch_delete_delay = Duration::from_millis(ms);
        }
        if let Some(ns) = env_parse::<String>("LAYERED_CACHE_DURABLE_NAMESPACE")? {
            config.durable.namespace = ns;
        }
        if let Some(v) = env_parse::<usize>("LAYERED_CACHE_DURABLE_CAPACITY_BYTES")? {
            config.durable.capacity_bytes = v;
        }
        if let Some(v) = env_parse::<usize>("LAYERED_CACHE_DURABLE_MAX_ENTRIES")? {
            config.durable.max_entries = v;
        }
        if let Some(v) = env_parse::<u32>("LAYERED_CACHE_SCHEMA_VERSION")? {
            config.durable.schema_version = v;
        }
        if let Some(ms) = env_parse::<u64>("LAYERED_CACHE_ACK_TIMEOUT_MS")? {
            config.notifier.ack_timeout = Duration::from_millis(ms);
        }

        config.validate().map_err(CacheError::Config)?;
        Ok(config)
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CacheError::Config(format!("{}={:?}: {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}

/// Builder for coordinator configuration
#[derive(Debug, Default)]
pub struct CoordinatorConfigBuilder {
    max_entries: Option<usize>,
    default_ttl: Option<Duration>,
    ttl_jitter: Option<f64>,
    enable_auto_cleanup: Option<bool>,
    sweep_interval: Option<Duration>,
    batch_delete_delay: Option<Duration>,
    durable_enabled: Option<bool>,
    durable_namespace: Option<String>,
    schema_version: Option<u32>,
    durable_max_entries: Option<usize>,
    durable_capacity_bytes: Option<usize>,
    prune_fraction: Option<f64>,
    ack_timeout: Option<Duration>,
    version_read_cache: Option<Duration>,
    default_priority: Option<Priority>,
    event_capacity: Option<usize>,
}

impl CoordinatorConfigBuilder {
    /// Set the volatile tier's entry ceiling
    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    /// Set default TTL for volatile entries
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Set TTL jitter factor (0.0 - 1.0)
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    /// Enable or disable the periodic sweep
    pub fn enable_auto_cleanup(mut self, enable: bool) -> Self {
        self.enable_auto_cleanup = Some(enable);
        self
    }

    /// Set sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Set the delete debounce window
    pub fn batch_delete_delay(mut self, delay: Duration) -> Self {
        self.batch_delete_delay = Some(delay);
        self
    }

    /// Enable or disable the durable tier
    pub fn durable_enabled(mut self, enabled: bool) -> Self {
        self.durable_enabled = Some(enabled);
        self
    }

    /// Set the durable snapshot blob name
    pub fn durable_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.durable_namespace = Some(namespace.into());
        self
    }

    /// Set the durable schema version
    pub fn schema_version(mut self, version: u32) -> Self {
        self.schema_version = Some(version);
        self
    }

    /// Set the durable soft entry ceiling
    pub fn durable_max_entries(mut self, max: usize) -> Self {
        self.durable_max_entries = Some(max);
        self
    }

    /// Set the durable storage quota
    pub fn durable_capacity_bytes(mut self, bytes: usize) -> Self {
        self.durable_capacity_bytes = Some(bytes);
        self
    }

    /// Set the fraction removed per prune pass
    pub fn prune_fraction(mut self, fraction: f64) -> Self {
        self.prune_fraction = Some(fraction);
        self
    }

    /// Set the intermediary acknowledgment timeout
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = Some(timeout);
        self
    }

    /// Set how long a fetched version is reused in-process
    pub fn version_read_cache(mut self, duration: Duration) -> Self {
        self.version_read_cache = Some(duration);
        self
    }

    /// Set the default write priority
    pub fn default_priority(mut self, priority: Priority) -> Self {
        self.default_priority = Some(priority);
        self
    }

    /// Set the event channel capacity
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    /// Build the coordinator configuration
    pub fn build(self) -> CoordinatorConfig {
        let defaults = CoordinatorConfig::default();

        CoordinatorConfig {
            volatile: VolatileConfig {
                max_entries: self.max_entries.unwrap_or(defaults.volatile.max_entries),
                default_ttl: self.default_ttl.unwrap_or(defaults.volatile.default_ttl),
                ttl_jitter: self.ttl_jitter.unwrap_or(defaults.volatile.ttl_jitter),
                enable_auto_cleanup: self
                    .enable_auto_cleanup
                    .unwrap_or(defaults.volatile.enable_auto_cleanup),
                sweep_interval: self.sweep_interval.unwrap_or(defaults.volatile.sweep_interval),
                batch_delete_delay: self
                    .batch_delete_delay
                    .unwrap_or(defaults.volatile.batch_delete_delay),
            },
            durable: DurableConfig {
                enabled: self.durable_enabled.unwrap_or(defaults.durable.enabled),
                namespace: self.durable_namespace.unwrap_or(defaults.durable.namespace),
                schema_version: self.schema_version.unwrap_or(defaults.durable.schema_version),
                max_entries: self
                    .durable_max_entries
                    .unwrap_or(defaults.durable.max_entries),
                capacity_bytes: self
                    .durable_capacity_bytes
                    .unwrap_or(defaults.durable.capacity_bytes),
                prune_fraction: self.prune_fraction.unwrap_or(defaults.durable.prune_fraction),
                ..defaults.durable
            },
            notifier: NotifierConfig {
                ack_timeout: self.ack_timeout.unwrap_or(defaults.notifier.ack_timeout),
            },
            versions: VersionConfig {
                read_cache_duration: self
                    .version_read_cache
                    .unwrap_or(defaults.versions.read_cache_duration),
            },
            default_priority: self.default_priority.unwrap_or(defaults.default_priority),
            event_capacity: self.event_capacity.unwrap_or(defaults.event_capacity),
        }
    }
}

/// Per-call options for reads and writes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Only these tiers participate; all enabled tiers when `None`
    pub layers: Option<TierSet>,

    /// Tiers to leave out
    #[serde(default)]
    pub skip_layers: TierSet,

    /// Entry lifetime; each tier's default when `None`
    pub ttl: Option<Duration>,

    /// Eviction preference; the configured default when `None`
    pub priority: Option<Priority>,

    /// On reads, skip every tier and report a miss so the caller refetches
    #[serde(default)]
    pub force: bool,

    /// Free-form caller data, carried for logging only
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Restrict to exactly these tiers
    pub fn layers(mut self, layers: impl IntoIterator<Item = TierKind>) -> Self {
        self.layers = Some(layers.into_iter().collect());
        self
    }

    pub fn skip(mut self, tier: TierKind) -> Self {
        self.skip_layers.insert(tier);
        self
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether `tier` participates in this call
    pub fn includes(&self, tier: TierKind) -> bool {
        let listed = self
            .layers
            .as_ref()
            .map(|layers| layers.contains(&tier))
            .unwrap_or(true);
        listed && !self.skip_layers.contains(&tier)
    }
}

/// Options for invalidation calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationOptions {
    /// Tier selection, as for reads and writes
    #[serde(default)]
    pub options: CacheOptions,

    /// Tell the network intermediary as well
    pub cascade: bool,

    /// Publish a [`CacheEvent`](crate::cache::invalidation::CacheEvent)
    pub notify_components: bool,
}

impl Default for InvalidationOptions {
    fn default() -> Self {
        Self {
            options: CacheOptions::default(),
            cascade: true,
            notify_components: true,
        }
    }
}

impl InvalidationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local tiers only; the intermediary is not told
    pub fn local_only() -> Self {
        Self {
            cascade: false,
            ..Self::default()
        }
    }

    pub fn silent(mut self) -> Self {
        self.notify_components = false;
        self
    }

    pub fn with_options(mut self, options: CacheOptions) -> Self {
        self.options = options;
        self
    }

    pub fn includes(&self, tier: TierKind) -> bool {
        self.options.includes(tier)
    }
}

/// Preset configurations for common use cases
impl CoordinatorConfig {
    /// Memory-constrained hosts
    pub fn small() -> Self {
        let mut config = Self::default();
        config.volatile.max_entries = 25;
        config.durable.max_entries = 100;
        config.durable.capacity_bytes = 1024 * 1024;
        config
    }

    /// Image-heavy pages with many size variants
    pub fn large() -> Self {
        let mut config = Self::default();
        config.volatile.max_entries = 1_000;
        config.volatile.default_ttl = Duration::from_secs(15 * 60);
        config.durable.max_entries = 2_000;
        config
    }

    /// Short timers for tests; no background sweep
    pub fn testing() -> Self {
        let mut config = Self::default();
        config.volatile.enable_auto_cleanup = false;
        config.volatile.batch_delete_delay = Duration::from_millis(10);
        config.notifier.ack_timeout = Duration::from_millis(200);
        config
    }
}
