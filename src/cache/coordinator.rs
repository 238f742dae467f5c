//! Cache coordinator: one façade over every tier
//!
//! Reads probe Volatile, then Durable, then the query cache, and copy a hit
//! into every faster tier before returning it. Writes and invalidations fan
//! out to all selected tiers concurrently; one tier failing never stops the
//! others. Only a value that fails shape validation is reported back to the
//! caller.

use crate::cache::{
    config::{CacheOptions, CoordinatorConfig, InvalidationOptions},
    durable::{DurableTier, FileBackend, StorageBackend},
    invalidation::{CacheEvent, EventBus},
    key::{CacheKey, KeyMatcher, SizeVariant},
    notifier::{IntermediaryAction, IntermediaryHandle, Notifier},
    query_cache::{QueryCacheTier, QueryClient},
    types::{CoordinatorStats, TierKind},
    validation::{validate_item, validate_value, CachedItem, ImageRecord, Validation},
    version::{InvalidationScope, VersionManager, VersionScope, VersionStore, VersionToken},
    volatile::{start_auto_cleanup, VolatileTier},
};
use crate::clock::{SharedClock, SystemClock};
use crate::error::{CacheError, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where the durable tier stores its snapshot
#[derive(Debug, Clone)]
enum DurableSource {
    Disabled,
    Backend(Arc<dyn StorageBackend>),
    Directory(PathBuf),
}

/// Multi-tier cache coordinator
pub struct CacheCoordinator {
    config: CoordinatorConfig,
    clock: SharedClock,
    volatile: Arc<VolatileTier>,
    durable_source: DurableSource,
    /// Created on first use; `None` inside means the tier failed to start
    durable: OnceCell<Option<Arc<DurableTier>>>,
    query_cache: Option<Arc<QueryCacheTier>>,
    notifier: Notifier,
    versions: VersionManager,
    events: EventBus,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CacheCoordinator {
    pub fn builder() -> CacheCoordinatorBuilder {
        CacheCoordinatorBuilder::default()
    }

    /// Volatile-only coordinator with default settings
    pub fn in_memory() -> Self {
        Self::builder().build()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn volatile(&self) -> &Arc<VolatileTier> {
        &self.volatile
    }

    /// The durable tier, initializing it on first call
    pub async fn durable(&self) -> Option<Arc<DurableTier>> {
        self.durable
            .get_or_init(|| async {
                let backend: Arc<dyn StorageBackend> = match &self.durable_source {
                    DurableSource::Disabled => return None,
                    DurableSource::Backend(backend) => Arc::clone(backend),
                    DurableSource::Directory(dir) => match FileBackend::open(dir).await {
                        Ok(backend) => Arc::new(backend),
                        Err(e) => {
                            warn!("Durable tier disabled, cannot open {}: {}", dir.display(), e);
                            return None;
                        }
                    },
                };
                info!("Durable tier initialized at '{}'", self.config.durable.namespace);
                Some(Arc::new(DurableTier::new(
                    self.config.durable.clone(),
                    backend,
                    Arc::clone(&self.clock),
                )))
            })
            .await
            .clone()
    }

    pub fn query_cache(&self) -> Option<&Arc<QueryCacheTier>> {
        self.query_cache.as_ref()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn versions(&self) -> &VersionManager {
        &self.versions
    }

    /// Attach (or replace) the background intermediary
    pub async fn register_intermediary(&self, handle: IntermediaryHandle) {
        self.notifier.register(handle).await;
    }

    /// Look up `key`, fastest tier first, backfilling faster tiers on a hit
    pub async fn get_item(&self, key: &CacheKey, opts: &CacheOptions) -> Option<CachedItem> {
        if opts.force {
            debug!("Forced miss for {}", key);
            return None;
        }

        if opts.includes(TierKind::Volatile) {
            if let Some(item) = self.volatile.get(key).await {
                return Some(item);
            }
        }

        if opts.includes(TierKind::Durable) {
            if let Some(durable) = self.durable().await {
                if let Some(entry) = durable.get(key).await {
                    if opts.includes(TierKind::Volatile) {
                        let ttl = entry.remaining_ttl(self.clock.now());
                        self.volatile
                            .set(key, entry.data.clone(), Some(ttl), entry.priority)
                            .await;
                        debug!("Promoted {} from durable tier", key);
                    }
                    return Some(entry.data);
                }
            }
        }

        if opts.includes(TierKind::QueryCache) {
            if let Some(query_cache) = &self.query_cache {
                if let Some(item) = query_cache.get(key).await {
                    let priority = opts.priority.unwrap_or(self.config.default_priority);
                    let durable = if opts.includes(TierKind::Durable) {
                        self.durable().await
                    } else {
                        None
                    };

                    let to_volatile = async {
                        if opts.includes(TierKind::Volatile) {
                            self.volatile.set(key, item.clone(), opts.ttl, priority).await;
                        }
                    };
                    let to_durable = async {
                        if let Some(durable) = &durable {
                            durable.set(key, item.clone(), opts.ttl, priority).await;
                        }
                    };
                    futures::join!(to_volatile, to_durable);

                    debug!("Promoted {} from query cache", key);
                    return Some(item);
                }
            }
        }

        debug!("Cache miss on every tier: {}", key);
        None
    }

    /// Write to every selected tier. Fails only for values that do not fit
    /// the key's namespace.
    pub async fn set_item(&self, key: &CacheKey, item: CachedItem, opts: &CacheOptions) -> Result<()> {
        if let Validation::Invalid(reason) = validate_item(key, &item) {
            warn!("Rejected write to {}: {}", key, reason);
            return Err(CacheError::MalformedValue(format!("{}: {}", key, reason)));
        }

        let priority = opts.priority.unwrap_or(self.config.default_priority);
        let durable = if opts.includes(TierKind::Durable) {
            self.durable().await
        } else {
            None
        };

        let to_volatile = async {
            if opts.includes(TierKind::Volatile) {
                self.volatile.set(key, item.clone(), opts.ttl, priority).await;
            }
        };
        let to_durable = async {
            if let Some(durable) = &durable {
                durable.set(key, item.clone(), opts.ttl, priority).await;
            }
        };
        let to_query_cache = async {
            if opts.includes(TierKind::QueryCache) {
                if let Some(query_cache) = &self.query_cache {
                    query_cache.set(key, &item).await;
                }
            }
        };
        futures::join!(to_volatile, to_durable, to_query_cache);

        if !opts.metadata.is_empty() {
            debug!("Stored {} with metadata {:?}", key, opts.metadata);
        }
        Ok(())
    }

    /// Like [`set_item`](Self::set_item) for untyped input
    pub async fn set_value(&self, key: &CacheKey, value: &Value, opts: &CacheOptions) -> Result<()> {
        match validate_value(key, value) {
            Validation::Valid(item) => self.set_item(key, item, opts).await,
            Validation::Invalid(reason) => {
                warn!("Rejected write to {}: {}", key, reason);
                Err(CacheError::MalformedValue(format!("{}: {}", key, reason)))
            }
        }
    }

    /// Remove an identifier and every key derived from it.
    ///
    /// `identifier` may be a bare id or any rendered key; the id is what
    /// counts. Returns the number of entries removed across tiers.
    pub async fn invalidate_item(&self, identifier: &str, opts: &InvalidationOptions) -> usize {
        let id = CacheKey::parse(identifier)
            .map(|key| key.id)
            .unwrap_or_else(|| identifier.to_string());
        let keys = CacheKey::variants_of(&id);
        let durable = self.selected_durable(opts).await;

        let from_volatile = async {
            if !opts.includes(TierKind::Volatile) {
                return 0;
            }
            let mut removed = 0;
            for key in &keys {
                if self.volatile.delete(key).await {
                    removed += 1;
                }
            }
            removed
        };
        let from_durable = async {
            match &durable {
                Some(durable) => durable.delete_many(&keys).await,
                None => 0,
            }
        };
        let from_query_cache = async {
            let mut removed = 0;
            if let Some(query_cache) = self.selected_query_cache(opts) {
                for key in &keys {
                    removed += query_cache.invalidate(key).await;
                }
            }
            removed
        };
        let (v, d, q) = futures::join!(from_volatile, from_durable, from_query_cache);
        debug!("Invalidated {} (volatile: {}, durable: {}, query: {})", id, v, d, q);

        if opts.cascade {
            self.notifier.notify(IntermediaryAction::purge_key(id.as_str())).await;
        }
        if opts.notify_components {
            self.events
                .publish(CacheEvent::key_invalidated(id.as_str(), self.clock.now()));
        }
        v + d + q
    }

    /// Remove every key in `category`.
    ///
    /// The durable tier keeps no key index, so it is cleared entirely.
    pub async fn invalidate_category(&self, category: &str, opts: &InvalidationOptions) -> usize {
        let matcher = KeyMatcher::Category(category.to_string());
        let durable = self.selected_durable(opts).await;

        let from_volatile = async {
            if opts.includes(TierKind::Volatile) {
                self.volatile.invalidate_by_matcher(&matcher).await
            } else {
                0
            }
        };
        let from_durable = async { self.clear_durable_for_pattern(durable.as_deref()).await };
        let from_query_cache = async {
            match self.selected_query_cache(opts) {
                Some(query_cache) => query_cache.invalidate_category(category).await,
                None => 0,
            }
        };
        let (v, d, q) = futures::join!(from_volatile, from_durable, from_query_cache);
        info!(
            "Invalidated category '{}' (volatile: {}, durable: {}, query: {})",
            category, v, d, q
        );

        if opts.cascade {
            self.advance_version(VersionScope::Category(category.to_string()), true)
                .await;
        }
        if opts.notify_components {
            self.events
                .publish(CacheEvent::category_invalidated(category, self.clock.now()));
        }
        v + d + q
    }

    /// Remove every key whose identifier starts with `prefix`.
    ///
    /// The durable tier keeps no key index, so it is cleared entirely.
    pub async fn invalidate_by_prefix(&self, prefix: &str, opts: &InvalidationOptions) -> usize {
        let matcher = KeyMatcher::Prefix(prefix.to_string());
        let durable = self.selected_durable(opts).await;

        let from_volatile = async {
            if opts.includes(TierKind::Volatile) {
                self.volatile.invalidate_by_matcher(&matcher).await
            } else {
                0
            }
        };
        let from_durable = async { self.clear_durable_for_pattern(durable.as_deref()).await };
        let from_query_cache = async {
            match self.selected_query_cache(opts) {
                Some(query_cache) => query_cache.invalidate_by_matcher(&matcher).await,
                None => 0,
            }
        };
        let (v, d, q) = futures::join!(from_volatile, from_durable, from_query_cache);
        info!(
            "Invalidated prefix '{}' (volatile: {}, durable: {}, query: {})",
            prefix, v, d, q
        );

        if opts.cascade {
            self.advance_version(VersionScope::Prefix(prefix.to_string()), true)
                .await;
        }
        if opts.notify_components {
            self.events
                .publish(CacheEvent::prefix_invalidated(prefix, self.clock.now()));
        }
        v + d + q
    }

    /// Clear every selected tier and advance the global version
    pub async fn invalidate_all(&self, opts: &InvalidationOptions) -> usize {
        let durable = self.selected_durable(opts).await;

        let from_volatile = async {
            if opts.includes(TierKind::Volatile) {
                self.volatile.clear().await
            } else {
                0
            }
        };
        let from_durable = async {
            match &durable {
                Some(durable) => durable.clear().await,
                None => 0,
            }
        };
        let from_query_cache = async {
            match self.selected_query_cache(opts) {
                Some(query_cache) => query_cache.clear().await,
                None => 0,
            }
        };
        let (v, d, q) = futures::join!(from_volatile, from_durable, from_query_cache);
        info!(
            "Cleared all tiers (volatile: {}, durable: {}, query: {})",
            v, d, q
        );

        self.advance_version(VersionScope::Global, opts.cascade).await;
        if opts.cascade {
            self.notifier.notify(IntermediaryAction::purge_all()).await;
        }
        if opts.notify_components {
            self.events.publish(CacheEvent::cleared(self.clock.now()));
        }
        v + d + q
    }

    /// Advance the version token at `scope` and tell everyone who keeps one
    pub async fn update_cache_version(&self, scope: InvalidationScope) -> VersionToken {
        let token = self.advance_version(scope.into(), true).await;
        self.events
            .publish(CacheEvent::version_updated(&token, self.clock.now()));
        token
    }

    /// Current version: in-process copy, then durable metadata, then the
    /// version store. Values found lower are copied upward.
    pub async fn get_cache_version(&self) -> Option<String> {
        if let Some(version) = self.versions.cached_version().await {
            return Some(version);
        }

        let durable = self.durable().await;
        if let Some(durable) = &durable {
            if let Some(version) = durable.global_version().await {
                self.versions.remember(&version).await;
                return Some(version);
            }
        }

        let version = self.versions.load_from_store().await?;
        self.versions.remember(&version).await;
        if let Some(durable) = &durable {
            durable.update_global_version(&version).await;
        }
        Some(version)
    }

    /// Whether anything covering `scope` was invalidated after `since`
    pub async fn invalidated_since(&self, scope: &VersionScope, since: &VersionToken) -> bool {
        self.versions.invalidated_since(scope, since).await
    }

    /// Push the current version to the intermediary without purging
    pub async fn sync_with_intermediary(&self) -> bool {
        match self.get_cache_version().await {
            Some(version) => {
                self.notifier
                    .notify(IntermediaryAction::update_version(version))
                    .await
            }
            None => {
                debug!("No cache version to sync");
                false
            }
        }
    }

    /// Receive invalidation and version events
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Per-tier statistics snapshot
    pub async fn stats(&self) -> CoordinatorStats {
        let durable = match self.durable.get() {
            Some(Some(durable)) => Some(durable.stats().await),
            _ => None,
        };
        let query_cache = match &self.query_cache {
            Some(query_cache) => Some(query_cache.stats().await),
            None => None,
        };

        CoordinatorStats {
            volatile: Some(self.volatile.stats().await),
            durable,
            query_cache,
        }
    }

    /// Apply pending deletes now
    pub async fn flush(&self) -> usize {
        self.volatile.flush().await
    }

    /// Start the periodic expiry sweep (once)
    pub fn start_maintenance(&self) {
        if !self.config.volatile.enable_auto_cleanup {
            debug!("Auto cleanup disabled, not starting sweep");
            return;
        }

        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        *sweeper = Some(start_auto_cleanup(Arc::clone(&self.volatile)));
    }

    /// Stop background work and apply pending deletes
    pub async fn shutdown(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }

        let flushed = self.flush().await;
        info!("Cache coordinator shut down ({} pending deletes applied)", flushed);
    }

    /// Structured image record for `id`
    pub async fn get_image(&self, id: &str, opts: &CacheOptions) -> Option<ImageRecord> {
        self.get_item(&CacheKey::image(id), opts)
            .await
            .and_then(CachedItem::into_record)
    }

    /// Cache a record under its own `key`
    pub async fn set_image(&self, record: ImageRecord, opts: &CacheOptions) -> Result<()> {
        let key = CacheKey::image(record.key.as_str());
        self.set_item(&key, CachedItem::Record(record), opts).await
    }

    pub async fn get_image_url(
        &self,
        id: &str,
        size: Option<SizeVariant>,
        opts: &CacheOptions,
    ) -> Option<String> {
        self.get_item(&CacheKey::url(id, size), opts)
            .await
            .and_then(CachedItem::into_url)
    }

    pub async fn set_image_url(
        &self,
        id: &str,
        size: Option<SizeVariant>,
        url: impl Into<String>,
        opts: &CacheOptions,
    ) -> Result<()> {
        self.set_item(&CacheKey::url(id, size), CachedItem::Url(url.into()), opts)
            .await
    }

    async fn advance_version(&self, scope: VersionScope, notify: bool) -> VersionToken {
        let token = self.versions.advance(scope).await;
        let rendered = token.to_string();

        let to_store = self.versions.persist_to_store(&token);
        let to_durable = async {
            if let Some(durable) = self.durable().await {
                durable.update_global_version(&rendered).await;
            }
        };
        futures::join!(to_store, to_durable);

        if notify {
            self.notifier
                .notify(IntermediaryAction::update_version(rendered))
                .await;
        }
        token
    }

    async fn selected_durable(&self, opts: &InvalidationOptions) -> Option<Arc<DurableTier>> {
        if opts.includes(TierKind::Durable) {
            self.durable().await
        } else {
            None
        }
    }

    fn selected_query_cache(&self, opts: &InvalidationOptions) -> Option<&Arc<QueryCacheTier>> {
        if opts.includes(TierKind::QueryCache) {
            self.query_cache.as_ref()
        } else {
            None
        }
    }

    async fn clear_durable_for_pattern(&self, durable: Option<&DurableTier>) -> usize {
        match durable {
            Some(durable) if !DurableTier::SUPPORTS_PATTERNS => {
                debug!("Durable tier has no key index, clearing it");
                durable.clear().await
            }
            _ => 0,
        }
    }
}

impl Drop for CacheCoordinator {
    fn drop(&mut self) {
        let handle = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

/// Builder for [`CacheCoordinator`]
#[derive(Default)]
pub struct CacheCoordinatorBuilder {
    config: Option<CoordinatorConfig>,
    clock: Option<SharedClock>,
    durable: Option<DurableSource>,
    query_client: Option<Arc<dyn QueryClient>>,
    version_store: Option<Arc<dyn VersionStore>>,
    intermediary: Option<IntermediaryHandle>,
}

impl CacheCoordinatorBuilder {
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Time source shared by every tier
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Persist the durable tier through `backend`
    pub fn durable_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.durable = Some(DurableSource::Backend(backend));
        self
    }

    /// Persist the durable tier as files under `dir`, opened on first use
    pub fn durable_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.durable = Some(DurableSource::Directory(dir.into()));
        self
    }

    pub fn query_client(mut self, client: Arc<dyn QueryClient>) -> Self {
        self.query_client = Some(client);
        self
    }

    pub fn version_store(mut self, store: Arc<dyn VersionStore>) -> Self {
        self.version_store = Some(store);
        self
    }

    pub fn intermediary(mut self, handle: IntermediaryHandle) -> Self {
        self.intermediary = Some(handle);
        self
    }

    pub fn build(self) -> CacheCoordinator {
        let config = self.config.unwrap_or_default();
        if let Err(reason) = config.validate() {
            warn!("Coordinator config is invalid ({}), continuing anyway", reason);
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let durable_source = match self.durable {
            Some(source) if config.durable.enabled => source,
            _ => DurableSource::Disabled,
        };
        let has_intermediary = self.intermediary.is_some();
        let notifier = match self.intermediary {
            Some(handle) => Notifier::with_handle(config.notifier.ack_timeout, handle),
            None => Notifier::new(config.notifier.ack_timeout),
        };

        info!(
            "Building cache coordinator (durable: {}, query cache: {}, intermediary: {})",
            !matches!(durable_source, DurableSource::Disabled),
            self.query_client.is_some(),
            has_intermediary
        );

        CacheCoordinator {
            volatile: Arc::new(VolatileTier::new(config.volatile.clone(), Arc::clone(&clock))),
            durable_source,
            durable: OnceCell::new(),
            query_cache: self
                .query_client
                .map(|client| Arc::new(QueryCacheTier::new(client))),
            notifier,
            versions: VersionManager::new(
                self.version_store,
                Arc::clone(&clock),
                config.versions.read_cache_duration,
            ),
            events: EventBus::new(config.event_capacity),
            sweeper: Mutex::new(None),
            clock,
            config,
        }
    }
}
