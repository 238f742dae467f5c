//! In-process cache tier with TTL expiry and priority eviction

use crate::cache::{
    config::VolatileConfig,
    entry::CacheEntry,
    key::{CacheKey, KeyMatcher},
    types::{CacheStats, Priority},
    validation::CachedItem,
};
use crate::clock::SharedClock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Volatile cache tier
///
/// - Thread-safe async access via RwLock
/// - Expiry checked on read and by a periodic sweep
/// - One priority-then-recency eviction per insert at capacity
/// - Deletes are logical first and physically applied in debounced batches
pub struct VolatileTier {
    config: VolatileConfig,
    clock: SharedClock,
    store: Arc<RwLock<VolatileStore>>,
    flush_scheduled: Arc<AtomicBool>,
}

/// Internal storage
#[derive(Default)]
struct VolatileStore {
    /// Rendered key -> entry
    entries: HashMap<String, CacheEntry<CachedItem>>,

    /// Keys deleted logically but still present in `entries`
    pending_deletes: HashSet<String>,

    stats: CacheStats,
}

impl VolatileStore {
    fn is_live(&self, raw: &str) -> bool {
        self.entries.contains_key(raw) && !self.pending_deletes.contains(raw)
    }

    /// Physically remove every pending key
    fn apply_pending(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending_deletes);
        let removed = pending
            .iter()
            .filter(|key| self.entries.remove(key.as_str()).is_some())
            .count();
        self.stats.entries = self.entries.len();
        removed
    }

    /// Remove the entry with the highest priority number, oldest access first
    fn evict_one(&mut self) -> Option<String> {
        let victim = self
            .entries
            .iter()
            .max_by_key(|(_, entry)| entry.eviction_rank())
            .map(|(key, _)| key.clone())?;

        self.entries.remove(&victim);
        self.stats.evictions_size += 1;
        self.stats.entries = self.entries.len();
        Some(victim)
    }
}

impl VolatileTier {
    /// Create a new tier reading time from `clock`
    pub fn new(config: VolatileConfig, clock: SharedClock) -> Self {
        debug!(
            "Initializing volatile tier (max_entries: {}, default_ttl: {:?})",
            config.max_entries, config.default_ttl
        );

        Self {
            config,
            clock,
            store: Arc::new(RwLock::new(VolatileStore::default())),
            flush_scheduled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &VolatileConfig {
        &self.config
    }

    /// Get a value; expired entries are removed as a side effect
    pub async fn get(&self, key: &CacheKey) -> Option<CachedItem> {
        self.get_entry(key).await.map(|entry| entry.data)
    }

    /// Get the full entry (payload plus timing metadata)
    pub async fn get_entry(&self, key: &CacheKey) -> Option<CacheEntry<CachedItem>> {
        let raw = key.to_string();
        let now = self.clock.now();
        let mut guard = self.store.write().await;
        let store = &mut *guard;

        if store.pending_deletes.contains(&raw) {
            debug!("Volatile miss (pending delete): {}", raw);
            store.stats.misses += 1;
            return None;
        }

        let valid = store.entries.get(&raw).map(|entry| entry.is_valid(now));
        match valid {
            Some(true) => {
                let entry = store.entries.get_mut(&raw)?;
                entry.mark_accessed(now);
                let hit = entry.clone();
                store.stats.hits += 1;
                debug!("Volatile hit: {}", raw);
                Some(hit)
            }
            Some(false) => {
                debug!("Volatile entry expired: {}", raw);
                store.entries.remove(&raw);
                store.stats.entries = store.entries.len();
                store.stats.evictions_ttl += 1;
                store.stats.misses += 1;
                None
            }
            None => {
                debug!("Volatile miss: {}", raw);
                store.stats.misses += 1;
                None
            }
        }
    }

    /// Insert or replace a value.
    ///
    /// `ttl` of `None` uses the configured default (with jitter). A new key
    /// arriving at capacity evicts exactly one entry first.
    pub async fn set(
        &self,
        key: &CacheKey,
        data: CachedItem,
        ttl: Option<Duration>,
        priority: Priority,
    ) {
        let raw = key.to_string();
        let ttl = ttl.unwrap_or_else(|| self.config.ttl_with_jitter());
        let entry = CacheEntry::new(data, ttl, priority, self.clock.now());

        let mut guard = self.store.write().await;
        let store = &mut *guard;

        let replacing = store.is_live(&raw);
        store.pending_deletes.remove(&raw);

        if !replacing && store.entries.len() >= self.config.max_entries {
            let flushed = store.apply_pending();
            if flushed > 0 {
                debug!("Flushed {} pending deletes before insert", flushed);
            }
            if !store.entries.contains_key(&raw) && store.entries.len() >= self.config.max_entries {
                if let Some(victim) = store.evict_one() {
                    debug!("Evicted {} to make room for {}", victim, raw);
                }
            }
        }

        store.entries.insert(raw.clone(), entry);
        store.stats.writes += 1;
        store.stats.entries = store.entries.len();
        debug!("Volatile set: {} (ttl: {:?}, priority: {})", raw, ttl, priority);
    }

    /// Logically delete a key. Physical removal happens after the batch delay
    /// or on [`flush`](Self::flush). Returns whether a live entry was deleted.
    pub async fn delete(&self, key: &CacheKey) -> bool {
        let raw = key.to_string();
        let deleted = {
            let mut store = self.store.write().await;
            let live = store.is_live(&raw);
            if live {
                store.pending_deletes.insert(raw.clone());
                store.stats.invalidations += 1;
            }
            live
        };

        if deleted {
            debug!("Volatile delete queued: {}", raw);
            self.schedule_flush().await;
        }
        deleted
    }

    /// Delete every entry whose rendered key satisfies `matcher`
    pub async fn invalidate_by_matcher(&self, matcher: &KeyMatcher) -> usize {
        let mut guard = self.store.write().await;
        let store = &mut *guard;

        let matching: Vec<String> = store
            .entries
            .keys()
            .filter(|key| matcher.matches(key))
            .cloned()
            .collect();

        let mut removed = 0;
        for key in matching {
            store.entries.remove(&key);
            if !store.pending_deletes.remove(&key) {
                removed += 1;
            }
        }

        store.stats.entries = store.entries.len();
        store.stats.invalidations += removed as u64;
        debug!("Volatile invalidated {} entries matching {:?}", removed, matcher);
        removed
    }

    /// Clear all entries
    pub async fn clear(&self) -> usize {
        let mut guard = self.store.write().await;
        let store = &mut *guard;

        let count = store
            .entries
            .keys()
            .filter(|key| !store.pending_deletes.contains(*key))
            .count();
        store.entries.clear();
        store.pending_deletes.clear();
        store.stats.entries = 0;
        store.stats.invalidations += count as u64;

        info!("Cleared {} entries from volatile tier", count);
        count
    }

    /// Apply pending deletes now
    pub async fn flush(&self) -> usize {
        let removed = self.store.write().await.apply_pending();
        if removed > 0 {
            debug!("Flushed {} pending deletes", removed);
        }
        removed
    }

    /// Remove all expired entries
    pub async fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut guard = self.store.write().await;
        let store = &mut *guard;

        let before = store.entries.len();
        store.entries.retain(|_, entry| entry.is_valid(now));
        let removed = before - store.entries.len();

        if removed > 0 {
            store.pending_deletes.retain(|key| store.entries.contains_key(key));
            store.stats.evictions_ttl += removed as u64;
            store.stats.entries = store.entries.len();
            debug!("Cleaned up {} expired entries", removed);
        }
        removed
    }

    /// Whether `key` currently holds a valid entry (no stats, no side effects)
    pub async fn contains_key(&self, key: &CacheKey) -> bool {
        let raw = key.to_string();
        let now = self.clock.now();
        let store = self.store.read().await;
        store.is_live(&raw)
            && store
                .entries
                .get(&raw)
                .map(|entry| entry.is_valid(now))
                .unwrap_or(false)
    }

    /// Number of entries not pending deletion
    pub async fn len(&self) -> usize {
        let store = self.store.read().await;
        store.entries.len().saturating_sub(store.pending_deletes.len())
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Get tier statistics
    pub async fn stats(&self) -> CacheStats {
        let store = self.store.read().await;
        CacheStats {
            entries: store.entries.len(),
            pending_deletes: store.pending_deletes.len(),
            ..store.stats.clone()
        }
    }

    async fn schedule_flush(&self) {
        if self.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                self.flush_scheduled.store(false, Ordering::Release);
                let removed = self.store.write().await.apply_pending();
                debug!("No runtime for batch delete, applied {} removals inline", removed);
                return;
            }
        };

        let store = Arc::clone(&self.store);
        let scheduled = FlushScheduled(Arc::clone(&self.flush_scheduled));
        let delay = self.config.batch_delete_delay;

        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            drop(scheduled);
            let removed = store.write().await.apply_pending();
            debug!("Batch delete applied {} removals", removed);
        });
    }
}

/// Clears the scheduled flag when the flush task finishes or is dropped
struct FlushScheduled(Arc<AtomicBool>);

impl Drop for FlushScheduled {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Spawn the periodic expiry sweep for `tier`
pub fn start_auto_cleanup(tier: Arc<VolatileTier>) -> JoinHandle<()> {
    let interval = tier.config.sweep_interval;
    info!("Starting volatile sweep task (interval: {:?})", interval);

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let removed = tier.cleanup_expired().await;
            if removed > 0 {
                debug!("Auto cleanup removed {} entries", removed);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::validation::ImageRecord;
    use crate::clock::ManualClock;

    fn tier_with(max_entries: usize) -> (VolatileTier, ManualClock) {
        let clock = ManualClock::new();
        let config = VolatileConfig {
            max_entries,
            default_ttl: Duration::from_secs(60),
            batch_delete_delay: Duration::from_millis(10),
            ..Default::default()
        };
        (VolatileTier::new(config, Arc::new(clock.clone())), clock)
    }

    fn record(id: &str) -> CachedItem {
        CachedItem::Record(ImageRecord::new(id, id, format!("https://cdn/{}.png", id)))
    }

    #[tokio::test]
    async fn test_basic_set_and_get() {
        let (tier, _) = tier_with(10);
        let key = CacheKey::image("hero");

        tier.set(&key, record("hero"), None, Priority::NORMAL).await;

        assert_eq!(tier.get(&key).await, Some(record("hero")));
        let stats = tier.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.writes, 1);
    }

    #[tokio::test]
    async fn test_cache_miss() {
        let (tier, _) = tier_with(10);

        assert_eq!(tier.get(&CacheKey::image("nope")).await, None);
        assert_eq!(tier.stats().await.misses, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiration_removes_entry() {
        let (tier, clock) = tier_with(10);
        let key = CacheKey::image("hero");

        tier.set(&key, record("hero"), Some(Duration::from_millis(5000)), Priority::HIGHEST)
            .await;

        clock.advance(Duration::from_millis(4999));
        assert!(tier.get(&key).await.is_some());

        clock.advance(Duration::from_millis(1));
        assert!(tier.get(&key).await.is_none());

        let stats = tier.stats().await;
        assert_eq!(stats.evictions_ttl, 1);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn test_evicts_highest_priority_number() {
        let (tier, _) = tier_with(2);
        let (a, b, c) = (CacheKey::image("a"), CacheKey::image("b"), CacheKey::image("c"));

        tier.set(&a, record("a"), None, Priority::HIGHEST).await;
        tier.set(&b, record("b"), None, Priority::NORMAL).await;
        tier.set(&c, record("c"), None, Priority::HIGH).await;

        assert!(tier.get(&a).await.is_some());
        assert!(tier.get(&c).await.is_some());
        assert!(tier.get(&b).await.is_none());

        let stats = tier.stats().await;
        assert_eq!(stats.evictions_size, 1);
        assert_eq!(stats.entries, 2);
    }

    #[tokio::test]
    async fn test_eviction_tie_breaks_on_oldest_access() {
        let (tier, clock) = tier_with(2);
        let (a, b, c) = (CacheKey::image("a"), CacheKey::image("b"), CacheKey::image("c"));

        tier.set(&a, record("a"), None, Priority::NORMAL).await;
        clock.advance(Duration::from_secs(1));
        tier.set(&b, record("b"), None, Priority::NORMAL).await;
        clock.advance(Duration::from_secs(1));
        // touching `a` makes `b` the least recently used
        tier.get(&a).await;
        tier.set(&c, record("c"), None, Priority::NORMAL).await;

        assert!(tier.contains_key(&a).await);
        assert!(!tier.contains_key(&b).await);
        assert!(tier.contains_key(&c).await);
    }

    #[tokio::test]
    async fn test_replacing_existing_key_does_not_evict() {
        let (tier, _) = tier_with(2);
        let (a, b) = (CacheKey::image("a"), CacheKey::image("b"));

        tier.set(&a, record("a"), None, Priority::LOWEST).await;
        tier.set(&b, record("b"), None, Priority::LOWEST).await;
        tier.set(&a, record("a"), None, Priority::HIGHEST).await;

        assert_eq!(tier.len().await, 2);
        assert_eq!(tier.stats().await.evictions_size, 0);
    }

    #[tokio::test]
    async fn test_delete_is_visible_before_flush() {
        let (tier, _) = tier_with(10);
        let key = CacheKey::image("hero");
        tier.set(&key, record("hero"), None, Priority::NORMAL).await;

        assert!(tier.delete(&key).await);
        assert!(tier.get(&key).await.is_none());
        assert!(!tier.delete(&key).await);

        let stats = tier.stats().await;
        assert_eq!(stats.pending_deletes, 1);

        assert_eq!(tier.flush().await, 1);
        let stats = tier.stats().await;
        assert_eq!(stats.pending_deletes, 0);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn test_batched_delete_applies_on_timer() {
        let (tier, _) = tier_with(10);
        for id in ["a", "b", "c"] {
            tier.set(&CacheKey::image(id), record(id), None, Priority::NORMAL).await;
        }
        for id in ["a", "b"] {
            tier.delete(&CacheKey::image(id)).await;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = tier.stats().await;
        assert_eq!(stats.pending_deletes, 0);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_delete_without_runtime_applies_inline() {
        let (tier, _) = tier_with(10);
        let key = CacheKey::image("hero");

        futures::executor::block_on(async {
            tier.set(&key, record("hero"), None, Priority::NORMAL).await;
            assert!(tier.delete(&key).await);

            let stats = tier.stats().await;
            assert_eq!(stats.pending_deletes, 0);
            assert_eq!(stats.entries, 0);
        });
    }

    #[test]
    fn test_flush_rescheduled_after_runtime_shutdown() {
        let (tier, _) = tier_with(10);
        let first = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        first.block_on(async {
            tier.set(&CacheKey::image("a"), record("a"), None, Priority::NORMAL).await;
            tier.set(&CacheKey::image("b"), record("b"), None, Priority::NORMAL).await;
            tier.delete(&CacheKey::image("a")).await;
        });
        // pending flush task is dropped with the runtime
        drop(first);

        let second = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        second.block_on(async {
            tier.delete(&CacheKey::image("b")).await;
            tokio::time::sleep(Duration::from_millis(50)).await;

            let stats = tier.stats().await;
            assert_eq!(stats.pending_deletes, 0);
            assert_eq!(stats.entries, 0);
        });
    }

    #[tokio::test]
    async fn test_set_after_delete_resurrects_key() {
        let (tier, _) = tier_with(10);
        let key = CacheKey::image("hero");
        tier.set(&key, record("hero"), None, Priority::NORMAL).await;
        tier.delete(&key).await;

        tier.set(&key, record("hero"), None, Priority::NORMAL).await;
        tier.flush().await;

        assert!(tier.get(&key).await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_by_matcher() {
        let (tier, _) = tier_with(10);
        for key in [
            CacheKey::image("hero:main"),
            CacheKey::url("hero:main", None),
            CacheKey::image("gallery:sunset"),
        ] {
            let item = if key.namespace.holds_url() {
                CachedItem::Url("https://cdn/x.png".to_string())
            } else {
                record(&key.id)
            };
            tier.set(&key, item, None, Priority::NORMAL).await;
        }

        let removed = tier
            .invalidate_by_matcher(&KeyMatcher::Category("hero".to_string()))
            .await;

        assert_eq!(removed, 2);
        assert_eq!(tier.len().await, 1);
        assert!(tier.contains_key(&CacheKey::image("gallery:sunset")).await);
    }

    #[tokio::test]
    async fn test_clear() {
        let (tier, _) = tier_with(10);
        tier.set(&CacheKey::image("a"), record("a"), None, Priority::NORMAL).await;
        tier.set(&CacheKey::image("b"), record("b"), None, Priority::NORMAL).await;

        assert_eq!(tier.clear().await, 2);
        assert!(tier.is_empty().await);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let (tier, clock) = tier_with(10);
        tier.set(&CacheKey::image("short"), record("short"), Some(Duration::from_secs(1)), Priority::NORMAL)
            .await;
        tier.set(&CacheKey::image("long"), record("long"), Some(Duration::from_secs(120)), Priority::NORMAL)
            .await;

        clock.advance(Duration::from_secs(2));

        assert_eq!(tier.cleanup_expired().await, 1);
        assert_eq!(tier.len().await, 1);
        assert_eq!(tier.stats().await.evictions_ttl, 1);
    }

    #[tokio::test]
    async fn test_auto_cleanup_task() {
        let clock = ManualClock::new();
        let config = VolatileConfig {
            sweep_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let tier = Arc::new(VolatileTier::new(config, Arc::new(clock.clone())));
        tier.set(&CacheKey::image("a"), record("a"), Some(Duration::from_secs(1)), Priority::NORMAL)
            .await;
        clock.advance(Duration::from_secs(5));

        let handle = start_auto_cleanup(Arc::clone(&tier));
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.abort();

        assert_eq!(tier.stats().await.entries, 0);
    }
}
