//! Persistent snapshot tier
//!
//! The whole tier is one JSON document stored under the configured namespace:
//! a metadata record (`schema_version`, `last_updated`, `global_version`) plus
//! every entry. The document is loaded on first use, mutated in memory, and
//! written back after each change. Storage problems never reach the caller;
//! they are logged and counted in [`CacheStats::failures`].

use crate::cache::{
    config::DurableConfig,
    entry::CacheEntry,
    key::{CacheKey, Namespace},
    types::{CacheStats, Priority},
    validation::{validate_value, CachedItem},
};
use crate::clock::SharedClock;
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Blob storage the durable tier persists into
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Read a blob, `None` if it does not exist
    async fn read_blob(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Create or replace a blob
    async fn write_blob(&self, name: &str, bytes: &[u8]) -> Result<()>;

    /// Remove a blob; removing a missing blob is not an error
    async fn remove_blob(&self, name: &str) -> Result<()>;

    /// Approximate bytes in use across all blobs
    async fn usage_bytes(&self) -> Result<usize>;
}

/// In-memory backend with an optional quota
#[derive(Debug, Default)]
pub struct MemoryBackend {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    quota_bytes: Option<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes that would push total usage past `quota_bytes`
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn read_blob(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(name).cloned())
    }

    async fn write_blob(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.write().await;

        if let Some(quota) = self.quota_bytes {
            let current: usize = blobs.values().map(Vec::len).sum();
            let replaced = blobs.get(name).map(Vec::len).unwrap_or(0);
            if current - replaced + bytes.len() > quota {
                return Err(CacheError::unavailable(
                    "durable",
                    format!("storage quota of {} bytes exceeded", quota),
                ));
            }
        }

        blobs.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn remove_blob(&self, name: &str) -> Result<()> {
        self.blobs.write().await.remove(name);
        Ok(())
    }

    async fn usage_bytes(&self) -> Result<usize> {
        Ok(self.blobs.read().await.values().map(Vec::len).sum())
    }
}

/// One file per blob under a directory
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Use `dir`, creating it if needed
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        debug!("File backend rooted at {}", dir.display());
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        let file_name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn read_blob(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_blob(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(name);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove_blob(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn usage_bytes(&self) -> Result<usize> {
        let mut total = 0usize;
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let meta = item.metadata().await?;
            if meta.is_file() {
                total += meta.len() as usize;
            }
        }
        Ok(total)
    }
}

/// Metadata stored alongside the durable snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierMetadata {
    pub schema_version: u32,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_version: Option<String>,
}

impl TierMetadata {
    fn fresh(schema_version: u32, now: DateTime<Utc>) -> Self {
        Self {
            schema_version,
            last_updated: now,
            global_version: None,
        }
    }
}

struct Snapshot {
    metadata: TierMetadata,
    entries: HashMap<String, CacheEntry<CachedItem>>,
}

#[derive(Default)]
struct DurableState {
    /// `None` until the snapshot has been read from storage
    snapshot: Option<Snapshot>,

    /// Size of the blob as last written, for usage accounting
    written_bytes: usize,

    stats: CacheStats,
}

/// Size-bounded persistent cache tier
pub struct DurableTier {
    config: DurableConfig,
    clock: SharedClock,
    backend: Arc<dyn StorageBackend>,
    state: Mutex<DurableState>,
}

impl DurableTier {
    /// Durable tier cannot match key patterns; callers fall back to `clear`
    pub const SUPPORTS_PATTERNS: bool = false;

    pub fn new(config: DurableConfig, backend: Arc<dyn StorageBackend>, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            backend,
            state: Mutex::new(DurableState::default()),
        }
    }

    pub fn config(&self) -> &DurableConfig {
        &self.config
    }

    /// Get an entry, dropping it if expired
    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry<CachedItem>> {
        let raw = key.to_string();
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let snapshot = self.loaded(&mut state).await;

        let valid = snapshot.entries.get(&raw).map(|entry| entry.is_valid(now));
        match valid {
            Some(true) => {
                let entry = snapshot.entries.get_mut(&raw)?;
                entry.mark_accessed(now);
                let hit = entry.clone();
                state.stats.hits += 1;
                debug!("Durable hit: {}", raw);
                Some(hit)
            }
            Some(false) => {
                debug!("Durable entry expired: {}", raw);
                snapshot.entries.remove(&raw);
                state.stats.evictions_ttl += 1;
                state.stats.misses += 1;
                self.persist(&mut state).await;
                None
            }
            None => {
                state.stats.misses += 1;
                debug!("Durable miss: {}", raw);
                None
            }
        }
    }

    /// Store a value. `ttl` of `None` uses the per-namespace default.
    pub async fn set(
        &self,
        key: &CacheKey,
        data: CachedItem,
        ttl: Option<Duration>,
        priority: Priority,
    ) {
        let raw = key.to_string();
        let ttl = ttl.unwrap_or(match key.namespace {
            Namespace::Image => self.config.record_ttl,
            _ => self.config.url_ttl,
        });
        let now = self.clock.now();

        let mut state = self.state.lock().await;
        let snapshot = self.loaded(&mut state).await;

        let expired = remove_expired(snapshot, now);
        state.stats.evictions_ttl += expired as u64;

        let snapshot = self.loaded(&mut state).await;
        if !snapshot.entries.contains_key(&raw) && snapshot.entries.len() >= self.config.max_entries {
            let pruned = prune(snapshot, self.config.prune_fraction);
            info!("Durable tier at {} entries, pruned {}", self.config.max_entries, pruned);
            state.stats.evictions_size += pruned as u64;
        }

        let snapshot = self.loaded(&mut state).await;
        snapshot
            .entries
            .insert(raw.clone(), CacheEntry::new(data, ttl, priority, now));
        state.stats.writes += 1;
        debug!("Durable set: {} (ttl: {:?})", raw, ttl);

        self.persist(&mut state).await;
    }

    /// Remove one key
    pub async fn delete(&self, key: &CacheKey) -> bool {
        self.delete_many(std::slice::from_ref(key)).await > 0
    }

    /// Remove several keys with a single write
    pub async fn delete_many(&self, keys: &[CacheKey]) -> usize {
        let mut state = self.state.lock().await;
        let snapshot = self.loaded(&mut state).await;

        let removed = keys
            .iter()
            .filter(|key| snapshot.entries.remove(&key.to_string()).is_some())
            .count();

        if removed > 0 {
            state.stats.invalidations += removed as u64;
            self.persist(&mut state).await;
        }
        removed
    }

    /// Remove every entry. Metadata, including the global version, is kept.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let snapshot = self.loaded(&mut state).await;

        let count = snapshot.entries.len();
        snapshot.entries.clear();
        state.stats.invalidations += count as u64;
        self.persist(&mut state).await;

        info!("Cleared {} entries from durable tier", count);
        count
    }

    /// Drop expired entries and persist if anything changed
    pub async fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let snapshot = self.loaded(&mut state).await;

        let removed = remove_expired(snapshot, now);
        if removed > 0 {
            state.stats.evictions_ttl += removed as u64;
            self.persist(&mut state).await;
        }
        removed
    }

    /// Record the current global version token in metadata
    pub async fn update_global_version(&self, token: &str) {
        let mut state = self.state.lock().await;
        let snapshot = self.loaded(&mut state).await;

        if snapshot.metadata.global_version.as_deref() == Some(token) {
            return;
        }
        snapshot.metadata.global_version = Some(token.to_string());
        debug!("Durable global version set to {}", token);
        self.persist(&mut state).await;
    }

    pub async fn global_version(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        self.loaded(&mut state).await.metadata.global_version.clone()
    }

    pub async fn metadata(&self) -> TierMetadata {
        let mut state = self.state.lock().await;
        self.loaded(&mut state).await.metadata.clone()
    }

    /// Whether `key` holds a valid entry (no stats, no side effects)
    pub async fn contains_key(&self, key: &CacheKey) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        self.loaded(&mut state)
            .await
            .entries
            .get(&key.to_string())
            .map(|entry| entry.is_valid(now))
            .unwrap_or(false)
    }

    pub async fn len(&self) -> usize {
        let mut state = self.state.lock().await;
        self.loaded(&mut state).await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Forget the in-memory copy so the next call re-reads storage
    pub async fn reload(&self) {
        self.state.lock().await.snapshot = None;
    }

    /// Get tier statistics
    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            entries: state.snapshot.as_ref().map(|s| s.entries.len()).unwrap_or(0),
            ..state.stats.clone()
        }
    }

    /// The loaded snapshot, reading it from storage on first use
    async fn loaded<'a>(&self, state: &'a mut DurableState) -> &'a mut Snapshot {
        if state.snapshot.is_none() {
            let (snapshot, stored_bytes) = self.load(&mut state.stats).await;
            state.written_bytes = stored_bytes;
            state.snapshot = Some(snapshot);
        }
        state.snapshot.get_or_insert_with(|| Snapshot {
            metadata: TierMetadata::fresh(self.config.schema_version, self.clock.now()),
            entries: HashMap::new(),
        })
    }

    /// Read the snapshot plus the size of our blob still held by the backend
    async fn load(&self, stats: &mut CacheStats) -> (Snapshot, usize) {
        let now = self.clock.now();
        let empty = || Snapshot {
            metadata: TierMetadata::fresh(self.config.schema_version, now),
            entries: HashMap::new(),
        };

        let bytes = match self.backend.read_blob(&self.config.namespace).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("No durable snapshot at '{}', starting empty", self.config.namespace);
                return (empty(), 0);
            }
            Err(e) => {
                warn!("Durable tier unavailable, starting empty: {}", e);
                stats.failures += 1;
                return (empty(), 0);
            }
        };

        match decode(&bytes, self.config.schema_version) {
            Ok((snapshot, dropped)) => {
                if dropped > 0 {
                    warn!("Dropped {} malformed durable entries", dropped);
                }
                info!(
                    "Loaded durable snapshot with {} entries from '{}'",
                    snapshot.entries.len(),
                    self.config.namespace
                );
                (snapshot, bytes.len())
            }
            Err(CacheError::SchemaVersionMismatch { expected, found }) => {
                info!(
                    "Durable schema changed ({} -> {}), discarding snapshot",
                    found, expected
                );
                match self.backend.remove_blob(&self.config.namespace).await {
                    Ok(()) => (empty(), 0),
                    Err(e) => {
                        warn!("Failed to remove stale durable snapshot: {}", e);
                        stats.failures += 1;
                        (empty(), bytes.len())
                    }
                }
            }
            Err(e) => {
                error!("Durable snapshot is corrupt, discarding: {}", e);
                stats.failures += 1;
                (empty(), bytes.len())
            }
        }
    }

    /// Write the snapshot back, pruning when it would exceed the usage threshold
    async fn persist(&self, state: &mut DurableState) {
        let threshold = self.config.prune_threshold_bytes();
        let other_usage = match self.backend.usage_bytes().await {
            Ok(total) => total.saturating_sub(state.written_bytes),
            Err(e) => {
                debug!("Could not measure storage usage: {}", e);
                0
            }
        };

        let Some(snapshot) = state.snapshot.as_mut() else {
            return;
        };
        snapshot.metadata.last_updated = self.clock.now();

        let mut bytes = match encode(snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to serialize durable snapshot: {}", e);
                state.stats.failures += 1;
                return;
            }
        };

        if other_usage >= threshold {
            // pruning our own entries cannot bring usage back under the threshold
            warn!(
                "Other stored data uses {} bytes, over the {} byte threshold; writing without pruning",
                other_usage, threshold
            );
        }

        while other_usage < threshold
            && other_usage + bytes.len() > threshold
            && !snapshot.entries.is_empty()
        {
            let pruned = prune(snapshot, self.config.prune_fraction);
            state.stats.evictions_size += pruned as u64;
            info!(
                "Durable usage {} bytes over {} byte threshold, pruned {} entries",
                other_usage + bytes.len(),
                threshold,
                pruned
            );
            bytes = match encode(snapshot) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to serialize durable snapshot: {}", e);
                    state.stats.failures += 1;
                    return;
                }
            };
        }

        let mut result = self.backend.write_blob(&self.config.namespace, &bytes).await;
        if let Err(e @ CacheError::TierUnavailable { .. }) = &result {
            warn!("Durable write rejected, pruning and retrying once: {}", e);
            if !snapshot.entries.is_empty() {
                state.stats.evictions_size += prune(snapshot, self.config.prune_fraction) as u64;
                if let Ok(retry) = encode(snapshot) {
                    bytes = retry;
                }
            }
            result = self.backend.write_blob(&self.config.namespace, &bytes).await;
        }

        match result {
            Ok(()) => state.written_bytes = bytes.len(),
            Err(e) => {
                warn!("Durable write failed, continuing without persistence: {}", e);
                state.stats.failures += 1;
            }
        }
    }
}

fn remove_expired(snapshot: &mut Snapshot, now: DateTime<Utc>) -> usize {
    let before = snapshot.entries.len();
    snapshot.entries.retain(|_, entry| entry.is_valid(now));
    before - snapshot.entries.len()
}

/// Remove `fraction` of the entries (at least one), worst-ranked first
fn prune(snapshot: &mut Snapshot, fraction: f64) -> usize {
    let count = ((snapshot.entries.len() as f64 * fraction).ceil() as usize)
        .max(1)
        .min(snapshot.entries.len());

    let mut ranked: Vec<(String, _)> = snapshot
        .entries
        .iter()
        .map(|(key, entry)| (key.clone(), entry.eviction_rank()))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));

    for (key, _) in ranked.into_iter().take(count) {
        snapshot.entries.remove(&key);
    }
    count
}

fn encode(snapshot: &Snapshot) -> Result<Vec<u8>> {
    let mut entries = serde_json::Map::new();
    for (key, entry) in &snapshot.entries {
        let data = match &entry.data {
            CachedItem::Record(record) => serde_json::to_value(record)?,
            CachedItem::Url(url) => Value::String(url.clone()),
        };
        let stored = entry.clone().map(|_| data);
        entries.insert(key.clone(), serde_json::to_value(&stored)?);
    }

    let mut doc = serde_json::Map::new();
    doc.insert("metadata".to_string(), serde_json::to_value(&snapshot.metadata)?);
    doc.insert("entries".to_string(), Value::Object(entries));
    Ok(serde_json::to_vec(&Value::Object(doc))?)
}

/// Parse a stored document. Entries that fail validation are dropped and
/// counted rather than failing the whole load.
fn decode(bytes: &[u8], expected_schema: u32) -> Result<(Snapshot, usize)> {
    let doc: Value = serde_json::from_slice(bytes)?;

    let metadata = doc
        .get("metadata")
        .cloned()
        .ok_or_else(|| CacheError::MalformedValue("snapshot has no metadata".to_string()))?;
    let metadata: TierMetadata = serde_json::from_value(metadata)?;

    if metadata.schema_version != expected_schema {
        return Err(CacheError::SchemaVersionMismatch {
            expected: expected_schema,
            found: metadata.schema_version,
        });
    }

    let mut entries = HashMap::new();
    let mut dropped = 0;
    if let Some(raw_entries) = doc.get("entries").and_then(Value::as_object) {
        for (raw_key, raw_entry) in raw_entries {
            match decode_entry(raw_key, raw_entry) {
                Ok(entry) => {
                    entries.insert(raw_key.clone(), entry);
                }
                Err(reason) => {
                    debug!("Skipping durable entry {}: {}", raw_key, reason);
                    dropped += 1;
                }
            }
        }
    }

    Ok((Snapshot { metadata, entries }, dropped))
}

fn decode_entry(raw_key: &str, raw_entry: &Value) -> std::result::Result<CacheEntry<CachedItem>, String> {
    let key = CacheKey::parse(raw_key).ok_or_else(|| format!("unrecognised key '{}'", raw_key))?;
    let entry: CacheEntry<Value> =
        serde_json::from_value(raw_entry.clone()).map_err(|e| e.to_string())?;
    let item = validate_value(&key, &entry.data).into_result()?;
    Ok(entry.map(|_| item))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::validation::ImageRecord;
    use crate::clock::ManualClock;

    fn config() -> DurableConfig {
        DurableConfig {
            namespace: "cache:test".to_string(),
            ..Default::default()
        }
    }

    fn tier(backend: Arc<dyn StorageBackend>, config: DurableConfig) -> (DurableTier, ManualClock) {
        let clock = ManualClock::new();
        (DurableTier::new(config, backend, Arc::new(clock.clone())), clock)
    }

    fn record(id: &str) -> CachedItem {
        CachedItem::Record(ImageRecord::new(id, id, format!("https://cdn/{}.png", id)))
    }

    #[derive(Debug)]
    struct BrokenBackend;

    #[async_trait]
    impl StorageBackend for BrokenBackend {
        async fn read_blob(&self, _name: &str) -> Result<Option<Vec<u8>>> {
            Err(CacheError::Storage("disk gone".to_string()))
        }
        async fn write_blob(&self, _name: &str, _bytes: &[u8]) -> Result<()> {
            Err(CacheError::Storage("disk gone".to_string()))
        }
        async fn remove_blob(&self, _name: &str) -> Result<()> {
            Err(CacheError::Storage("disk gone".to_string()))
        }
        async fn usage_bytes(&self) -> Result<usize> {
            Err(CacheError::Storage("disk gone".to_string()))
        }
    }

    #[tokio::test]
    async fn test_set_get_and_persistence_across_instances() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let (first, _) = tier(Arc::clone(&backend), config());
        let key = CacheKey::url("hero", None);

        first
            .set(&key, CachedItem::Url("https://cdn/hero.png".to_string()), None, Priority::NORMAL)
            .await;

        let (second, _) = tier(backend, config());
        let entry = second.get(&key).await.unwrap();
        assert_eq!(entry.data.as_url(), Some("https://cdn/hero.png"));
        assert_eq!(second.stats().await.hits, 1);
    }

    #[tokio::test]
    async fn test_default_ttl_depends_on_namespace() {
        let (tier, clock) = tier(Arc::new(MemoryBackend::new()), config());
        let image = CacheKey::image("hero");
        let url = CacheKey::url("hero", None);

        tier.set(&image, record("hero"), None, Priority::NORMAL).await;
        tier.set(&url, CachedItem::Url("u".to_string()), None, Priority::NORMAL).await;

        clock.advance(Duration::from_secs(20 * 60));
        assert!(tier.get(&image).await.is_none());
        assert!(tier.get(&url).await.is_some());
    }

    #[tokio::test]
    async fn test_schema_mismatch_discards_snapshot() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let (old, _) = tier(Arc::clone(&backend), config());
        old.set(&CacheKey::image("hero"), record("hero"), None, Priority::NORMAL).await;
        old.update_global_version("global:1-0").await;

        let newer = DurableConfig {
            schema_version: 2,
            ..config()
        };
        let (current, _) = tier(Arc::clone(&backend), newer);

        assert!(current.get(&CacheKey::image("hero")).await.is_none());
        assert_eq!(current.global_version().await, None);
        assert_eq!(current.metadata().await.schema_version, 2);
        assert!(backend.read_blob("cache:test").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_entries_are_dropped_on_load() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let now = Utc::now();
        let later = now + chrono::Duration::hours(1);
        let doc = serde_json::json!({
            "metadata": {"schema_version": 1, "last_updated": now},
            "entries": {
                "image:good": {"data": {"id": "1", "key": "good", "url": "u"},
                               "created_at": now, "expires_at": later, "last_accessed": now},
                "image:bad": {"data": {"id": "2", "key": "bad"},
                              "created_at": now, "expires_at": later, "last_accessed": now},
                "session:foreign": {"data": "x",
                              "created_at": now, "expires_at": later, "last_accessed": now}
            }
        });
        backend
            .write_blob("cache:test", &serde_json::to_vec(&doc).unwrap())
            .await
            .unwrap();

        let tier = DurableTier::new(config(), backend, Arc::new(ManualClock::starting_at(now)));

        assert_eq!(tier.len().await, 1);
        assert!(tier.get(&CacheKey::image("good")).await.is_some());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_starts_empty() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        backend.write_blob("cache:test", b"{not json").await.unwrap();
        let (tier, _) = tier(backend, config());

        assert!(tier.is_empty().await);
        assert_eq!(tier.stats().await.failures, 1);
    }

    #[tokio::test]
    async fn test_prunes_quarter_at_entry_ceiling() {
        let cfg = DurableConfig {
            max_entries: 4,
            ..config()
        };
        let (tier, clock) = tier(Arc::new(MemoryBackend::new()), cfg);

        tier.set(&CacheKey::image("keep"), record("keep"), None, Priority::HIGHEST).await;
        for id in ["a", "b", "c"] {
            clock.advance(Duration::from_secs(1));
            tier.set(&CacheKey::image(id), record(id), None, Priority::LOWEST).await;
        }
        tier.set(&CacheKey::image("new"), record("new"), None, Priority::NORMAL).await;

        assert_eq!(tier.len().await, 4);
        assert!(tier.contains_key(&CacheKey::image("keep")).await);
        // oldest lowest-priority entry goes first
        assert!(!tier.contains_key(&CacheKey::image("a")).await);
        assert_eq!(tier.stats().await.evictions_size, 1);
    }

    #[tokio::test]
    async fn test_prunes_when_over_usage_threshold() {
        let cfg = DurableConfig {
            capacity_bytes: 2_000,
            ..config()
        };
        let (tier, _) = tier(Arc::new(MemoryBackend::new()), cfg);

        for i in 0..40 {
            let id = format!("img-{}", i);
            tier.set(&CacheKey::image(id.clone()), record(&id), None, Priority::NORMAL).await;
        }

        assert!(tier.len().await < 40);
        assert!(tier.stats().await.evictions_size > 0);
        assert_eq!(tier.stats().await.failures, 0);
    }

    #[tokio::test]
    async fn test_reopened_tier_does_not_count_own_snapshot_as_foreign() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let cfg = DurableConfig {
            capacity_bytes: 10_000,
            ..config()
        };

        let (first, _) = tier(Arc::clone(&backend), cfg.clone());
        for i in 0..20 {
            let id = format!("img-{}", i);
            first.set(&CacheKey::image(id.clone()), record(&id), None, Priority::NORMAL).await;
        }
        assert_eq!(first.len().await, 20);
        assert_eq!(first.stats().await.evictions_size, 0);

        let (second, _) = tier(backend, cfg);
        second.set(&CacheKey::image("new"), record("new"), None, Priority::NORMAL).await;

        assert_eq!(second.len().await, 21);
        assert_eq!(second.stats().await.evictions_size, 0);
    }

    #[tokio::test]
    async fn test_foreign_data_over_threshold_does_not_empty_tier() {
        let backend = Arc::new(MemoryBackend::new());
        backend.write_blob("other-app", &vec![0u8; 3_000]).await.unwrap();
        let cfg = DurableConfig {
            capacity_bytes: 2_000,
            ..config()
        };
        let (tier, _) = tier(backend, cfg);

        for id in ["a", "b", "c"] {
            tier.set(&CacheKey::image(id), record(id), None, Priority::NORMAL).await;
        }

        assert_eq!(tier.len().await, 3);
        assert_eq!(tier.stats().await.evictions_size, 0);
    }

    #[tokio::test]
    async fn test_broken_backend_degrades_silently() {
        let (tier, _) = tier(Arc::new(BrokenBackend), config());
        let key = CacheKey::image("hero");

        tier.set(&key, record("hero"), None, Priority::NORMAL).await;
        tier.update_global_version("global:1-0").await;

        // memory copy still serves the process
        assert!(tier.get(&key).await.is_some());
        assert!(tier.stats().await.failures >= 2);
    }

    #[tokio::test]
    async fn test_delete_many_and_clear_keep_version() {
        let (tier, _) = tier(Arc::new(MemoryBackend::new()), config());
        for id in ["a", "b", "c"] {
            tier.set(&CacheKey::image(id), record(id), None, Priority::NORMAL).await;
        }
        tier.update_global_version("global:5-0").await;

        let removed = tier
            .delete_many(&[CacheKey::image("a"), CacheKey::image("zzz")])
            .await;
        assert_eq!(removed, 1);

        assert_eq!(tier.clear().await, 2);
        assert_eq!(tier.global_version().await.as_deref(), Some("global:5-0"));
    }

    #[tokio::test]
    async fn test_update_global_version_is_idempotent() {
        let (tier, _) = tier(Arc::new(MemoryBackend::new()), config());
        tier.update_global_version("global:1-0").await;
        tier.update_global_version("global:1-0").await;
        tier.reload().await;

        assert_eq!(tier.global_version().await.as_deref(), Some("global:1-0"));
    }

    #[tokio::test]
    async fn test_memory_backend_quota() {
        let backend = MemoryBackend::with_quota(10);
        assert!(backend.write_blob("a", b"12345").await.is_ok());
        assert!(backend.write_blob("a", b"1234567890").await.is_ok());
        assert!(backend.write_blob("b", b"1").await.is_err());
        assert_eq!(backend.usage_bytes().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_file_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();

        assert!(backend.read_blob("cache:durable").await.unwrap().is_none());
        backend.write_blob("cache:durable", b"{}").await.unwrap();
        assert_eq!(backend.read_blob("cache:durable").await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(backend.usage_bytes().await.unwrap(), 2);

        backend.remove_blob("cache:durable").await.unwrap();
        backend.remove_blob("cache:durable").await.unwrap();
        assert!(backend.read_blob("cache:durable").await.unwrap().is_none());
    }
}
