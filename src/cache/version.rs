//! Version tokens for scoped invalidation
//!
//! A token marks "everything cached before this point may be stale" for one
//! scope. Tokens render as `<scope>[:<target>]:<millis>-<seq>` and are
//! strictly increasing within a process, even when several are minted in the
//! same millisecond or the clock steps backwards.

use crate::cache::durable::StorageBackend;
use crate::clock::{to_chrono, SharedClock};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Name of the shared-settings record holding the current version
pub const VERSION_RECORD_KEY: &str = "image_cache_version";

/// Scope a version token applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "target", rename_all = "lowercase")]
pub enum VersionScope {
    Global,
    Category(String),
    Prefix(String),
}

impl VersionScope {
    /// Whether an advance at `self` also invalidates `other`.
    ///
    /// Global covers every scope; any other scope only covers itself.
    pub fn covers(&self, other: &VersionScope) -> bool {
        matches!(self, VersionScope::Global) || self == other
    }

    pub fn kind(&self) -> &'static str {
        match self {
            VersionScope::Global => "global",
            VersionScope::Category(_) => "category",
            VersionScope::Prefix(_) => "prefix",
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            VersionScope::Global => None,
            VersionScope::Category(target) | VersionScope::Prefix(target) => Some(target.as_str()),
        }
    }
}

impl fmt::Display for VersionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target() {
            Some(target) => write!(f, "{}:{}", self.kind(), target),
            None => f.write_str(self.kind()),
        }
    }
}

impl FromStr for VersionScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once(':') {
            None if s == "global" => Ok(VersionScope::Global),
            Some(("category", target)) if !target.is_empty() => {
                Ok(VersionScope::Category(target.to_string()))
            }
            Some(("prefix", target)) if !target.is_empty() => {
                Ok(VersionScope::Prefix(target.to_string()))
            }
            _ => Err(format!("unknown version scope: {}", s)),
        }
    }
}

/// Scope accepted by `update_cache_version`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "target", rename_all = "lowercase")]
pub enum InvalidationScope {
    Global,
    Category(String),
    Prefix(String),
    /// Recorded as a prefix scope on the key
    Key(String),
}

impl From<InvalidationScope> for VersionScope {
    fn from(scope: InvalidationScope) -> Self {
        match scope {
            InvalidationScope::Global => VersionScope::Global,
            InvalidationScope::Category(c) => VersionScope::Category(c),
            InvalidationScope::Prefix(p) | InvalidationScope::Key(p) => VersionScope::Prefix(p),
        }
    }
}

/// A scoped, ordered version marker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionToken {
    pub scope: VersionScope,
    pub stamp_ms: i64,
    pub seq: u32,
}

impl VersionToken {
    /// Position in the global sequence, ignoring scope
    pub fn ordinal(&self) -> (i64, u32) {
        (self.stamp_ms, self.seq)
    }

    pub fn is_newer_than(&self, other: &VersionToken) -> bool {
        self.ordinal() > other.ordinal()
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (scope, stamp) = raw.rsplit_once(':')?;
        let (millis, seq) = stamp.split_once('-')?;
        Some(Self {
            scope: scope.parse().ok()?,
            stamp_ms: millis.parse().ok()?,
            seq: seq.parse().ok()?,
        })
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.scope, self.stamp_ms, self.seq)
    }
}

impl FromStr for VersionToken {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        VersionToken::parse(s).ok_or_else(|| format!("not a version token: {}", s))
    }
}

/// Mints strictly increasing `(millis, seq)` pairs
#[derive(Debug, Default)]
struct TokenGenerator {
    last: Mutex<(i64, u32)>,
}

impl TokenGenerator {
    fn next(&self, now_ms: i64) -> (i64, u32) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        *last = if now_ms > last.0 {
            (now_ms, 0)
        } else {
            (last.0, last.1.saturating_add(1))
        };
        *last
    }

    /// Make sure later tokens sort after one minted elsewhere
    fn observe(&self, token: &VersionToken) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if token.ordinal() > *last {
            *last = token.ordinal();
        }
    }
}

/// Stored form of the current version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub value: String,
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl VersionRecord {
    pub fn from_token(token: &VersionToken, now: DateTime<Utc>) -> Self {
        Self {
            value: token.to_string(),
            scope: token.scope.kind().to_string(),
            target: token.scope.target().map(str::to_string),
            updated_at: now,
        }
    }
}

/// Shared settings store holding the current version
#[async_trait]
pub trait VersionStore: Send + Sync + fmt::Debug {
    async fn get_version(&self) -> Result<Option<VersionRecord>>;
    async fn set_version(&self, record: &VersionRecord) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryVersionStore {
    record: RwLock<Option<VersionRecord>>,
}

impl InMemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionStore for InMemoryVersionStore {
    async fn get_version(&self) -> Result<Option<VersionRecord>> {
        Ok(self.record.read().await.clone())
    }

    async fn set_version(&self, record: &VersionRecord) -> Result<()> {
        *self.record.write().await = Some(record.clone());
        Ok(())
    }
}

/// Version record kept as a blob in a [`StorageBackend`]
#[derive(Debug)]
pub struct BackendVersionStore {
    backend: Arc<dyn StorageBackend>,
}

impl BackendVersionStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl VersionStore for BackendVersionStore {
    async fn get_version(&self) -> Result<Option<VersionRecord>> {
        match self.backend.read_blob(VERSION_RECORD_KEY).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_version(&self, record: &VersionRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.backend.write_blob(VERSION_RECORD_KEY, &bytes).await
    }
}

/// Mints tokens and remembers the newest one per scope
#[derive(Debug)]
pub struct VersionManager {
    store: Option<Arc<dyn VersionStore>>,
    clock: SharedClock,
    read_cache_duration: Duration,
    /// Last known current token and when it was learned
    cached: RwLock<Option<(String, DateTime<Utc>)>>,
    ledger: RwLock<HashMap<VersionScope, VersionToken>>,
    generator: TokenGenerator,
}

impl VersionManager {
    pub fn new(
        store: Option<Arc<dyn VersionStore>>,
        clock: SharedClock,
        read_cache_duration: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            read_cache_duration,
            cached: RwLock::new(None),
            ledger: RwLock::new(HashMap::new()),
            generator: TokenGenerator::default(),
        }
    }

    /// Mint a new token for `scope` and record it as current
    pub async fn advance(&self, scope: VersionScope) -> VersionToken {
        let (stamp_ms, seq) = self.generator.next(self.clock.now().timestamp_millis());
        let token = VersionToken {
            scope: scope.clone(),
            stamp_ms,
            seq,
        };

        self.ledger.write().await.insert(scope, token.clone());
        self.remember(&token.to_string()).await;
        info!("Cache version advanced to {}", token);
        token
    }

    /// The in-process token, if learned within the read-cache window
    pub async fn cached_version(&self) -> Option<String> {
        let cached = self.cached.read().await;
        let (token, learned_at) = cached.as_ref()?;
        let fresh_until = *learned_at + to_chrono(self.read_cache_duration);
        (self.clock.now() < fresh_until).then(|| token.clone())
    }

    /// Adopt `token` as the current version (found in a slower place)
    pub async fn remember(&self, token: &str) {
        if let Some(parsed) = VersionToken::parse(token) {
            self.generator.observe(&parsed);
            let mut ledger = self.ledger.write().await;
            let newer = ledger
                .get(&parsed.scope)
                .map(|existing| parsed.is_newer_than(existing))
                .unwrap_or(true);
            if newer {
                ledger.insert(parsed.scope.clone(), parsed);
            }
        }
        *self.cached.write().await = Some((token.to_string(), self.clock.now()));
    }

    /// Read the current version from the external store
    pub async fn load_from_store(&self) -> Option<String> {
        let store = self.store.as_ref()?;
        match store.get_version().await {
            Ok(record) => record.map(|r| r.value),
            Err(e) => {
                warn!("Version store read failed: {}", e);
                None
            }
        }
    }

    /// Write `token` to the external store; failures are logged
    pub async fn persist_to_store(&self, token: &VersionToken) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        let record = VersionRecord::from_token(token, self.clock.now());
        match store.set_version(&record).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Version store write failed for {}: {}", token, e);
                false
            }
        }
    }

    /// Newest token recorded for exactly `scope`
    pub async fn latest(&self, scope: &VersionScope) -> Option<VersionToken> {
        self.ledger.read().await.get(scope).cloned()
    }

    /// Whether anything covering `scope` was advanced after `since`
    pub async fn invalidated_since(&self, scope: &VersionScope, since: &VersionToken) -> bool {
        let ledger = self.ledger.read().await;
        let stale = ledger
            .values()
            .any(|token| token.scope.covers(scope) && token.is_newer_than(since));
        debug!("invalidated_since({}, {}) = {}", scope, since, stale);
        stale
    }
}
