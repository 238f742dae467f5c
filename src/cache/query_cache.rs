//! Adapter over an external request-deduplicating query cache
//!
//! The coordinator only ever peeks at data already resident in the client.
//! It never triggers a fetch, and everything read back is shape-checked
//! because other code populates the same client.

use crate::cache::{
    key::{CacheKey, KeyMatcher, Namespace, PlaceholderKind, SizeVariant},
    types::CacheStats,
    validation::{validate_value, CachedItem, Validation},
};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Query key as an ordered list of segments
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &[String]) -> bool {
        self.0.starts_with(prefix)
    }

    /// `["image", id]`, `["imageUrl", id, size?]` or `["placeholder", kind, id]`
    pub fn for_cache_key(key: &CacheKey) -> Self {
        match key.namespace {
            Namespace::Image => QueryKey::new(["image", key.id.as_str()]),
            Namespace::Url => {
                let mut segments = vec!["imageUrl".to_string(), key.id.clone()];
                if let Some(size) = key.variant {
                    segments.push(size.as_str().to_string());
                }
                QueryKey(segments)
            }
            Namespace::Placeholder(kind) => {
                QueryKey::new(["placeholder", kind.as_str(), key.id.as_str()])
            }
        }
    }

    /// List query for one category: `["images", "category", c]`
    pub fn category_list(category: &str) -> Self {
        QueryKey::new(["images", "category", category])
    }

    /// Inverse of [`for_cache_key`](Self::for_cache_key)
    pub fn to_cache_key(&self) -> Option<CacheKey> {
        match self.0.as_slice() {
            [ns, id] if ns == "image" => Some(CacheKey::image(id.as_str())),
            [ns, id] if ns == "imageUrl" => Some(CacheKey::url(id.as_str(), None)),
            [ns, id, size] if ns == "imageUrl" => {
                let size = size.parse::<SizeVariant>().ok()?;
                Some(CacheKey::url(id.as_str(), Some(size)))
            }
            [ns, kind, id] if ns == "placeholder" => {
                let kind = kind.parse::<PlaceholderKind>().ok()?;
                Some(CacheKey::placeholder(kind, id.as_str()))
            }
            _ => None,
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Which queries an invalidation applies to
#[derive(Clone)]
pub enum QueryFilter {
    Exact(QueryKey),
    Prefix(Vec<String>),
    Predicate(Arc<dyn Fn(&QueryKey) -> bool + Send + Sync>),
}

impl QueryFilter {
    pub fn predicate(f: impl Fn(&QueryKey) -> bool + Send + Sync + 'static) -> Self {
        QueryFilter::Predicate(Arc::new(f))
    }

    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            QueryFilter::Exact(exact) => exact == key,
            QueryFilter::Prefix(prefix) => key.starts_with(prefix),
            QueryFilter::Predicate(f) => f(key),
        }
    }
}

impl fmt::Debug for QueryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryFilter::Exact(key) => write!(f, "Exact({})", key),
            QueryFilter::Prefix(prefix) => write!(f, "Prefix({:?})", prefix),
            QueryFilter::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// The subset of a query-cache library the coordinator relies on
#[async_trait]
pub trait QueryClient: Send + Sync + fmt::Debug {
    /// Data already resident for `key`; must not fetch
    async fn get_query_data(&self, key: &QueryKey) -> Result<Option<Value>>;

    async fn set_query_data(&self, key: &QueryKey, value: Value) -> Result<()>;

    /// Drop matching queries, returning how many were dropped
    async fn invalidate_queries(&self, filter: &QueryFilter) -> Result<usize>;
}

/// Map-backed query client
#[derive(Debug, Default)]
pub struct InMemoryQueryClient {
    data: RwLock<HashMap<QueryKey, Value>>,
}

impl InMemoryQueryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl QueryClient for InMemoryQueryClient {
    async fn get_query_data(&self, key: &QueryKey) -> Result<Option<Value>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set_query_data(&self, key: &QueryKey, value: Value) -> Result<()> {
        self.data.write().await.insert(key.clone(), value);
        Ok(())
    }

    async fn invalidate_queries(&self, filter: &QueryFilter) -> Result<usize> {
        let mut data = self.data.write().await;
        let before = data.len();
        data.retain(|key, _| !filter.matches(key));
        Ok(before - data.len())
    }
}

/// Query-cache tier
pub struct QueryCacheTier {
    client: Arc<dyn QueryClient>,
    stats: Mutex<CacheStats>,
}

impl QueryCacheTier {
    pub fn new(client: Arc<dyn QueryClient>) -> Self {
        Self {
            client,
            stats: Mutex::new(CacheStats::default()),
        }
    }

    pub fn client(&self) -> &Arc<dyn QueryClient> {
        &self.client
    }

    /// Peek at resident data, rejecting anything of the wrong shape
    pub async fn get(&self, key: &CacheKey) -> Option<CachedItem> {
        let query_key = QueryKey::for_cache_key(key);

        let raw = match self.client.get_query_data(&query_key).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Query cache read failed for {}: {}", query_key, e);
                let mut stats = self.stats.lock().await;
                stats.failures += 1;
                stats.misses += 1;
                return None;
            }
        };

        let mut stats = self.stats.lock().await;
        match raw.map(|value| validate_value(key, &value)) {
            Some(Validation::Valid(item)) => {
                stats.hits += 1;
                debug!("Query cache hit: {}", query_key);
                Some(item)
            }
            Some(Validation::Invalid(reason)) => {
                warn!("Ignoring malformed query cache value at {}: {}", query_key, reason);
                stats.misses += 1;
                None
            }
            None => {
                stats.misses += 1;
                debug!("Query cache miss: {}", query_key);
                None
            }
        }
    }

    /// Store a value in the shape readers of the client expect
    pub async fn set(&self, key: &CacheKey, item: &CachedItem) -> bool {
        let query_key = QueryKey::for_cache_key(key);
        let value = match item {
            CachedItem::Record(record) => match serde_json::to_value(record) {
                Ok(value) => value,
                Err(e) => {
                    warn!("Failed to encode record for {}: {}", query_key, e);
                    self.stats.lock().await.failures += 1;
                    return false;
                }
            },
            CachedItem::Url(url) => json!({
                "url": url,
                "key": key.id,
                "size": key.variant.map(|s| s.as_str()),
            }),
        };

        match self.client.set_query_data(&query_key, value).await {
            Ok(()) => {
                self.stats.lock().await.writes += 1;
                true
            }
            Err(e) => {
                warn!("Query cache write failed for {}: {}", query_key, e);
                self.stats.lock().await.failures += 1;
                false
            }
        }
    }

    /// Invalidate exactly one key
    pub async fn invalidate(&self, key: &CacheKey) -> usize {
        self.invalidate_filter(&QueryFilter::Exact(QueryKey::for_cache_key(key)))
            .await
    }

    /// Invalidate every query whose equivalent cache key satisfies `matcher`
    pub async fn invalidate_by_matcher(&self, matcher: &KeyMatcher) -> usize {
        let matcher = matcher.clone();
        let filter = QueryFilter::predicate(move |query_key| {
            query_key
                .to_cache_key()
                .map(|key| matcher.matches(&key.to_string()))
                .unwrap_or(false)
        });
        self.invalidate_filter(&filter).await
    }

    /// Item queries in the category plus the category's list query
    pub async fn invalidate_category(&self, category: &str) -> usize {
        let items = self
            .invalidate_by_matcher(&KeyMatcher::Category(category.to_string()))
            .await;
        let lists = self
            .invalidate_filter(&QueryFilter::Exact(QueryKey::category_list(category)))
            .await;
        items + lists
    }

    /// Drop every query this tier understands
    pub async fn clear(&self) -> usize {
        self.invalidate_filter(&QueryFilter::predicate(|key| {
            key.to_cache_key().is_some()
                || key.segments().first().map(String::as_str) == Some("images")
        }))
        .await
    }

    pub async fn invalidate_filter(&self, filter: &QueryFilter) -> usize {
        match self.client.invalidate_queries(filter).await {
            Ok(count) => {
                self.stats.lock().await.invalidations += count as u64;
                debug!("Query cache invalidated {} queries ({:?})", count, filter);
                count
            }
            Err(e) => {
                warn!("Query cache invalidation failed ({:?}): {}", filter, e);
                self.stats.lock().await.failures += 1;
                0
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        self.stats.lock().await.clone()
    }
}
