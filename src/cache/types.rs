//! Core type definitions for the cache system

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Eviction preference, 1 (keep longest) ..= 5 (evict first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(1);
    pub const HIGH: Priority = Priority(2);
    pub const NORMAL: Priority = Priority(3);
    pub const LOW: Priority = Priority(4);
    pub const LOWEST: Priority = Priority(5);

    /// Build a priority, rejecting values outside 1..=5
    pub fn new(value: u8) -> Option<Self> {
        (1..=5).contains(&value).then_some(Priority(value))
    }

    /// Build a priority, clamping into 1..=5
    pub fn clamped(value: u8) -> Self {
        Priority(value.clamp(1, 5))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value).ok_or_else(|| format!("priority must be 1..=5, got {}", value))
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Statistics and metrics for a single tier
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Total number of cache hits
    pub hits: u64,

    /// Total number of cache misses
    pub misses: u64,

    /// Number of entries currently in the tier
    pub entries: usize,

    /// Number of writes accepted
    pub writes: u64,

    /// Number of evictions due to capacity pressure
    pub evictions_size: u64,

    /// Number of evictions due to TTL expiration
    pub evictions_ttl: u64,

    /// Number of explicit invalidations
    pub invalidations: u64,

    /// Deletes accepted but not yet physically applied
    pub pending_deletes: usize,

    /// Operations that failed and were absorbed
    pub failures: u64,
}

impl CacheStats {
    /// Calculate cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Total number of probes (hits + misses)
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    /// Calculate total evictions
    pub fn total_evictions(&self) -> u64 {
        self.evictions_size + self.evictions_ttl
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, entries: {}, evictions: {}, pending_deletes: {} }}",
            self.hits,
            self.misses,
            self.hit_rate(),
            self.entries,
            self.total_evictions(),
            self.pending_deletes
        )
    }
}

/// Storage tier participating in the cache, in probe order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    /// In-process map with per-entry expiry
    Volatile,

    /// Size-bounded persistent snapshot
    Durable,

    /// External request-deduplicating query cache
    QueryCache,

    /// Out-of-process network intermediary (notify only)
    Intermediary,
}

impl TierKind {
    /// Data tiers in read order (fastest first)
    pub const READ_ORDER: [TierKind; 3] =
        [TierKind::Volatile, TierKind::Durable, TierKind::QueryCache];

    pub fn as_str(&self) -> &'static str {
        match self {
            TierKind::Volatile => "volatile",
            TierKind::Durable => "durable",
            TierKind::QueryCache => "query_cache",
            TierKind::Intermediary => "intermediary",
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TierKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "volatile" | "memory" => Ok(TierKind::Volatile),
            "durable" | "local_storage" | "localStorage" => Ok(TierKind::Durable),
            "query_cache" | "reactQuery" => Ok(TierKind::QueryCache),
            "intermediary" | "serviceWorker" => Ok(TierKind::Intermediary),
            other => Err(format!("unknown tier: {}", other)),
        }
    }
}

/// A set of tiers, used by per-call options
pub type TierSet = HashSet<TierKind>;

/// Per-tier statistics snapshot returned by the coordinator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub volatile: Option<CacheStats>,
    pub durable: Option<CacheStats>,
    pub query_cache: Option<CacheStats>,
}
