//! Cache entry management with TTL support

use crate::cache::types::Priority;
use crate::clock::to_chrono;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A cached value with expiry, priority and access metadata
///
/// An entry is valid while `now < expires_at`. Expiry is checked against an
/// explicit `now` so every tier can share one [`Clock`](crate::clock::Clock).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// The cached payload
    pub data: T,

    /// When the entry was written
    pub created_at: DateTime<Utc>,

    /// When the entry stops being valid
    pub expires_at: DateTime<Utc>,

    /// Last successful read (for recency tracking)
    pub last_accessed: DateTime<Utc>,

    /// Eviction preference (1 = keep longest)
    #[serde(default)]
    pub priority: Priority,

    /// Number of successful reads
    #[serde(default)]
    pub access_count: u64,
}

impl<T> CacheEntry<T> {
    /// Create a new entry expiring `ttl` after `now`
    pub fn new(data: T, ttl: Duration, priority: Priority, now: DateTime<Utc>) -> Self {
        Self {
            data,
            created_at: now,
            expires_at: expiry_after(now, ttl),
            last_accessed: now,
            priority,
            access_count: 0,
        }
    }

    /// Check if the entry is still valid at `now`
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Check if the entry has expired at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_valid(now)
    }

    /// Time remaining until expiry, `None` once expired
    pub fn time_until_expiration(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.is_expired(now) {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }

    /// Remaining TTL, used when copying an entry into another tier
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        self.time_until_expiration(now).unwrap_or(Duration::ZERO)
    }

    /// Mark the entry as accessed (updates access time and count)
    pub fn mark_accessed(&mut self, now: DateTime<Utc>) {
        self.last_accessed = now;
        self.access_count += 1;
    }

    /// Eviction ordering key: larger means evict sooner.
    ///
    /// Highest priority number first, then oldest access.
    pub fn eviction_rank(&self) -> (Priority, std::cmp::Reverse<DateTime<Utc>>) {
        (self.priority, std::cmp::Reverse(self.last_accessed))
    }

    /// Transform the payload, keeping timing metadata
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheEntry<U> {
        CacheEntry {
            data: f(self.data),
            created_at: self.created_at,
            expires_at: self.expires_at,
            last_accessed: self.last_accessed,
            priority: self.priority,
            access_count: self.access_count,
        }
    }
}

/// `now + ttl`, saturating at the latest representable instant
pub(crate) fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_chrono(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
