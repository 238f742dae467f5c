//! # Layered Image Cache
//!
//! A coordinator over several cache tiers of decreasing speed:
//!
//! - **Volatile**: in-process map with TTL, priority eviction and batched deletes
//! - **Durable**: persisted snapshot that survives restarts (memory, files, or a custom backend)
//! - **Query cache**: the data-fetching layer's own cache, reached through [`QueryClient`]
//! - **Intermediary**: an out-of-process network cache that can only be told to purge
//!
//! Reads go fastest-first and promote hits into faster tiers. Writes and
//! invalidations fan out to every selected tier. Wide invalidations advance
//! a [`VersionToken`] so other processes can tell their copies are stale.
//!
//! ## Example
//!
//! ```rust
//! use layered_cache::cache::{CacheCoordinator, CacheOptions, ImageRecord, InvalidationOptions};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cache = CacheCoordinator::in_memory();
//!
//! let record = ImageRecord::new("42", "hero", "https://cdn.example.com/hero.webp")
//!     .with_category("landing");
//! cache
//!     .set_image(record, &CacheOptions::new().ttl(Duration::from_secs(600)))
//!     .await?;
//!
//! if let Some(record) = cache.get_image("hero", &CacheOptions::new()).await {
//!     println!("Cache hit: {}", record.url);
//! }
//!
//! cache
//!     .invalidate_category("landing", &InvalidationOptions::local_only())
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod durable;
pub mod entry;
pub mod invalidation;
pub mod key;
pub mod notifier;
pub mod query_cache;
pub mod types;
pub mod validation;
pub mod version;
pub mod volatile;

pub use config::{
    CacheOptions, CoordinatorConfig, CoordinatorConfigBuilder, DurableConfig,
    InvalidationOptions, NotifierConfig, VersionConfig, VolatileConfig,
};
pub use coordinator::{CacheCoordinator, CacheCoordinatorBuilder};
pub use durable::{DurableTier, FileBackend, MemoryBackend, StorageBackend, TierMetadata};
pub use entry::CacheEntry;
pub use invalidation::{CacheEvent, CacheEventKind, EventBus, EventScope};
pub use key::{CacheKey, CacheKeyBuilder, KeyMatcher, Namespace, PlaceholderKind, SizeVariant};
pub use notifier::{Ack, AckStatus, Envelope, IntermediaryAction, IntermediaryHandle, Notifier};
pub use query_cache::{InMemoryQueryClient, QueryCacheTier, QueryClient, QueryFilter, QueryKey};
pub use types::{CacheStats, CoordinatorStats, Priority, TierKind, TierSet};
pub use validation::{CachedItem, ImageRecord, Validation};
pub use version::{
    BackendVersionStore, InMemoryVersionStore, InvalidationScope, VersionManager, VersionScope,
    VersionStore, VersionToken,
};
pub use volatile::VolatileTier;
