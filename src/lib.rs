//! # Layered Cache (layered-cache)
//!
//! Multi-tier cache coordination for image metadata and delivery URLs.
//!
//! ## Features
//!
//! - Fastest-first reads with promotion into faster tiers
//! - Concurrent fan-out writes; one failing tier never blocks the rest
//! - Per-key, per-category, per-prefix and global invalidation
//! - Monotonic version tokens shared through a pluggable version store
//! - Acknowledged purge/re-version messages to a background intermediary
//! - Async-first design using tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use layered_cache::{CacheCoordinator, CacheOptions, CoordinatorConfig, InMemoryQueryClient};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     layered_cache::logging::init_tracing("info");
//!
//!     let cache = CacheCoordinator::builder()
//!         .config(CoordinatorConfig::from_env()?)
//!         .durable_dir("/var/cache/images")
//!         .query_client(Arc::new(InMemoryQueryClient::new()))
//!         .build();
//!     cache.start_maintenance();
//!
//!     cache
//!         .set_image_url("hero", None, "https://cdn.example.com/hero.webp", &CacheOptions::new())
//!         .await?;
//!     let url = cache.get_image_url("hero", None, &CacheOptions::new()).await;
//!     println!("URL: {:?}", url);
//!
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Intermediary
//!
//! A background process receives [`cache::Envelope`]s and must acknowledge
//! each one within the configured timeout.
//!
//! ```no_run
//! use layered_cache::{CacheCoordinator, IntermediaryHandle, InvalidationOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (handle, mut rx) = IntermediaryHandle::channel(16);
//!     tokio::spawn(async move {
//!         while let Some(envelope) = rx.recv().await {
//!             println!("purging: {}", envelope.message.action);
//!             envelope.acknowledge();
//!         }
//!     });
//!
//!     let cache = CacheCoordinator::builder().intermediary(handle).build();
//!     cache.invalidate_item("hero", &InvalidationOptions::default()).await;
//! }
//! ```

pub mod cache;
pub mod clock;
pub mod error;
pub mod logging;

// Re-export main types for convenience
pub use cache::{
    CacheCoordinator, CacheCoordinatorBuilder, CacheEvent, CacheKey, CacheOptions, CacheStats,
    CachedItem, CoordinatorConfig, CoordinatorStats, FileBackend, ImageRecord,
    InMemoryQueryClient, InMemoryVersionStore, IntermediaryAction, IntermediaryHandle,
    InvalidationOptions, InvalidationScope, MemoryBackend, Priority, SizeVariant, TierKind,
    VersionScope, VersionToken,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{CacheError, Result};
