//! Integration tests for the cache coordinator
//!
//! These tests verify the complete cache functionality including:
//! - TTL expiration and the background sweep
//! - Priority eviction
//! - Promotion between tiers
//! - Fan-out writes with a failing tier
//! - Invalidation by key, category and prefix
//! - Version tokens and intermediary notifications

use async_trait::async_trait;
use layered_cache::cache::{
    CacheCoordinator, CacheEventKind, CacheKey, CacheOptions, CachedItem, CoordinatorConfig,
    FileBackend, ImageRecord, InMemoryQueryClient, InMemoryVersionStore, IntermediaryAction,
    IntermediaryHandle, InvalidationOptions, InvalidationScope, MemoryBackend, Priority,
    QueryCacheTier, SizeVariant, StorageBackend, TierKind, VersionScope, VolatileTier,
};
use layered_cache::cache::volatile::start_auto_cleanup;
use layered_cache::{CacheError, ManualClock, Result};
use std::sync::Arc;
use std::time::Duration;

fn record(id: &str, key: &str) -> ImageRecord {
    ImageRecord::new(id, key, format!("https://cdn.example.com/{}.webp", key))
}

fn full_coordinator(config: CoordinatorConfig, clock: &ManualClock) -> CacheCoordinator {
    CacheCoordinator::builder()
        .config(config)
        .clock(Arc::new(clock.clone()))
        .durable_backend(Arc::new(MemoryBackend::new()))
        .query_client(Arc::new(InMemoryQueryClient::new()))
        .version_store(Arc::new(InMemoryVersionStore::new()))
        .build()
}

/// Reads nothing back and refuses every write
#[derive(Debug)]
struct FailingBackend;

#[async_trait]
impl StorageBackend for FailingBackend {
    async fn read_blob(&self, _name: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
    async fn write_blob(&self, _name: &str, _bytes: &[u8]) -> Result<()> {
        Err(CacheError::Storage("read-only filesystem".to_string()))
    }
    async fn remove_blob(&self, _name: &str) -> Result<()> {
        Err(CacheError::Storage("read-only filesystem".to_string()))
    }
    async fn usage_bytes(&self) -> Result<usize> {
        Ok(0)
    }
}

#[tokio::test]
async fn test_ttl_expiration_and_sweep() {
    let clock = ManualClock::new();
    let config = CoordinatorConfig::builder()
        .default_ttl(Duration::from_secs(60))
        .ttl_jitter(0.0)
        .sweep_interval(Duration::from_millis(10))
        .build();
    let tier = Arc::new(VolatileTier::new(config.volatile, Arc::new(clock.clone())));

    let short = CacheKey::url("short", None);
    let long = CacheKey::url("long", None);
    tier.set(&short, CachedItem::Url("https://cdn/s".into()), Some(Duration::from_secs(5)), Priority::NORMAL)
        .await;
    tier.set(&long, CachedItem::Url("https://cdn/l".into()), None, Priority::NORMAL)
        .await;

    clock.advance(Duration::from_millis(4_999));
    assert!(tier.contains_key(&short).await);

    // exactly at expiry the entry is gone
    clock.advance(Duration::from_millis(1));
    assert!(!tier.contains_key(&short).await);
    assert_eq!(tier.stats().await.entries, 2);

    let sweeper = start_auto_cleanup(Arc::clone(&tier));
    tokio::time::sleep(Duration::from_millis(80)).await;
    sweeper.abort();

    let stats = tier.stats().await;
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.evictions_ttl, 1);
    assert!(tier.get(&long).await.is_some());
}

#[tokio::test]
async fn test_priority_eviction_scenario() {
    let clock = ManualClock::new();
    let config = CoordinatorConfig::builder()
        .max_entries(2)
        .enable_auto_cleanup(false)
        .build();
    let cache = CacheCoordinator::builder()
        .config(config)
        .clock(Arc::new(clock.clone()))
        .build();

    for (key, priority) in [("a", 1), ("b", 3), ("c", 2)] {
        let opts = CacheOptions::new().priority(Priority::clamped(priority));
        cache.set_image(record(key, key), &opts).await.unwrap();
        clock.advance(Duration::from_millis(10));
    }

    let opts = CacheOptions::new();
    assert!(cache.get_image("a", &opts).await.is_some());
    assert!(cache.get_image("c", &opts).await.is_some());
    assert!(cache.get_image("b", &opts).await.is_none());
    assert_eq!(cache.volatile().len().await, 2);
}

#[tokio::test]
async fn test_eviction_ties_broken_by_recency() {
    let clock = ManualClock::new();
    let config = CoordinatorConfig::builder().max_entries(3).build();
    let tier = VolatileTier::new(config.volatile, Arc::new(clock.clone()));

    for id in ["one", "two", "three"] {
        tier.set(&CacheKey::url(id, None), CachedItem::Url(format!("https://cdn/{}", id)), None, Priority::NORMAL)
            .await;
        clock.advance(Duration::from_secs(1));
    }

    // touch the oldest so "two" becomes least recently used
    assert!(tier.get(&CacheKey::url("one", None)).await.is_some());
    clock.advance(Duration::from_secs(1));

    tier.set(&CacheKey::url("four", None), CachedItem::Url("https://cdn/4".into()), None, Priority::NORMAL)
        .await;

    assert_eq!(tier.len().await, 3);
    assert!(!tier.contains_key(&CacheKey::url("two", None)).await);
    assert!(tier.contains_key(&CacheKey::url("one", None)).await);
    assert_eq!(tier.stats().await.evictions_size, 1);
}

#[tokio::test]
async fn test_durable_hit_promotes_to_volatile() {
    let clock = ManualClock::new();
    let cache = full_coordinator(CoordinatorConfig::testing(), &clock);
    let opts = CacheOptions::new();

    cache
        .set_image(record("1", "hero"), &opts.clone().layers([TierKind::Durable]))
        .await
        .unwrap();
    let durable = cache.durable().await.unwrap();
    assert!(!cache.volatile().contains_key(&CacheKey::image("hero")).await);

    assert!(cache.get_image("hero", &opts).await.is_some());
    assert_eq!(durable.stats().await.hits, 1);

    assert!(cache.get_image("hero", &opts).await.is_some());
    assert_eq!(durable.stats().await.hits, 1);
    assert_eq!(cache.volatile().stats().await.hits, 1);
}

#[tokio::test]
async fn test_fan_out_write_survives_failing_tier() {
    let clock = ManualClock::new();
    let client = Arc::new(InMemoryQueryClient::new());
    let cache = CacheCoordinator::builder()
        .config(CoordinatorConfig::testing())
        .clock(Arc::new(clock.clone()))
        .durable_backend(Arc::new(FailingBackend))
        .query_client(client.clone())
        .build();

    let key = CacheKey::url("hero", Some(SizeVariant::Medium));
    cache
        .set_item(&key, CachedItem::Url("https://cdn/m.webp".into()), &CacheOptions::new())
        .await
        .unwrap();

    // each tier read directly
    assert_eq!(
        cache.volatile().get(&key).await,
        Some(CachedItem::Url("https://cdn/m.webp".into()))
    );
    let query_cache = QueryCacheTier::new(client);
    assert_eq!(
        query_cache.get(&key).await,
        Some(CachedItem::Url("https://cdn/m.webp".into()))
    );
    let durable = cache.durable().await.unwrap();
    assert!(durable.get(&key).await.is_some());
    assert!(durable.stats().await.failures >= 1);
}

#[tokio::test]
async fn test_invalidate_item_removes_every_variant() {
    let clock = ManualClock::new();
    let cache = full_coordinator(CoordinatorConfig::testing(), &clock);
    let opts = CacheOptions::new();

    let keys = CacheKey::variants_of("hero");
    for key in &keys {
        let item = if key.namespace.holds_url() {
            CachedItem::Url(format!("https://cdn/{}", key))
        } else {
            CachedItem::Record(record("1", "hero"))
        };
        cache.set_item(key, item, &opts).await.unwrap();
    }
    cache
        .set_image(record("2", "heroic"), &opts)
        .await
        .unwrap();

    cache
        .invalidate_item("hero", &InvalidationOptions::local_only())
        .await;

    for key in &keys {
        assert!(cache.get_item(key, &opts).await.is_none(), "{} survived", key);
    }
    assert!(cache.get_image("heroic", &opts).await.is_some());

    // physical removal after the batch delay
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cache.volatile().stats().await.pending_deletes, 0);
}

#[tokio::test]
async fn test_version_tokens_increase() {
    let clock = ManualClock::new();
    let cache = full_coordinator(CoordinatorConfig::testing(), &clock);

    let mut previous = None;
    let mut last = None;
    for _ in 0..5 {
        let token = cache.update_cache_version(InvalidationScope::Global).await;
        if let Some(prev) = &previous {
            assert!(token.is_newer_than(prev));
        }
        previous = Some(token.clone());
        last = Some(token);
    }

    let last = last.unwrap();
    assert_eq!(cache.get_cache_version().await, Some(last.to_string()));
    assert_eq!(
        cache.durable().await.unwrap().global_version().await,
        Some(last.to_string())
    );
}

#[tokio::test]
async fn test_invalidated_since_respects_scope() {
    let clock = ManualClock::new();
    let cache = full_coordinator(CoordinatorConfig::testing(), &clock);

    let start = cache.update_cache_version(InvalidationScope::Global).await;
    cache
        .invalidate_category("hero", &InvalidationOptions::default())
        .await;

    let hero = VersionScope::Category("hero".to_string());
    let gallery = VersionScope::Category("gallery".to_string());
    assert!(cache.invalidated_since(&hero, &start).await);
    assert!(!cache.invalidated_since(&gallery, &start).await);
}

#[tokio::test]
async fn test_ttl_scenario_with_manual_clock() {
    let clock = ManualClock::new();
    let cache = CacheCoordinator::builder()
        .config(CoordinatorConfig::testing())
        .clock(Arc::new(clock.clone()))
        .durable_backend(Arc::new(MemoryBackend::new()))
        .build();

    let opts = CacheOptions::new()
        .priority(Priority::HIGHEST)
        .ttl(Duration::from_millis(5_000));
    cache.set_image(record("1", "hero"), &opts).await.unwrap();

    assert_eq!(
        cache.get_image("hero", &CacheOptions::new()).await,
        Some(record("1", "hero"))
    );

    clock.advance(Duration::from_millis(5_001));
    assert!(cache.get_image("hero", &CacheOptions::new()).await.is_none());
}

#[tokio::test]
async fn test_category_invalidation_clears_durable_entirely() {
    let clock = ManualClock::new();
    let cache = full_coordinator(CoordinatorConfig::testing(), &clock);
    let opts = CacheOptions::new();

    cache.set_image(record("1", "hero:main"), &opts).await.unwrap();
    cache.set_image(record("2", "hero:banner"), &opts).await.unwrap();
    cache.set_image(record("3", "gallery:beach"), &opts).await.unwrap();

    cache
        .invalidate_category("hero", &InvalidationOptions::local_only())
        .await;

    let durable = cache.durable().await.unwrap();
    assert!(durable.is_empty().await);

    let volatile = cache.volatile();
    assert!(!volatile.contains_key(&CacheKey::image("hero:main")).await);
    assert!(!volatile.contains_key(&CacheKey::image("hero:banner")).await);
    assert!(volatile.contains_key(&CacheKey::image("gallery:beach")).await);

    assert!(cache.get_image("gallery:beach", &opts).await.is_some());
}

#[tokio::test]
async fn test_prefix_invalidation() {
    let clock = ManualClock::new();
    let cache = full_coordinator(CoordinatorConfig::testing(), &clock);
    let opts = CacheOptions::new();

    for key in ["summer-1", "summer-2", "winter-1"] {
        cache
            .set_image_url(key, Some(SizeVariant::Small), format!("https://cdn/{}", key), &opts)
            .await
            .unwrap();
    }

    let removed = cache
        .invalidate_by_prefix("summer", &InvalidationOptions::local_only())
        .await;
    assert!(removed >= 4);

    assert!(cache
        .get_image_url("summer-1", Some(SizeVariant::Small), &opts)
        .await
        .is_none());
    assert!(cache
        .get_image_url("winter-1", Some(SizeVariant::Small), &opts)
        .await
        .is_some());
}

#[tokio::test]
async fn test_intermediary_receives_purges_and_versions() {
    let clock = ManualClock::new();
    let (handle, mut rx) = IntermediaryHandle::channel(16);
    let responder = tokio::spawn(async move {
        let mut actions = Vec::new();
        while let Some(envelope) = rx.recv().await {
            actions.push(envelope.message.action.clone());
            envelope.acknowledge();
        }
        actions
    });

    let cache = CacheCoordinator::builder()
        .config(CoordinatorConfig::testing())
        .clock(Arc::new(clock.clone()))
        .intermediary(handle)
        .build();
    assert!(cache.notifier().is_active().await);

    cache
        .invalidate_item("image:hero", &InvalidationOptions::default())
        .await;
    cache
        .invalidate_item("gallery", &InvalidationOptions::local_only())
        .await;
    let token = cache.update_cache_version(InvalidationScope::Global).await;
    assert!(cache.sync_with_intermediary().await);

    cache.notifier().unregister().await;
    drop(cache);
    let actions = responder.await.unwrap();

    assert_eq!(
        actions,
        vec![
            IntermediaryAction::purge_key("hero"),
            IntermediaryAction::update_version(token.to_string()),
            IntermediaryAction::update_version(token.to_string()),
        ]
    );
}

#[tokio::test]
async fn test_unresponsive_intermediary_does_not_block_invalidation() {
    let clock = ManualClock::new();
    let (handle, mut rx) = IntermediaryHandle::channel(16);
    let _silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Some(envelope) = rx.recv().await {
            held.push(envelope);
        }
    });

    let cache = full_coordinator(CoordinatorConfig::testing(), &clock);
    cache.register_intermediary(handle).await;
    cache.set_image(record("1", "hero"), &CacheOptions::new()).await.unwrap();

    let removed = tokio::time::timeout(
        Duration::from_secs(2),
        cache.invalidate_item("hero", &InvalidationOptions::default()),
    )
    .await
    .unwrap();

    assert!(removed > 0);
    assert!(cache.get_image("hero", &CacheOptions::new()).await.is_none());
}

#[tokio::test]
async fn test_events_reach_subscribers() {
    let clock = ManualClock::new();
    let cache = full_coordinator(CoordinatorConfig::testing(), &clock);
    let mut events = cache.subscribe();

    cache
        .invalidate_item("hero", &InvalidationOptions::local_only())
        .await;
    cache.update_cache_version(InvalidationScope::Category("hero".into())).await;
    cache
        .invalidate_all(&InvalidationOptions::local_only())
        .await;

    let key_event = events.recv().await.unwrap();
    assert_eq!(key_event.kind, CacheEventKind::Invalidate);
    assert_eq!(key_event.key.as_deref(), Some("hero"));

    let version_event = events.recv().await.unwrap();
    assert_eq!(version_event.kind, CacheEventKind::Update);
    assert_eq!(version_event.category.as_deref(), Some("hero"));

    let clear_event = events.recv().await.unwrap();
    assert_eq!(clear_event.kind, CacheEventKind::Clear);
}

#[tokio::test]
async fn test_file_backend_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let opts = CacheOptions::new();

    {
        let cache = CacheCoordinator::builder()
            .config(CoordinatorConfig::testing())
            .durable_dir(dir.path())
            .build();
        cache.set_image(record("1", "hero"), &opts).await.unwrap();
        cache.update_cache_version(InvalidationScope::Global).await;
    }

    let backend = FileBackend::open(dir.path()).await.unwrap();
    let cache = CacheCoordinator::builder()
        .config(CoordinatorConfig::testing())
        .durable_backend(Arc::new(backend))
        .build();

    assert_eq!(cache.get_image("hero", &opts).await, Some(record("1", "hero")));
    let version = cache.get_cache_version().await.unwrap();
    assert!(version.starts_with("global:"));
}

#[tokio::test]
async fn test_concurrent_access() {
    let clock = ManualClock::new();
    let cache = Arc::new(full_coordinator(CoordinatorConfig::large(), &clock));

    let writers = (0..20).map(|i| {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            let key = format!("img-{}", i);
            cache
                .set_image(record(&i.to_string(), &key), &CacheOptions::new())
                .await
                .unwrap();
            cache.get_image(&key, &CacheOptions::new()).await
        })
    });

    let results = futures::future::join_all(writers).await;
    assert!(results.into_iter().all(|r| matches!(r, Ok(Some(_)))));
    assert_eq!(cache.volatile().len().await, 20);
    assert_eq!(cache.durable().await.unwrap().len().await, 20);
}

#[tokio::test]
async fn test_preset_configurations() {
    assert!(CoordinatorConfig::small().validate().is_ok());
    assert!(CoordinatorConfig::large().validate().is_ok());
    assert!(CoordinatorConfig::testing().validate().is_ok());

    let small = CoordinatorConfig::small();
    let large = CoordinatorConfig::large();
    assert!(small.volatile.max_entries < large.volatile.max_entries);
    assert!(!CoordinatorConfig::testing().volatile.enable_auto_cleanup);
}

#[test]
fn test_blocking_caller() {
    let cache = CacheCoordinator::in_memory();
    let opts = CacheOptions::new();

    tokio_test::block_on(async {
        cache.set_image(record("1", "hero"), &opts).await.unwrap();
        assert_eq!(cache.get_image("hero", &opts).await, Some(record("1", "hero")));
    });
}

#[tokio::test]
async fn test_category_invalidation_keeps_bare_identifier_keys() {
    let clock = ManualClock::new();
    let cache = CacheCoordinator::builder()
        .config(CoordinatorConfig::testing())
        .clock(Arc::new(clock.clone()))
        .build();
    let opts = CacheOptions::new();

    cache.set_image(record("1", "hero"), &opts).await.unwrap();
    cache.set_image_url("hero", None, "https://cdn/hero", &opts).await.unwrap();
    cache
        .set_image_url("hero", Some(SizeVariant::Small), "https://cdn/hero-s", &opts)
        .await
        .unwrap();

    let removed = cache
        .invalidate_category("hero", &InvalidationOptions::local_only())
        .await;

    assert!(removed >= 1);
    assert!(cache.get_image("hero", &opts).await.is_some());
    assert!(cache.get_image_url("hero", None, &opts).await.is_some());
    assert!(cache
        .get_image_url("hero", Some(SizeVariant::Small), &opts)
        .await
        .is_none());
}
