// Integration tests for the ResourceLoadCoordinator.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout, Instant};

use common::{clip, FailingStore};
use tile_stream_engine::config::LoadConfig;
use tile_stream_engine::engine::coordinator::{AcquireError, ResourceLoadCoordinator};
use tile_stream_engine::source::memory_store::MemoryHandleStore;
use tile_stream_engine::source::traits::LocalHandleStore;

fn load_config(max_concurrent_loads: usize, cache_capacity: usize, stagger_ms: u64) -> LoadConfig {
    LoadConfig {
        max_concurrent_loads,
        cache_capacity,
        stagger_ms,
    }
}

fn store_with(keys: &[&str], latency: Duration) -> Arc<MemoryHandleStore> {
    let store = MemoryHandleStore::new().with_latency(latency);
    for key in keys {
        store.insert(key, clip(key));
    }
    Arc::new(store)
}

#[tokio::test(start_paused = true)]
async fn test_ten_tiles_never_exceed_two_loads() {
    let keys: Vec<String> = (1..=10).map(|i| i.to_string()).collect();
    let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
    let store = store_with(&refs, Duration::from_millis(100));
    let coordinator = ResourceLoadCoordinator::init(&load_config(2, 5, 500), store.clone());

    let mut tasks = Vec::new();
    for key in &keys {
        let coordinator = Arc::clone(&coordinator);
        let key = key.clone();
        tasks.push(tokio::spawn(async move { coordinator.acquire(&key).await }));
    }

    let mut leases = Vec::new();
    for task in tasks {
        leases.push(task.await.unwrap().expect("every tile eventually loads"));
    }

    let stats = coordinator.stats();
    assert_eq!(stats.peak_active_loads, 2);
    assert_eq!(stats.loads_started, 10);
    assert_eq!(stats.requests_queued, 8);
    assert_eq!(store.reads(), 10);
    assert!(coordinator.cached_len() <= 5);

    drop(leases);
    assert_eq!(coordinator.active_loads(), 0);
    assert!(coordinator.cached_len() <= 5);
}

#[tokio::test(start_paused = true)]
async fn test_freed_slot_is_handed_on_after_stagger() {
    let store = store_with(&["1", "2"], Duration::from_millis(100));
    let coordinator = ResourceLoadCoordinator::init(&load_config(1, 5, 500), store);

    let started = Instant::now();
    let first = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.acquire("1").await })
    };
    let second = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.acquire("2").await })
    };

    first.await.unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));

    second.await.unwrap().unwrap();
    // 100ms first read, 500ms stagger, 100ms second read.
    assert!(started.elapsed() >= Duration::from_millis(700));
}

#[tokio::test(start_paused = true)]
async fn test_cached_key_needs_no_slot() {
    let store = store_with(&["1", "2"], Duration::from_secs(1));
    let coordinator = ResourceLoadCoordinator::init(&load_config(1, 5, 0), store.clone());

    let first = coordinator.acquire("1").await.unwrap();
    let first_handle = first.handle().clone();
    drop(first);
    assert!(coordinator.is_cached("1"));

    // Occupy the only slot with a slow load.
    let blocker = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.acquire("2").await })
    };
    tokio::task::yield_now().await;
    assert_eq!(coordinator.active_loads(), 1);

    let again = timeout(Duration::from_millis(10), coordinator.acquire("1"))
        .await
        .expect("cache hit must not wait for a slot")
        .unwrap();
    assert!(again.handle().ptr_eq(&first_handle));
    assert!(again.is_cached());
    assert_eq!(store.reads(), 2);
    assert_eq!(coordinator.stats().cache_hits, 1);

    blocker.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_missing_key_is_not_cached_and_frees_slot() {
    let store = store_with(&["1"], Duration::from_millis(50));
    let coordinator = ResourceLoadCoordinator::init(&load_config(1, 5, 0), store);

    let err = coordinator.acquire("9").await.unwrap_err();
    assert_eq!(err, AcquireError::NotFound("9".to_string()));
    assert!(!coordinator.is_cached("9"));
    assert_eq!(coordinator.active_loads(), 0);
    assert_eq!(coordinator.stats().loads_failed, 1);

    // The slot is usable again.
    let lease = coordinator.acquire("1").await.unwrap();
    assert_eq!(lease.key(), "1");
}

#[tokio::test]
async fn test_store_error_is_reported() {
    let coordinator = ResourceLoadCoordinator::init(&load_config(2, 5, 0), Arc::new(FailingStore));

    match coordinator.acquire("4").await {
        Err(AcquireError::Store(message)) => assert!(message.contains("unavailable")),
        other => panic!("expected store error, got {:?}", other),
    }
    assert_eq!(coordinator.active_loads(), 0);
    assert_eq!(coordinator.cached_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_same_key_loads_once() {
    let store = store_with(&["1"], Duration::from_millis(100));
    let coordinator = ResourceLoadCoordinator::init(&load_config(2, 5, 0), store.clone());

    let (a, b) = tokio::join!(coordinator.acquire("1"), coordinator.acquire("1"));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(store.reads(), 1);
    assert!(a.handle().ptr_eq(b.handle()));
    assert_eq!(coordinator.stats().loads_started, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_load_is_shared_with_waiters() {
    let store = store_with(&[], Duration::from_millis(100));
    let coordinator = ResourceLoadCoordinator::init(&load_config(2, 5, 500), store.clone());

    let started = Instant::now();
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let coordinator = Arc::clone(&coordinator);
        tasks.push(tokio::spawn(async move { coordinator.acquire("404").await }));
    }
    for task in tasks {
        assert_eq!(
            task.await.unwrap().unwrap_err(),
            AcquireError::NotFound("404".to_string())
        );
    }

    assert_eq!(store.reads(), 1);
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(coordinator.active_loads(), 0);
    assert_eq!(coordinator.stats().loads_started, 1);
}

#[tokio::test]
async fn test_referenced_entry_survives_eviction() {
    let store = store_with(&["a", "b", "c"], Duration::ZERO);
    let coordinator = ResourceLoadCoordinator::init(&load_config(2, 2, 0), store);

    let a = coordinator.acquire("a").await.unwrap();
    let b = coordinator.acquire("b").await.unwrap();
    let b_handle = b.handle().clone();
    drop(b);

    // "a" is older but still in use, so "b" goes.
    let c = coordinator.acquire("c").await.unwrap();
    assert!(c.is_cached());
    assert!(coordinator.is_cached("a"));
    assert!(coordinator.is_cached("c"));
    assert!(!coordinator.is_cached("b"));
    assert!(b_handle.is_revoked());
    assert!(!a.handle().is_revoked());
    assert_eq!(coordinator.stats().evictions, 1);
}

#[tokio::test]
async fn test_all_referenced_serves_uncached_handle() {
    let store = store_with(&["a", "b"], Duration::ZERO);
    let coordinator = ResourceLoadCoordinator::init(&load_config(2, 1, 0), store);

    let a = coordinator.acquire("a").await.unwrap();
    let b = coordinator.acquire("b").await.unwrap();
    assert!(a.is_cached());
    assert!(!b.is_cached());
    assert_eq!(coordinator.cached_len(), 1);

    let b_handle = b.handle().clone();
    drop(b);
    assert!(b_handle.is_revoked());
    assert!(!a.handle().is_revoked());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_rejects_queued_and_revokes_cache() {
    let store = store_with(&["1", "2", "3"], Duration::from_millis(200));
    let coordinator = ResourceLoadCoordinator::init(&load_config(1, 5, 0), store);

    let cached = coordinator.acquire("1").await.unwrap();
    let cached_handle = cached.handle().clone();
    drop(cached);

    let in_flight = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.acquire("2").await })
    };
    let queued = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.acquire("3").await })
    };
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    coordinator.shutdown();

    assert_eq!(in_flight.await.unwrap().unwrap_err(), AcquireError::ShutDown);
    assert_eq!(queued.await.unwrap().unwrap_err(), AcquireError::ShutDown);
    assert!(cached_handle.is_revoked());
    assert_eq!(coordinator.cached_len(), 0);
    assert!(coordinator.is_shut_down());
    assert_eq!(
        coordinator.acquire("1").await.unwrap_err(),
        AcquireError::ShutDown
    );
}

#[tokio::test]
async fn test_store_put_then_acquire() {
    let store = Arc::new(MemoryHandleStore::new());
    let key = store.put(clip("recorded")).await.unwrap();
    let coordinator = ResourceLoadCoordinator::init(&LoadConfig::default(), store);

    let lease = coordinator.acquire(&key).await.unwrap();
    assert_eq!(lease.handle().content_type(), "video/mp4");
    assert!(lease.handle().locator().starts_with("blob:"));
}
