use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use manga_fetcher::cache::TieredCache;
use manga_fetcher::error::FetchError;

fn ttl() -> Duration {
    Duration::from_secs(60)
}

#[tokio::test]
async fn loads_once_then_serves_from_memory() {
    let dir = tempfile::tempdir().unwrap();
    let cache = TieredCache::<String>::new(dir.path().to_path_buf(), ttl(), ttl()).unwrap();
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
        let v = cache
            .fetch("k", false, |_: &String| true, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("hello".to_string())
            })
            .await
            .unwrap();
        assert_eq!(v, "hello");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn durable_tier_survives_a_new_instance() {
    let dir = tempfile::tempdir().unwrap();
    {
        let cache = TieredCache::<String>::new(dir.path().to_path_buf(), ttl(), ttl()).unwrap();
        cache
            .fetch("k", false, |_: &String| true, || async {
                Ok("persisted".to_string())
            })
            .await
            .unwrap();
    }

    // Fresh volatile tier; the value must come back from disk without a load.
    let cache = TieredCache::<String>::new(dir.path().to_path_buf(), ttl(), ttl()).unwrap();
    let v = cache
        .fetch("k", false, |_: &String| true, || async {
            Err(FetchError::Acquisition("should not be called".to_string()))
        })
        .await
        .unwrap();
    assert_eq!(v, "persisted");
}

#[tokio::test]
async fn empty_values_are_never_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let accept = |v: &Vec<u32>| !v.is_empty();
    {
        let cache = TieredCache::<Vec<u32>>::new(dir.path().to_path_buf(), ttl(), ttl()).unwrap();
        let v = cache
            .fetch("k", false, accept, || async { Ok(Vec::new()) })
            .await
            .unwrap();
        assert!(v.is_empty());
    }

    let cache = TieredCache::<Vec<u32>>::new(dir.path().to_path_buf(), ttl(), ttl()).unwrap();
    let calls = AtomicUsize::new(0);
    let v = cache
        .fetch("k", false, accept, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![1, 2])
        })
        .await
        .unwrap();
    assert_eq!(v, vec![1, 2]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refresh_drops_both_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let cache = TieredCache::<String>::new(dir.path().to_path_buf(), ttl(), ttl()).unwrap();

    let v = cache
        .fetch("k", false, |_: &String| true, || async {
            Ok("old".to_string())
        })
        .await
        .unwrap();
    assert_eq!(v, "old");

    let v = cache
        .fetch("k", true, |_: &String| true, || async {
            Ok("new".to_string())
        })
        .await
        .unwrap();
    assert_eq!(v, "new");

    // The refreshed value is what later callers see, even disk-first.
    let cache = TieredCache::<String>::new(dir.path().to_path_buf(), ttl(), ttl()).unwrap();
    let v = cache
        .fetch("k", false, |_: &String| true, || async {
            Err(FetchError::Acquisition("should not be called".to_string()))
        })
        .await
        .unwrap();
    assert_eq!(v, "new");
}

#[tokio::test]
async fn invalidate_forces_a_reload() {
    let dir = tempfile::tempdir().unwrap();
    let cache = TieredCache::<u32>::new(dir.path().to_path_buf(), ttl(), ttl()).unwrap();
    let calls = AtomicUsize::new(0);

    for expected in [1u32, 2u32] {
        let v = cache
            .fetch("k", false, |_: &u32| true, || async {
                Ok(calls.fetch_add(1, Ordering::SeqCst) as u32 + 1)
            })
            .await
            .unwrap();
        assert_eq!(v, expected);
        cache.invalidate("k");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
