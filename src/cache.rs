use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::FetchError;
use crate::helpers::cache_file_name;

/// Volatile cache tier with in-flight request coalescing.
///
/// A key is either absent, holds a ready value with a deadline, or holds a
/// pending load. Callers that arrive while a load is pending subscribe to its
/// outcome instead of starting a second load.
pub struct MemoryCache<T> {
    slots: Arc<Mutex<HashMap<String, Slot<T>>>>,
}

enum Slot<T> {
    Ready { value: T, expires_at: Instant },
    Pending(broadcast::Sender<Result<T, String>>),
}

enum SlotAction<T> {
    Wait(broadcast::Receiver<Result<T, String>>),
    Start(broadcast::Sender<Result<T, String>>),
}

/// Removes the pending entry and fails its waiters if the initiating future
/// is dropped before it publishes an outcome.
struct PendingGuard<T> {
    slots: Arc<Mutex<HashMap<String, Slot<T>>>>,
    key: String,
    tx: broadcast::Sender<Result<T, String>>,
    armed: bool,
}

impl<T> Drop for PendingGuard<T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut slots) = self.slots.lock() {
            if matches!(slots.get(&self.key), Some(Slot::Pending(_))) {
                slots.remove(&self.key);
            }
        }
        let _ = self.tx.send(Err("load interrupted".to_string()));
    }
}

impl<T: Clone> Default for MemoryCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> MemoryCache<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Peek at a live, acceptable value without triggering a load.
    pub fn get(&self, key: &str, accept: impl Fn(&T) -> bool) -> Option<T> {
        let mut slots = self.slots.lock().ok()?;
        let stale = match slots.get(key) {
            Some(Slot::Ready { value, expires_at }) => {
                if *expires_at > Instant::now() && accept(value) {
                    return Some(value.clone());
                }
                true
            }
            _ => false,
        };
        if stale {
            slots.remove(key);
        }
        None
    }

    pub fn put(&self, key: &str, value: T, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        if let Ok(mut slots) = self.slots.lock() {
            // Never clobber a pending load; its initiator owns the slot.
            if matches!(slots.get(key), Some(Slot::Pending(_))) {
                return;
            }
            slots.insert(
                key.to_string(),
                Slot::Ready {
                    value,
                    expires_at: Instant::now() + ttl,
                },
            );
        }
    }

    pub fn invalidate(&self, key: &str) {
        if let Ok(mut slots) = self.slots.lock() {
            if matches!(slots.get(key), Some(Slot::Ready { .. })) {
                slots.remove(key);
            }
        }
    }

    /// Return the cached value for `key`, or run `loader` to produce it.
    ///
    /// Values failing `accept` are treated as misses and never stored.
    /// Concurrent callers for the same key share a single load; every waiter
    /// receives the load's outcome, errors included. A zero `ttl` bypasses
    /// the cache entirely.
    pub async fn get_or_load_with<F, Fut, A>(
        &self,
        key: &str,
        ttl: Duration,
        accept: A,
        loader: F,
    ) -> Result<T, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
        A: Fn(&T) -> bool,
    {
        if ttl.is_zero() {
            return loader().await;
        }

        // The lock scope must fully close before any await so callers' futures
        // stay Send; the decision carries an owned receiver or sender out.
        let action = {
            let mut slots = self
                .slots
                .lock()
                .map_err(|_| FetchError::Acquisition("cache lock poisoned".to_string()))?;
            let waiting = match slots.get(key) {
                Some(Slot::Ready { value, expires_at }) => {
                    if *expires_at > Instant::now() && accept(value) {
                        return Ok(value.clone());
                    }
                    // Stale or unacceptable; the pending insert below replaces it.
                    None
                }
                Some(Slot::Pending(tx)) => Some(SlotAction::Wait(tx.subscribe())),
                None => None,
            };
            match waiting {
                Some(wait) => wait,
                None => {
                    let (tx, _) = broadcast::channel(1);
                    slots.insert(key.to_string(), Slot::Pending(tx.clone()));
                    SlotAction::Start(tx)
                }
            }
        };

        let tx = match action {
            SlotAction::Wait(mut rx) => {
                debug!("coalescing load for key {}", key);
                return match rx.recv().await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(msg)) => Err(FetchError::Acquisition(msg)),
                    Err(_) => Err(FetchError::Acquisition("load interrupted".to_string())),
                };
            }
            SlotAction::Start(tx) => tx,
        };

        let mut guard = PendingGuard {
            slots: self.slots.clone(),
            key: key.to_string(),
            tx: tx.clone(),
            armed: true,
        };

        let outcome = loader().await;
        guard.armed = false;

        match outcome {
            Ok(value) => {
                if let Ok(mut slots) = self.slots.lock() {
                    if accept(&value) {
                        slots.insert(
                            key.to_string(),
                            Slot::Ready {
                                value: value.clone(),
                                expires_at: Instant::now() + ttl,
                            },
                        );
                    } else {
                        slots.remove(key);
                    }
                }
                let _ = tx.send(Ok(value.clone()));
                Ok(value)
            }
            Err(e) => {
                if let Ok(mut slots) = self.slots.lock() {
                    slots.remove(key);
                }
                let _ = tx.send(Err(e.to_string()));
                Err(e)
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct DiskEntry<T> {
    expires_at: i64,
    value: T,
}

/// Durable cache tier, one JSON file per key.
pub struct DiskCache<T> {
    dir: PathBuf,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> DiskCache<T> {
    pub fn new(dir: PathBuf) -> Result<Self, FetchError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            _marker: std::marker::PhantomData,
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", cache_file_name(key)))
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let path = self.path_for(key);
        let raw = std::fs::read_to_string(&path).ok()?;
        let entry: DiskEntry<T> = match serde_json::from_str(&raw) {
            Ok(e) => e,
            Err(e) => {
                warn!("dropping unreadable cache file {}: {}", path.display(), e);
                let _ = std::fs::remove_file(&path);
                return None;
            }
        };
        if entry.expires_at <= chrono::Utc::now().timestamp() {
            let _ = std::fs::remove_file(&path);
            return None;
        }
        Some(entry.value)
    }

    pub fn put(&self, key: &str, value: &T, ttl: Duration) -> Result<(), FetchError> {
        let entry = DiskEntry {
            expires_at: chrono::Utc::now().timestamp() + ttl.as_secs() as i64,
            value,
        };
        let raw = serde_json::to_string(&entry)
            .map_err(|e| FetchError::Acquisition(e.to_string()))?;
        std::fs::write(self.path_for(key), raw)?;
        Ok(())
    }

    pub fn invalidate(&self, key: &str) {
        let _ = std::fs::remove_file(self.path_for(key));
    }
}

/// Two-tier cache: a coalescing volatile tier in front of a durable tier.
///
/// Lookups check the volatile tier first, then the durable tier with
/// promotion, and only then run the loader. Acceptable loaded values are
/// written through to both tiers.
pub struct TieredCache<T> {
    mem: MemoryCache<T>,
    disk: DiskCache<T>,
    ttl: Duration,
    disk_ttl: Duration,
}

impl<T> TieredCache<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    pub fn new(dir: PathBuf, ttl: Duration, disk_ttl: Duration) -> Result<Self, FetchError> {
        Ok(Self {
            mem: MemoryCache::new(),
            disk: DiskCache::new(dir)?,
            ttl,
            disk_ttl,
        })
    }

    pub async fn fetch<F, Fut, A>(
        &self,
        key: &str,
        refresh: bool,
        accept: A,
        loader: F,
    ) -> Result<T, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
        A: Fn(&T) -> bool + Copy,
    {
        if refresh {
            self.mem.invalidate(key);
            self.disk.invalidate(key);
        } else {
            if let Some(value) = self.mem.get(key, accept) {
                return Ok(value);
            }
            if let Some(value) = self.disk.get(key) {
                if accept(&value) {
                    self.mem.put(key, value.clone(), self.ttl);
                    return Ok(value);
                }
                self.disk.invalidate(key);
            }
        }

        self.mem
            .get_or_load_with(key, self.ttl, accept, || async {
                let value = loader().await?;
                if accept(&value) {
                    if let Err(e) = self.disk.put(key, &value, self.disk_ttl) {
                        warn!("failed to persist cache entry {}: {}", key, e);
                    }
                }
                Ok(value)
            })
            .await
    }

    pub fn invalidate(&self, key: &str) {
        self.mem.invalidate(key);
        self.disk.invalidate(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_callers_share_one_load() {
        let cache = Arc::new(MemoryCache::<String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load_with("k", Duration::from_secs(60), |_| true, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("value".to_string())
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "value");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_spawned_late_waiter_joins_an_in_flight_load() {
        let cache = Arc::new(MemoryCache::<String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let cache = cache.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .get_or_load_with("k", Duration::from_secs(60), |_| true, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok("value".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Spawning makes the waiter's future cross threads, so it must not
        // carry the slot lock over its await.
        let late = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_load_with("k", Duration::from_secs(60), |_| true, || async {
                        Ok("second load".to_string())
                    })
                    .await
            })
        };

        assert_eq!(first.await.unwrap().unwrap(), "value");
        assert_eq!(late.await.unwrap().unwrap(), "value");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_ttl_bypasses_cache() {
        let cache = MemoryCache::<u32>::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let v = cache
                .get_or_load_with("k", Duration::ZERO, |_| true, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await
                .unwrap();
            assert_eq!(v, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unacceptable_values_are_not_stored() {
        let cache = MemoryCache::<Vec<u32>>::new();
        let calls = AtomicUsize::new(0);
        let accept = |v: &Vec<u32>| !v.is_empty();
        for _ in 0..2 {
            let v = cache
                .get_or_load_with("k", Duration::from_secs(60), accept, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Vec::new())
                })
                .await
                .unwrap();
            assert!(v.is_empty());
        }
        // The empty result counted as a miss both times.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn load_failure_reaches_all_waiters_and_evicts() {
        let cache = Arc::new(MemoryCache::<String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load_with("k", Duration::from_secs(60), |_| true, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(FetchError::Acquisition("boom".to_string()))
                    })
                    .await
            }));
        }

        for h in handles {
            let err = h.await.unwrap().unwrap_err();
            assert!(matches!(err, FetchError::Acquisition(_)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A later call finds nothing cached.
        let v = cache
            .get_or_load_with("k", Duration::from_secs(60), |_| true, || async {
                Ok("recovered".to_string())
            })
            .await
            .unwrap();
        assert_eq!(v, "recovered");
    }

    #[tokio::test]
    async fn expired_entries_reload() {
        let cache = MemoryCache::<u32>::new();
        cache.put("k", 1, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        let v = cache
            .get_or_load_with("k", Duration::from_secs(60), |_| true, || async { Ok(2) })
            .await
            .unwrap();
        assert_eq!(v, 2);
    }
}
