//! Keyed, TTL-governed, single-flight result cache.
//!
//! FUSE commonly issues a directory listing immediately followed by one
//! lookup per child; without deduplication each of those lookups would
//! repeat the backend call, multiplying expensive network round trips by
//! the number of children. [`Cache::get`] collapses concurrent requests for
//! the same key onto one shared computation and bounds staleness per
//! operation kind.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::error::Result;

/// Operation kind a cached result belongs to. TTLs are chosen per kind by
/// the invocation site, not hardcoded here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    List,
    Metadata,
    Read,
}

/// Structured cache key: operation kind plus the owning entry's path id.
/// Structured rather than a concatenated string so entry names containing
/// path separators cannot collide.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub op: Op,
    pub id: String,
}

impl CacheKey {
    pub fn new(op: Op, id: impl Into<String>) -> Self {
        Self { op, id: id.into() }
    }
}

type Flight<V> = Shared<BoxFuture<'static, Result<V>>>;

enum Slot<V> {
    /// Result of the last completed computation.
    Ready { value: V, at: Instant },
    /// A computation is running; every caller awaits this one future. The
    /// generation tags the flight so only its own waiters publish it.
    InFlight { flight: Flight<V>, generation: u64 },
}

/// TTL + single-flight cache. `V` is cloned out to each caller, so values
/// are expected to be cheap handles (`Arc`s, `Bytes`, entry lists).
///
/// There is no eviction beyond TTL staleness: stale slots are replaced in
/// place on the next request, never proactively dropped.
pub struct Cache<V> {
    slots: Mutex<HashMap<CacheKey, Slot<V>>>,
    generation: AtomicU64,
}

impl<V: Clone + Send + 'static> Cache<V> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Fetch the value for `key`, recomputing via `compute` when no result
    /// newer than `ttl` exists.
    ///
    /// At most one computation per key runs at a time: concurrent callers
    /// await the same shared flight and observe the same outcome. A failed
    /// computation is handed to every waiter of that flight but is never
    /// stored, so the next call retries instead of replaying a stale error.
    ///
    /// The slot map lock is only held to inspect or swap slot state, never
    /// across a computation, so unrelated keys proceed independently.
    pub async fn get<F>(&self, key: CacheKey, ttl: Duration, compute: F) -> Result<V>
    where
        F: Future<Output = Result<V>> + Send + 'static,
    {
        let (flight, generation) = {
            let mut slots = self.slots.lock().unwrap();
            match slots.get(&key) {
                Some(Slot::Ready { value, at }) if at.elapsed() < ttl => {
                    return Ok(value.clone());
                }
                Some(Slot::InFlight { flight, generation }) => (flight.clone(), *generation),
                _ => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let flight: Flight<V> = compute.boxed().shared();
                    slots.insert(
                        key.clone(),
                        Slot::InFlight {
                            flight: flight.clone(),
                            generation,
                        },
                    );
                    (flight, generation)
                }
            }
        };

        let result = flight.await;

        // Whichever waiter gets here first publishes the outcome: successes
        // become Ready with a fresh timestamp, failures clear the in-flight
        // marker so the next call retries.
        let mut slots = self.slots.lock().unwrap();
        let current = matches!(
            slots.get(&key),
            Some(Slot::InFlight { generation: g, .. }) if *g == generation
        );
        if current {
            match &result {
                Ok(value) => {
                    slots.insert(
                        key,
                        Slot::Ready {
                            value: value.clone(),
                            at: Instant::now(),
                        },
                    );
                }
                Err(_) => {
                    slots.remove(&key);
                }
            }
        }
        result
    }
}

impl<V: Clone + Send + 'static> Default for Cache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use anyhow::anyhow;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn key(id: &str) -> CacheKey {
        CacheKey::new(Op::List, id)
    }

    #[tokio::test]
    async fn concurrent_gets_share_one_computation() {
        let cache = Arc::new(Cache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get(key("k"), Duration::from_secs(10), async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(7u32)
                    })
                    .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fresh_hit_skips_compute_until_ttl_expires() {
        let cache: Cache<u32> = Cache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Duration::from_millis(80);

        let compute = |calls: Arc<AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(1u32)
        };

        cache.get(key("k"), ttl, compute(calls.clone())).await.unwrap();
        cache.get(key("k"), ttl, compute(calls.clone())).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        cache.get(key("k"), ttl, compute(calls.clone())).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_share() {
        let cache: Cache<u32> = Cache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for id in ["a", "b"] {
            let calls = calls.clone();
            cache
                .get(key(id), Duration::from_secs(10), async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(0u32)
                })
                .await
                .unwrap();
        }
        // Same id under a different operation kind is a different key.
        let calls2 = calls.clone();
        cache
            .get(CacheKey::new(Op::Metadata, "a"), Duration::from_secs(10), async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(0u32)
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let cache: Cache<u32> = Cache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Duration::from_secs(10);

        let failing = {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::backend("list", "/x", anyhow!("boom")))
            }
        };
        assert!(cache.get(key("k"), ttl, failing).await.is_err());

        let ok = {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(9u32)
            }
        };
        assert_eq!(cache.get(key("k"), ttl, ok).await.unwrap(), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn waiters_all_observe_the_shared_error() {
        let cache = Arc::new(Cache::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get(key("k"), Duration::from_secs(10), async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(Error::backend("list", "/x", anyhow!("down")))
                    })
                    .await
            }));
        }

        for task in tasks {
            assert!(task.await.unwrap().is_err());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
