//! Short-lived request coalescing.
//!
//! ## Design
//! - One keyed slot per request; concurrent callers for the same key
//!   await a single shared future instead of issuing duplicate work.
//! - Entries expire by wall-clock TTL and are reaped lazily on the next
//!   lookup for that key. No background sweeper.
//! - Errors are cached like successes: a failed lookup is an answer
//!   too, and hammering a failing host with retries-by-accident helps
//!   nobody. Callers wanting fresh attempts wait out the TTL.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::error::SyncError;

/// Default TTL for cached request slots: 5 seconds.
const DEFAULT_TTL_MS: u64 = 5_000;

type SharedRequest<T> = Shared<BoxFuture<'static, Result<T, SyncError>>>;

struct CacheSlot<T> {
    started_at: Instant,
    request: SharedRequest<T>,
}

/// Coalescing cache keyed by request identity.
///
/// The stored future is shared: the first caller for a key starts the
/// work, every later caller within the TTL awaits the same future and
/// receives a clone of its output.
pub struct RequestCache<T> {
    slots: Mutex<HashMap<String, CacheSlot<T>>>,
    ttl: Duration,
}

impl<T> RequestCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_millis(DEFAULT_TTL_MS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Return the cached result for `key`, starting `factory` only when
    /// no live slot exists.
    ///
    /// The factory runs at most once per TTL window per key no matter
    /// how many callers race here.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, factory: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        let request = {
            let mut slots = self.slots.lock();
            match slots.get(key) {
                Some(slot) if slot.started_at.elapsed() < self.ttl => slot.request.clone(),
                _ => {
                    let request = factory().boxed().shared();
                    slots.insert(
                        key.to_string(),
                        CacheSlot {
                            started_at: Instant::now(),
                            request: request.clone(),
                        },
                    );
                    request
                }
            }
        };
        // Await outside the lock; the shared future may take arbitrarily
        // long and other keys must stay reachable meanwhile.
        request.await
    }

    /// Peek at the live slot for `key` without starting anything.
    pub(crate) fn cached(&self, key: &str) -> Option<SharedRequest<T>> {
        let slots = self.slots.lock();
        slots
            .get(key)
            .filter(|slot| slot.started_at.elapsed() < self.ttl)
            .map(|slot| slot.request.clone())
    }

    /// Number of slots currently held, expired ones included.
    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        self.slots.lock().len()
    }
}

impl<T> Default for RequestCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn coalesces_concurrent_callers() {
        let cache: Arc<RequestCache<u32>> = Arc::new(RequestCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let gate = gate.map(|_| ()).shared();

        let first = {
            let cache = cache.clone();
            let calls = calls.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch("answer", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = gate.await;
                        Ok(42)
                    })
                    .await
            })
        };
        let second = {
            let cache = cache.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch("answer", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(7)
                    })
                    .await
            })
        };

        // Let both callers reach the cache before the first resolves.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = release.send(());

        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap().unwrap(), 42);
        assert_eq!(b.unwrap().unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_slot_is_refetched() {
        let cache: RequestCache<u32> = RequestCache::with_ttl(Duration::from_millis(0));
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_fetch("k", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(1) }
            })
            .await;
        std::thread::sleep(Duration::from_millis(10));
        let second = cache
            .get_or_fetch("k", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(2) }
            })
            .await;

        assert_eq!(first.unwrap(), 1);
        assert_eq!(second.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn distinct_keys_fetch_independently() {
        let cache: RequestCache<u32> = RequestCache::new();

        let a = cache.get_or_fetch("a", || async { Ok(1) }).await;
        let b = cache.get_or_fetch("b", || async { Ok(2) }).await;

        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 2);
        assert_eq!(cache.entry_count(), 2);
    }

    #[tokio::test]
    async fn completed_result_is_reused_within_ttl() {
        let cache: RequestCache<u32> = RequestCache::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let got = cache
                .get_or_fetch("k", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(9) }
                })
                .await;
            assert_eq!(got.unwrap(), 9);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cached_peek_does_not_start_work() {
        let cache: RequestCache<u32> = RequestCache::new();
        assert!(cache.cached("missing").is_none());

        let _ = cache.get_or_fetch("k", || async { Ok(3) }).await;
        let peeked = cache.cached("k");
        assert!(peeked.is_some());
        assert_eq!(peeked.unwrap().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn failed_results_are_cached_too() {
        let cache: RequestCache<u32> = RequestCache::new();
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_fetch("k", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::Host("boom".into())) }
            })
            .await;
        let second = cache
            .get_or_fetch("k", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(1) }
            })
            .await;

        assert!(first.is_err());
        assert!(second.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
