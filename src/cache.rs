//! Single-flight memoization of per-site results
//!
//! [`ResultCache`] stores the outcome of an async computation per key, and
//! guarantees that at most one computation per key is in flight at a time.
//! Callers arriving while a computation is running wait for it and receive
//! its result (or its error) instead of starting their own.
//!
//! Only successful results are stored. Failed computations are reported to
//! every waiter and then forgotten, so the next request recomputes. If the
//! computing caller is dropped (cancelled) before finishing, nothing is
//! stored, and one of the waiters takes over the computation.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use thiserror::Error;
use tokio::sync::watch;

/// Error returned to every caller waiting on a failed computation
///
/// All waiters on one key share the same underlying error.
#[derive(Error)]
#[error("cached computation failed: {source}")]
pub struct ComputationError<E: std::error::Error + 'static> {
    source: Arc<E>,
}

impl<E: std::error::Error + 'static> ComputationError<E> {
    fn new(source: E) -> Self {
        ComputationError {
            source: Arc::new(source),
        }
    }

    /// The error the computation failed with
    pub fn inner(&self) -> &E {
        &self.source
    }
}

impl<E: std::error::Error + 'static> Clone for ComputationError<E> {
    fn clone(&self) -> Self {
        ComputationError {
            source: Arc::clone(&self.source),
        }
    }
}

impl<E: std::error::Error + 'static> fmt::Debug for ComputationError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ComputationError")
            .field(&self.source)
            .finish()
    }
}

type Outcome<V, E> = Result<V, ComputationError<E>>;

enum Slot<V, E: std::error::Error + 'static> {
    Ready(V),
    Pending(watch::Receiver<Option<Outcome<V, E>>>),
}

/// Counters describing how requests to a [`ResultCache`] were served
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Requests served from a stored value
    pub hits: u64,
    /// Requests that ran the computation themselves
    pub computations: u64,
    /// Requests that waited on another caller's computation
    pub joined: u64,
}

/// Memoizes async computations per key with at most one computation in flight
/// per key
pub struct ResultCache<K, V, E: std::error::Error + 'static> {
    slots: Mutex<HashMap<K, Slot<V, E>>>,
    hits: AtomicU64,
    computations: AtomicU64,
    joined: AtomicU64,
}

impl<K, V, E> Default for ResultCache<K, V, E>
where
    E: std::error::Error + 'static,
{
    fn default() -> Self {
        ResultCache {
            slots: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            computations: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }
}

impl<K, V, E> fmt::Debug for ResultCache<K, V, E>
where
    E: std::error::Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<K, V, E> ResultCache<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: std::error::Error + 'static,
{
    /// Instantiate an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the stored value for `key`, or compute, store and return it
    ///
    /// `compute` is invoked at most once per key across all concurrent
    /// callers. Callers that find a computation already running for `key`
    /// await its outcome.
    ///
    /// # Errors
    ///
    /// [`ComputationError`] wrapping the error of the computation this call
    /// ran or waited on.
    pub async fn get_or_compute<F, Fut>(&self, key: K, compute: F) -> Outcome<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let sender = loop {
            let mut receiver = {
                let mut slots = self.lock();
                match slots.get(&key) {
                    Some(Slot::Ready(value)) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(value.clone());
                    }
                    Some(Slot::Pending(receiver)) => receiver.clone(),
                    None => {
                        let (sender, receiver) = watch::channel(None);
                        slots.insert(key.clone(), Slot::Pending(receiver));
                        break sender;
                    }
                }
            };

            self.joined.fetch_add(1, Ordering::Relaxed);
            if let Ok(outcome) = receiver.wait_for(Option::is_some).await {
                if let Some(outcome) = &*outcome {
                    return outcome.clone();
                }
            };
            // the computing caller was dropped without an outcome, try to take over
        };

        self.computations.fetch_add(1, Ordering::Relaxed);
        let guard = PendingGuard {
            cache: self,
            key: Some(key),
            sender,
        };
        let outcome = compute().await.map_err(ComputationError::new);
        guard.complete(outcome)
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a value is stored for `key`
    pub fn contains(&self, key: &K) -> bool {
        matches!(self.lock().get(key), Some(Slot::Ready(_)))
    }
}

impl<K, V, E: std::error::Error + 'static> ResultCache<K, V, E> {
    #[allow(missing_docs)]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            computations: self.computations.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Slot<V, E>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns a pending slot while its computation runs. Dropping it without
/// calling `complete` clears the slot and wakes the waiters, so a cancelled
/// computation never leaves anything behind.
struct PendingGuard<'a, K, V, E>
where
    K: Eq + Hash,
    E: std::error::Error + 'static,
{
    cache: &'a ResultCache<K, V, E>,
    key: Option<K>,
    sender: watch::Sender<Option<Outcome<V, E>>>,
}

impl<K, V, E> PendingGuard<'_, K, V, E>
where
    K: Eq + Hash,
    V: Clone,
    E: std::error::Error + 'static,
{
    fn complete(mut self, outcome: Outcome<V, E>) -> Outcome<V, E> {
        if let Some(key) = self.key.take() {
            let mut slots = self.cache.lock();
            match &outcome {
                Ok(value) => {
                    slots.insert(key, Slot::Ready(value.clone()));
                }
                Err(_) => {
                    slots.remove(&key);
                }
            }
        }
        self.sender.send_replace(Some(outcome.clone()));
        outcome
    }
}

impl<K, V, E> Drop for PendingGuard<'_, K, V, E>
where
    K: Eq + Hash,
    E: std::error::Error + 'static,
{
    fn drop(&mut self) {
        // the sender is dropped after this, so waiters only wake once the slot is gone
        if let Some(key) = self.key.take() {
            self.cache.lock().remove(&key);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{sync::atomic::AtomicUsize, time::Duration};

    #[derive(Error, Debug)]
    #[error("boom")]
    struct Boom;

    type TestCache = ResultCache<(&'static str, u32), Arc<Vec<u32>>, Boom>;

    #[tokio::test]
    async fn test_second_call_hits() {
        let cache = TestCache::new();
        let calls = AtomicUsize::new(0);
        let compute = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(vec![1, 2, 3]))
        };

        let first = cache.get_or_compute(("a", 1), compute).await.unwrap();
        let second = cache.get_or_compute(("a", 1), compute).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                computations: 1,
                joined: 0
            }
        );
    }

    #[tokio::test]
    async fn test_distinct_keys_distinct_entries() {
        let cache = TestCache::new();

        cache
            .get_or_compute(("a", 1), || async { Ok(Arc::new(vec![1])) })
            .await
            .unwrap();
        let other = cache
            .get_or_compute(("a", 2), || async { Ok(Arc::new(vec![2])) })
            .await
            .unwrap();

        assert_eq!(*other, vec![2]);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let cache = TestCache::new();
        let calls = AtomicUsize::new(0);
        let compute = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Arc::new(vec![7]))
        };

        let results = futures::future::join_all(
            (0..8).map(|_| cache.get_or_compute(("slow", 0), compute)),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let first = results[0].as_ref().unwrap();
        assert!(results
            .iter()
            .all(|r| Arc::ptr_eq(r.as_ref().unwrap(), first)));
        assert_eq!(cache.stats().joined, 7);
    }

    #[tokio::test]
    async fn test_waiters_share_error_and_error_not_stored() {
        let cache = TestCache::new();
        let calls = AtomicUsize::new(0);
        let failing = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(Boom)
        };

        let results =
            futures::future::join_all((0..3).map(|_| cache.get_or_compute(("x", 0), failing)))
                .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let errors: Vec<_> = results.into_iter().map(Result::unwrap_err).collect();
        assert!(errors
            .iter()
            .all(|e| std::ptr::eq(e.inner(), errors[0].inner())));
        assert!(cache.is_empty());

        let retried = cache
            .get_or_compute(("x", 0), || async { Ok(Arc::new(vec![0])) })
            .await;
        assert!(retried.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_computation_stores_nothing() {
        let cache = TestCache::new();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            cache.get_or_compute(("c", 0), || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Arc::new(vec![0]))
            }),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(!cache.contains(&("c", 0)));

        let value = cache
            .get_or_compute(("c", 0), || async { Ok(Arc::new(vec![1])) })
            .await
            .unwrap();
        assert_eq!(*value, vec![1]);
    }

    #[tokio::test]
    async fn test_waiter_takes_over_after_cancellation() {
        let cache = TestCache::new();
        let calls = AtomicUsize::new(0);
        let compute = |millis| {
            let calls = &calls;
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(Arc::new(vec![millis as u32]))
            }
        };

        let leader = tokio::time::timeout(
            Duration::from_millis(20),
            cache.get_or_compute(("k", 0), compute(1000)),
        );
        let follower = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            cache.get_or_compute(("k", 0), compute(10)).await
        };

        let (leader, follower) = tokio::join!(leader, follower);
        assert!(leader.is_err());
        assert_eq!(*follower.unwrap(), vec![10]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.contains(&("k", 0)));
    }
}
