//! Request coalescing for concurrent cache misses.
//!
//! When several callers miss on the same key at once, only the first one
//! starts a fetch; the rest wait on it and receive a clone of its result,
//! success or failure alike.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// The fetch task ended without producing a result (it panicked or the
/// runtime dropped it).
#[derive(Debug, Clone, thiserror::Error)]
#[error("coalesced fetch aborted: {reason}")]
pub struct FetchAborted {
    pub reason: String,
}

/// Statistics for request coalescing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoalescerStats {
    /// Calls that started a new fetch.
    pub leaders: u64,
    /// Calls that attached to a fetch already in flight.
    pub followers: u64,
    /// Fetches currently running.
    pub in_flight: usize,
}

type PendingFetch<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;
type Registry<K, T, E> = Arc<Mutex<HashMap<K, PendingFetch<T, E>>>>;

fn awaiting<T, E>(rx: oneshot::Receiver<Result<T, E>>) -> PendingFetch<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<FetchAborted> + 'static,
{
    async move {
        rx.await.unwrap_or_else(|_| {
            Err(E::from(FetchAborted {
                reason: "fetch task ended without a result".to_string(),
            }))
        })
    }
    .boxed()
    .shared()
}

/// Deduplicates concurrent fetches that share a key.
///
/// The fetch runs on its own tokio task, so it finishes and its result is
/// delivered to the remaining waiters even if the caller that started it is
/// dropped. The key is released as soon as the task ends, so the next call
/// after completion starts a fresh fetch.
pub struct Coalescer<K, T, E> {
    in_flight: Registry<K, T, E>,
    leaders: AtomicU64,
    followers: AtomicU64,
}

impl<K, T, E> Coalescer<K, T, E>
where
    K: Hash + Eq + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<FetchAborted> + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            leaders: AtomicU64::new(0),
            followers: AtomicU64::new(0),
        }
    }

    /// Run `fetch` for `key` unless a fetch for it is already in flight, in
    /// which case wait for that one instead.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn do_once<F, Fut>(&self, key: K, fetch: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (pending, leader) = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&key) {
                Some(pending) => {
                    self.followers.fetch_add(1, Ordering::Relaxed);
                    (pending.clone(), None)
                }
                None => {
                    self.leaders.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = oneshot::channel();
                    let pending = awaiting(rx);
                    in_flight.insert(key.clone(), pending.clone());
                    (pending, Some((key, tx)))
                }
            }
        };

        // The registry lock is not held past this point.
        if let Some((key, tx)) = leader {
            let release = Release {
                registry: Arc::clone(&self.in_flight),
                key: Some(key),
            };
            let work = fetch();
            tokio::spawn(async move {
                let result = work.await;
                // Waiters must never see a result while the key is still registered.
                drop(release);
                let _ = tx.send(result);
            });
        }

        pending.await
    }

    /// Number of keys with a fetch currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            leaders: self.leaders.load(Ordering::Relaxed),
            followers: self.followers.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }
}

impl<K, T, E> Default for Coalescer<K, T, E>
where
    K: Hash + Eq + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<FetchAborted> + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the key from the registry when the fetch ends, including by a
/// panic in `fetch` itself or in the task running its future.
struct Release<K: Hash + Eq, T, E> {
    registry: Registry<K, T, E>,
    key: Option<K>,
}

impl<K: Hash + Eq, T, E> Drop for Release<K, T, E> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.registry.lock().remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::time::sleep;

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        Upstream(String),
        Aborted,
    }

    impl From<FetchAborted> for TestError {
        fn from(_: FetchAborted) -> Self {
            TestError::Aborted
        }
    }

    type TestCoalescer = Coalescer<String, u32, TestError>;

    #[tokio::test]
    async fn single_call_runs_fetch() {
        let coalescer = TestCoalescer::new();
        let result = coalescer
            .do_once("a".to_string(), || async { Ok(42) })
            .await;
        assert_eq!(result, Ok(42));
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_fetch() {
        let coalescer = Arc::new(TestCoalescer::new());
        let fetches = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let coalescer = Arc::clone(&coalescer);
                let fetches = Arc::clone(&fetches);
                tokio::spawn(async move {
                    coalescer
                        .do_once("shared".to_string(), move || async move {
                            fetches.fetch_add(1, Ordering::SeqCst);
                            sleep(Duration::from_millis(100)).await;
                            Ok(7)
                        })
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(7));
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        let stats = coalescer.stats();
        assert_eq!(stats.leaders, 1);
        assert_eq!(stats.followers, 15);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn failure_is_broadcast_to_every_waiter() {
        let coalescer = Arc::new(TestCoalescer::new());

        let leader = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                coalescer
                    .do_once("k".to_string(), || async {
                        sleep(Duration::from_millis(50)).await;
                        Err(TestError::Upstream("refused".into()))
                    })
                    .await
            })
        };
        sleep(Duration::from_millis(10)).await;
        let follower = coalescer
            .do_once("k".to_string(), || async { Ok(1) })
            .await;

        let expected = Err(TestError::Upstream("refused".into()));
        assert_eq!(follower, expected);
        assert_eq!(leader.await.unwrap(), expected);
        assert_eq!(coalescer.stats().followers, 1);
    }

    #[tokio::test]
    async fn completed_key_starts_fresh_fetch() {
        let coalescer = TestCoalescer::new();
        let fetches = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let fetches = Arc::clone(&fetches);
            coalescer
                .do_once("k".to_string(), move || async move {
                    Ok(fetches.fetch_add(1, Ordering::SeqCst))
                })
                .await
                .unwrap();
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn different_keys_are_not_coalesced() {
        let coalescer = Arc::new(TestCoalescer::new());
        let fetches = Arc::new(AtomicU32::new(0));

        let calls = (0..3).map(|i| {
            let coalescer = Arc::clone(&coalescer);
            let fetches = Arc::clone(&fetches);
            async move {
                coalescer
                    .do_once(format!("key-{i}"), move || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(20)).await;
                        Ok(i)
                    })
                    .await
            }
        });
        let results = futures_util::future::join_all(calls).await;

        assert_eq!(results, vec![Ok(0), Ok(1), Ok(2)]);
        assert_eq!(fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dropped_leader_does_not_cancel_fetch() {
        let coalescer = Arc::new(TestCoalescer::new());
        let fetches = Arc::new(AtomicU32::new(0));

        let leader = {
            let coalescer = Arc::clone(&coalescer);
            let fetches = Arc::clone(&fetches);
            tokio::spawn(async move {
                coalescer
                    .do_once("k".to_string(), move || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(50)).await;
                        Ok(99)
                    })
                    .await
            })
        };
        sleep(Duration::from_millis(10)).await;
        leader.abort();

        let follower = coalescer
            .do_once("k".to_string(), || async { Ok(0) })
            .await;

        assert_eq!(follower, Ok(99));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fetch_starts_after_registry_is_unlocked() {
        let coalescer = TestCoalescer::new();

        // `in_flight` locks the registry; holding it across `fetch` would deadlock.
        let result = coalescer
            .do_once("k".to_string(), || {
                let seen = coalescer.in_flight() as u32;
                async move { Ok(seen) }
            })
            .await;

        assert_eq!(result, Ok(1));
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn instant_fetches_release_their_keys() {
        let coalescer = Arc::new(TestCoalescer::new());

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let coalescer = Arc::clone(&coalescer);
                tokio::spawn(async move {
                    coalescer
                        .do_once(format!("key-{}", i % 8), move || async move { Ok(i) })
                        .await
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn panic_while_building_fetch_releases_key() {
        let coalescer = Arc::new(TestCoalescer::new());

        let leader = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                coalescer
                    .do_once("k".to_string(), || {
                        let blow_up = true;
                        if blow_up {
                            panic!("could not build fetch");
                        }
                        async { Ok(0) }
                    })
                    .await
            })
        };
        assert!(leader.await.unwrap_err().is_panic());
        assert_eq!(coalescer.in_flight(), 0);

        let retry = coalescer
            .do_once("k".to_string(), || async { Ok(3) })
            .await;
        assert_eq!(retry, Ok(3));
    }

    #[tokio::test]
    async fn panicking_fetch_releases_key() {
        let coalescer = TestCoalescer::new();

        let result = coalescer
            .do_once("k".to_string(), || async {
                let blow_up = true;
                if blow_up {
                    panic!("fetch blew up");
                }
                Ok(0)
            })
            .await;
        assert_eq!(result, Err(TestError::Aborted));
        assert_eq!(coalescer.in_flight(), 0);

        let retry = coalescer
            .do_once("k".to_string(), || async { Ok(5) })
            .await;
        assert_eq!(retry, Ok(5));
    }
}
