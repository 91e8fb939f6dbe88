//! Lazily-populated shared caches
//!
//! Both caches serialize callers on a `tokio::sync::Mutex` that stays held
//! across the in-flight live query, so under concurrency exactly one query
//! runs and everyone else waits for its result.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::warn;

enum LatchState {
    Unresolved,
    Resolved(String),
    Failed(String),
}

/// A write-once value resolved by the first caller.
///
/// The outcome latches: a resolved value is returned to every later caller,
/// and a failed resolution is returned as the same error forever. The lock
/// is held for the duration of the live query, so at most one query is in
/// flight.
pub struct Latch {
    state: Mutex<LatchState>,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::Unresolved),
        }
    }

    pub async fn get_or_resolve<F, Fut>(&self, resolve: F) -> Result<String, String>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<String, String>>,
    {
        let mut state = self.state.lock().await;
        match &*state {
            LatchState::Resolved(value) => Ok(value.clone()),
            LatchState::Failed(reason) => Err(reason.clone()),
            LatchState::Unresolved => match resolve().await {
                Ok(value) => {
                    *state = LatchState::Resolved(value.clone());
                    Ok(value)
                }
                Err(reason) => {
                    *state = LatchState::Failed(reason.clone());
                    Err(reason)
                }
            },
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

/// App label → sorted pod names, fetched once and reused.
///
/// Only a non-empty result counts as cached: an empty map means the app
/// pods were not scheduled yet, so the next caller queries again rather
/// than being served a latched empty index. A failed fetch logs and
/// yields an empty map without populating the cache either.
pub struct PodCache {
    pods: Mutex<HashMap<String, Vec<String>>>,
}

impl PodCache {
    pub fn new() -> Self {
        Self {
            pods: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> HashMap<String, Vec<String>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<HashMap<String, Vec<String>>, String>>,
    {
        let mut guard = self.pods.lock().await;
        if !guard.is_empty() {
            return guard.clone();
        }
        match fetch().await {
            Ok(map) => {
                *guard = map.clone();
                map
            }
            Err(reason) => {
                warn!(error = %reason, "Failed to list app pods");
                HashMap::new()
            }
        }
    }
}

impl Default for PodCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_latch_resolves_once_under_concurrency() {
        let latch = Arc::new(Latch::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let latch = Arc::clone(&latch);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                latch
                    .get_or_resolve(|| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok("http://10.0.0.1:31380".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            let value = handle.await.expect("task should not panic");
            assert_eq!(value, Ok("http://10.0.0.1:31380".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_latch_latches_failure() {
        let latch = Latch::new();
        let calls = AtomicUsize::new(0);

        let first = latch
            .get_or_resolve(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("no ingress pod".to_string())
            })
            .await;
        let second = latch
            .get_or_resolve(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("should never run".to_string())
            })
            .await;

        assert_eq!(first, Err("no ingress pod".to_string()));
        assert_eq!(second, Err("no ingress pod".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pod_cache_fetches_once() {
        let cache = PodCache::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let pods = cache
                .get_or_fetch(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let mut map = HashMap::new();
                    map.insert("a".to_string(), vec!["a-1".to_string(), "a-2".to_string()]);
                    Ok(map)
                })
                .await;
            assert_eq!(pods["a"], vec!["a-1", "a-2"]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pod_cache_failure_does_not_poison() {
        let cache = PodCache::new();

        let first = cache
            .get_or_fetch(|| async { Err("connection refused".to_string()) })
            .await;
        assert!(first.is_empty());

        // Next caller retries and populates the cache.
        let second = cache
            .get_or_fetch(|| async {
                let mut map = HashMap::new();
                map.insert("b".to_string(), vec!["b-1".to_string()]);
                Ok(map)
            })
            .await;
        assert_eq!(second["b"], vec!["b-1"]);
    }

    #[tokio::test]
    async fn test_pod_cache_retries_after_empty_result() {
        // Listing before any app pods are scheduled yields an empty map;
        // that must not stick, or every later lookup would come up empty.
        let cache = PodCache::new();
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_fetch(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(HashMap::new())
            })
            .await;
        assert!(first.is_empty());

        let mut scheduled = HashMap::new();
        scheduled.insert("a".to_string(), vec!["a-1".to_string()]);
        let second = cache
            .get_or_fetch(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(scheduled.clone())
            })
            .await;

        assert_eq!(second["a"], vec!["a-1"]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Once non-empty, the cache serves without another query.
        let third = cache
            .get_or_fetch(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(HashMap::new())
            })
            .await;
        assert_eq!(third["a"], vec!["a-1"]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
