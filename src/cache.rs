//! Single-flight memoization for read paths
//!
//! Collapses concurrent identical reads into one upstream computation and
//! memoizes the result for a short TTL. Each read path owns its own
//! `SingleFlight` instance with the TTL that fits it (a few seconds for
//! viewer-bound reads, 10-15s for anonymous ones).

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use moka::future::Cache;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

type SharedResult<T> = Result<T, Arc<anyhow::Error>>;

pub struct SingleFlight<T: Clone + Send + Sync + 'static> {
    values: Cache<String, T>,
    in_flight: DashMap<String, Shared<BoxFuture<'static, SharedResult<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        Self {
            values: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
            in_flight: DashMap::new(),
        }
    }

    /// Return the cached value for `key`, joining an in-flight computation
    /// if one exists, otherwise running `factory` exactly once.
    ///
    /// Failures are returned to every waiter but never cached, so the next
    /// call retries.
    pub async fn resolve<F, Fut>(&self, key: &str, factory: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if let Some(value) = self.values.get(key).await {
            return Ok(value);
        }

        let shared = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let fut = factory().map(|r| r.map_err(Arc::new)).boxed().shared();
                slot.insert(fut.clone());
                fut
            }
        };

        let result = shared.await;

        // Clear the marker whether the factory succeeded or failed; every
        // waiter removing it is harmless.
        self.in_flight.remove(key);

        match result {
            Ok(value) => {
                self.values.insert(key.to_string(), value.clone()).await;
                Ok(value)
            }
            Err(err) => Err(anyhow::anyhow!("{err:#}")),
        }
    }

    /// Drop a cached value, forcing the next resolve to recompute.
    pub async fn invalidate(&self, key: &str) {
        self.values.invalidate(key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_factory_call() {
        let cache = Arc::new(SingleFlight::<u64>::new(Duration::from_secs(5), 100));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .resolve("answer", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_value_is_served_without_factory() {
        let cache = SingleFlight::<String>::new(Duration::from_secs(5), 100);

        let first = cache
            .resolve("k", || async { Ok("v1".to_string()) })
            .await
            .unwrap();
        assert_eq!(first, "v1");

        let second = cache
            .resolve("k", || async { panic!("factory must not run") })
            .await
            .unwrap();
        assert_eq!(second, "v1");
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = SingleFlight::<u64>::new(Duration::from_secs(5), 100);
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        let err = cache
            .resolve("k", move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("upstream down")
            })
            .await;
        assert!(err.is_err());

        let c = Arc::clone(&calls);
        let ok = cache
            .resolve("k", move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(ok, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_value_is_recomputed() {
        let cache = SingleFlight::<u64>::new(Duration::from_millis(20), 100);

        cache.resolve("k", || async { Ok(1) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let again = cache.resolve("k", || async { Ok(2) }).await.unwrap();
        assert_eq!(again, 2);
    }
}
