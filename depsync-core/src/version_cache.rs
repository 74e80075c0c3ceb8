use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;

/// Latest-version memo, keyed by package name, for the process lifetime.
#[derive(Default)]
pub struct VersionCache {
    entries: Mutex<HashMap<String, String>>,
}

impl VersionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached version or runs `lookup` once and memoizes a success.
    /// Concurrent first calls for the same name may both look up.
    pub async fn resolve<F, Fut, E>(&self, name: &str, lookup: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        if let Some(v) = self.get(name) {
            return Ok(v);
        }
        let version = lookup().await?;
        self.entries.lock().insert(name.to_string(), version.clone());
        Ok(version)
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.entries.lock().get(name).cloned()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_second_resolve_skips_lookup() {
        let cache = VersionCache::new();
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let lookup = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>("2.32.3".to_string())
        };
        assert_eq!(cache.resolve("requests", lookup).await.unwrap(), "2.32.3");
        assert_eq!(cache.resolve("requests", lookup).await.unwrap(), "2.32.3");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = VersionCache::new();
        let err = cache
            .resolve("flaky", || async { Err::<String, _>("registry down") })
            .await;
        assert!(err.is_err());
        assert!(cache.is_empty());

        let ok = cache.resolve("flaky", || async { Ok::<_, &str>("1.0".into()) }).await;
        assert_eq!(ok.unwrap(), "1.0");
        cache.clear();
        assert_eq!(cache.len(), 0);
    }
}
