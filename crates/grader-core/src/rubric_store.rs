//! Rubric lookups routed through the query cache site.

use std::collections::BTreeMap;
use std::sync::Arc;

use grader_state::{RubricStore, StorageError, StoredRubric};
use tracing::{debug, warn};

use crate::cache::CacheLayer;
use crate::domain::{GraderError, Result, Rubric};

/// [`RubricStore`] wrapper that caches found rubrics.
///
/// Only hits are stored: a rubric added to the store after a failed lookup
/// becomes visible on the next call.
#[derive(Clone)]
pub struct CachedRubricStore {
    store: Arc<dyn RubricStore>,
    cache: CacheLayer,
}

impl CachedRubricStore {
    pub fn new(store: Arc<dyn RubricStore>, cache: CacheLayer) -> Self {
        Self { store, cache }
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    /// Validated rubric for `artifact`, or `None` if the store has none.
    pub async fn find_rubric(&self, artifact: &str) -> Result<Option<Rubric>> {
        let store = Arc::clone(&self.store);
        let cached = self
            .cache
            .with_cache_if(
                "find_rubric",
                &serde_json::json!({ "filename": artifact }),
                || async move { store.find_rubric(artifact).await },
                |found: &Option<StoredRubric>| found.is_some(),
            )
            .await?;
        debug!(artifact, hit = cached.insight.hit, "rubric lookup");
        cached.value.map(Rubric::try_from).transpose()
    }

    /// Rubrics for every name in `artifacts` that has one.
    ///
    /// A rubric that fails validation is logged and left out, like a missing
    /// one; the orchestrator then skips that artifact.
    pub async fn rubrics_for<'a, I>(&self, artifacts: I) -> Result<BTreeMap<String, Rubric>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut found = BTreeMap::new();
        for name in artifacts {
            match self.find_rubric(name).await {
                Ok(Some(rubric)) => {
                    found.insert(name.to_string(), rubric);
                }
                Ok(None) => {}
                Err(e @ GraderError::InvalidRubric { .. }) => {
                    warn!(artifact = name, error = %e, "stored rubric invalid; artifact will be skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    /// Every rubric in the store, uncached.
    pub async fn list_rubrics(&self) -> std::result::Result<Vec<StoredRubric>, StorageError> {
        self.store.list_rubrics().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheSite;
    use async_trait::async_trait;
    use grader_state::{
        fakes::{FailingRubricStore, UnavailableCacheBackend},
        MemoryCacheBackend, MemoryRubricStore, StorageResult, StoredCriterion,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stored(name: &str, points: u32) -> StoredRubric {
        StoredRubric {
            filename: name.to_string(),
            total_points: Some(points),
            criteria: BTreeMap::from([(
                "logic".to_string(),
                StoredCriterion {
                    points,
                    description: "correct logic".to_string(),
                },
            )]),
        }
    }

    struct CountingStore {
        inner: MemoryRubricStore,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl RubricStore for CountingStore {
        async fn find_rubric(&self, name: &str) -> StorageResult<Option<StoredRubric>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.find_rubric(name).await
        }

        async fn list_rubrics(&self) -> StorageResult<Vec<StoredRubric>> {
            self.inner.list_rubrics().await
        }
    }

    fn query_layer() -> CacheLayer {
        CacheLayer::new(Arc::new(MemoryCacheBackend::new()), CacheSite::Query)
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_cache() {
        let store = Arc::new(CountingStore {
            inner: MemoryRubricStore::with_rubrics([stored("Lab3A.py", 10)]),
            lookups: AtomicUsize::new(0),
        });
        let cached = CachedRubricStore::new(store.clone(), query_layer());

        let first = cached.find_rubric("Lab3A.py").await.unwrap().unwrap();
        let second = cached.find_rubric("Lab3A.py").await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.total_points(), 10);
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_rubric_is_not_cached() {
        let store = Arc::new(CountingStore {
            inner: MemoryRubricStore::new(),
            lookups: AtomicUsize::new(0),
        });
        let cached = CachedRubricStore::new(store.clone(), query_layer());

        assert!(cached.find_rubric("Lab9.py").await.unwrap().is_none());
        store.inner.insert(stored("Lab9.py", 5)).unwrap();
        assert!(cached.find_rubric("Lab9.py").await.unwrap().is_some());
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cache_outage_falls_through_to_store() {
        let store = Arc::new(MemoryRubricStore::with_rubrics([stored("a.py", 4)]));
        let layer = CacheLayer::new(Arc::new(UnavailableCacheBackend::new()), CacheSite::Query);
        let cached = CachedRubricStore::new(store, layer);
        assert!(cached.find_rubric("a.py").await.unwrap().is_some());
        assert_eq!(cached.cache().metrics().snapshot().errors, 1);
    }

    #[tokio::test]
    async fn store_failure_propagates() {
        let cached = CachedRubricStore::new(Arc::new(FailingRubricStore), query_layer());
        assert!(cached.find_rubric("a.py").await.is_err());
    }

    #[tokio::test]
    async fn rubrics_for_drops_missing_and_invalid() {
        let mut broken = stored("bad.py", 3);
        broken.criteria.clear();
        let store = Arc::new(MemoryRubricStore::with_rubrics([stored("a.py", 4), broken]));
        let cached = CachedRubricStore::new(store, query_layer());

        let found = cached
            .rubrics_for(["a.py", "bad.py", "missing.py"])
            .await
            .unwrap();
        assert_eq!(found.keys().collect::<Vec<_>>(), vec!["a.py"]);
    }
}
