//! Process-local backends.
//!
//! `MemoryCacheBackend` is the default cache for a single grader process and
//! the workhorse of the test suites; `MemoryRubricStore` stands in for the
//! rubric table.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::trace;

use crate::error::StorageError;
use crate::storage_traits::*;

fn lock<T>(mutex: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| StorageError::Backend("memory backend lock poisoned".to_string()))
}

// ---------------------------------------------------------------------------
// MemoryCacheBackend
// ---------------------------------------------------------------------------

/// In-memory cache backed by a `HashMap<key, CacheEntry>`.
///
/// Expired entries are dropped lazily on `get` and swept on `clear`.
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, live or not.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &CacheKey) -> StorageResult<Option<serde_json::Value>> {
        let mut entries = lock(&self.entries)?;
        match entries.get(key.as_str()) {
            Some(entry) if entry.is_expired() => {
                trace!(key = %key.short(), "dropping expired entry");
                entries.remove(key.as_str());
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: serde_json::Value,
        ttl_seconds: u64,
    ) -> StorageResult<()> {
        let entry = CacheEntry::new(key.clone(), value, ttl_seconds);
        let mut entries = lock(&self.entries)?;
        let now = Utc::now();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired_at(now));
        if entries.len() < before {
            trace!(dropped = before - entries.len(), "swept expired entries");
        }
        entries.insert(key.as_str().to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> StorageResult<()> {
        lock(&self.entries)?.remove(key.as_str());
        Ok(())
    }

    async fn clear(&self, prefix: Option<&str>) -> StorageResult<usize> {
        let mut entries = lock(&self.entries)?;
        let before = entries.len();
        match prefix {
            Some(p) => entries.retain(|_, e| e.key.prefix() != p),
            None => entries.clear(),
        }
        Ok(before - entries.len())
    }

    async fn stats(&self) -> StorageResult<BackendStats> {
        let entries = lock(&self.entries)?;
        let now = Utc::now();
        let mut stats = BackendStats::default();
        for entry in entries.values() {
            if entry.is_expired_at(now) {
                stats.expired_entries += 1;
            } else {
                stats.live_entries += 1;
                *stats
                    .entries_by_prefix
                    .entry(entry.key.prefix().to_string())
                    .or_insert(0) += 1;
            }
        }
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// MemoryRubricStore
// ---------------------------------------------------------------------------

/// In-memory rubric store backed by a `BTreeMap<filename, StoredRubric>`.
#[derive(Debug, Default)]
pub struct MemoryRubricStore {
    rubrics: Mutex<BTreeMap<String, StoredRubric>>,
}

impl MemoryRubricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-loaded with `rubrics`.
    pub fn with_rubrics(rubrics: impl IntoIterator<Item = StoredRubric>) -> Self {
        let map = rubrics
            .into_iter()
            .map(|r| (r.filename.clone(), r))
            .collect();
        Self {
            rubrics: Mutex::new(map),
        }
    }

    /// Insert or replace the rubric for `rubric.filename`.
    pub fn insert(&self, rubric: StoredRubric) -> StorageResult<()> {
        lock(&self.rubrics)?.insert(rubric.filename.clone(), rubric);
        Ok(())
    }
}

#[async_trait]
impl RubricStore for MemoryRubricStore {
    async fn find_rubric(&self, artifact_name: &str) -> StorageResult<Option<StoredRubric>> {
        Ok(lock(&self.rubrics)?.get(artifact_name).cloned())
    }

    async fn list_rubrics(&self) -> StorageResult<Vec<StoredRubric>> {
        Ok(lock(&self.rubrics)?.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(data: &str) -> CacheKey {
        CacheKey::derive("llm", data.as_bytes())
    }

    #[tokio::test]
    async fn set_then_get_returns_value() {
        let cache = MemoryCacheBackend::new();
        cache.set(&key("a"), serde_json::json!({"v": 1}), 60).await.unwrap();
        assert_eq!(
            cache.get(&key("a")).await.unwrap(),
            Some(serde_json::json!({"v": 1}))
        );
    }

    #[tokio::test]
    async fn expired_entry_is_not_returned_and_is_dropped() {
        let cache = MemoryCacheBackend::new();
        cache.set(&key("a"), serde_json::json!(1), 0).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key("a")).await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn set_sweeps_expired_entries_under_other_keys() {
        let cache = MemoryCacheBackend::new();
        for i in 0..5 {
            cache
                .set(&key(&format!("stale-{i}")), serde_json::json!(i), 0)
                .await
                .unwrap();
        }
        cache.set(&key("fresh"), serde_json::json!("x"), 60).await.unwrap();

        assert_eq!(cache.len(), 1);
        let stats = cache.stats().await.unwrap();
        assert_eq!((stats.live_entries, stats.expired_entries), (1, 0));
    }

    #[tokio::test]
    async fn clear_by_prefix_leaves_other_sites() {
        let cache = MemoryCacheBackend::new();
        cache.set(&CacheKey::derive("llm", b"1"), serde_json::json!(1), 60).await.unwrap();
        cache.set(&CacheKey::derive("llm", b"2"), serde_json::json!(2), 60).await.unwrap();
        cache.set(&CacheKey::derive("db", b"3"), serde_json::json!(3), 60).await.unwrap();

        assert_eq!(cache.clear(Some("llm")).await.unwrap(), 2);
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.live_entries, 1);
        assert_eq!(stats.entries_by_prefix.get("db"), Some(&1));
    }

    #[tokio::test]
    async fn stats_separates_expired_entries() {
        let cache = MemoryCacheBackend::new();
        cache.set(&key("live"), serde_json::json!(1), 60).await.unwrap();
        cache.set(&key("dead"), serde_json::json!(2), 0).await.unwrap();
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.live_entries, 1);
        assert_eq!(stats.expired_entries, 1);
    }

    #[tokio::test]
    async fn rubric_store_finds_by_filename() {
        let store = MemoryRubricStore::new();
        store
            .insert(StoredRubric {
                filename: "Lab3A.py".to_string(),
                total_points: Some(10),
                criteria: BTreeMap::from([(
                    "loops".to_string(),
                    StoredCriterion {
                        points: 10,
                        description: "uses a loop".to_string(),
                    },
                )]),
            })
            .unwrap();

        assert!(store.find_rubric("Lab3A.py").await.unwrap().is_some());
        assert!(store.find_rubric("Lab3B.py").await.unwrap().is_none());
        assert_eq!(store.list_rubrics().await.unwrap().len(), 1);
    }
}
