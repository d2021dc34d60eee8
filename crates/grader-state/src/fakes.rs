//! Failing backends for degradation tests
//!
//! The grading pipeline must keep producing verdicts when the cache or the
//! rubric store misbehaves. These fakes make each failure mode reproducible.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::memory::MemoryCacheBackend;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// UnavailableCacheBackend
// ---------------------------------------------------------------------------

/// Cache whose every operation fails with [`StorageError::Unavailable`].
#[derive(Debug, Default)]
pub struct UnavailableCacheBackend {
    calls: AtomicUsize,
}

impl UnavailableCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many operations were attempted against this backend.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn fail<T>(&self) -> StorageResult<T> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Err(StorageError::Unavailable("connection refused".to_string()))
    }
}

#[async_trait]
impl CacheBackend for UnavailableCacheBackend {
    async fn get(&self, _key: &CacheKey) -> StorageResult<Option<serde_json::Value>> {
        self.fail()
    }

    async fn set(
        &self,
        _key: &CacheKey,
        _value: serde_json::Value,
        _ttl_seconds: u64,
    ) -> StorageResult<()> {
        self.fail()
    }

    async fn delete(&self, _key: &CacheKey) -> StorageResult<()> {
        self.fail()
    }

    async fn clear(&self, _prefix: Option<&str>) -> StorageResult<usize> {
        self.fail()
    }

    async fn stats(&self) -> StorageResult<BackendStats> {
        self.fail()
    }
}

// ---------------------------------------------------------------------------
// WriteFailingCacheBackend
// ---------------------------------------------------------------------------

/// Reads succeed against an inner memory backend; every `set` fails.
#[derive(Debug, Default)]
pub struct WriteFailingCacheBackend {
    inner: MemoryCacheBackend,
    failed_writes: AtomicUsize,
}

impl WriteFailingCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-seeded through `inner`, so reads can hit.
    pub fn with_inner(inner: MemoryCacheBackend) -> Self {
        Self {
            inner,
            failed_writes: AtomicUsize::new(0),
        }
    }

    pub fn failed_writes(&self) -> usize {
        self.failed_writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CacheBackend for WriteFailingCacheBackend {
    async fn get(&self, key: &CacheKey) -> StorageResult<Option<serde_json::Value>> {
        self.inner.get(key).await
    }

    async fn set(
        &self,
        _key: &CacheKey,
        _value: serde_json::Value,
        _ttl_seconds: u64,
    ) -> StorageResult<()> {
        self.failed_writes.fetch_add(1, Ordering::Relaxed);
        Err(StorageError::Backend("disk full".to_string()))
    }

    async fn delete(&self, key: &CacheKey) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn clear(&self, prefix: Option<&str>) -> StorageResult<usize> {
        self.inner.clear(prefix).await
    }

    async fn stats(&self) -> StorageResult<BackendStats> {
        self.inner.stats().await
    }
}

// ---------------------------------------------------------------------------
// FailingRubricStore
// ---------------------------------------------------------------------------

/// Rubric store that cannot be reached.
#[derive(Debug, Default)]
pub struct FailingRubricStore;

#[async_trait]
impl RubricStore for FailingRubricStore {
    async fn find_rubric(&self, _artifact_name: &str) -> StorageResult<Option<StoredRubric>> {
        Err(StorageError::Unavailable("rubric table offline".to_string()))
    }

    async fn list_rubrics(&self) -> StorageResult<Vec<StoredRubric>> {
        Err(StorageError::Unavailable("rubric table offline".to_string()))
    }
}
