//! Content-addressed cache wrapper with per-call insights.
//!
//! A [`CacheLayer`] binds one [`CacheBackend`] to one [`CacheSite`]. The
//! three sites (HTTP responses, rubric-store queries, model calls) each get
//! their own layer, key prefix, TTL and counters, and may share a backend.
//!
//! The wrapper never fails because of the cache: a backend that is down or
//! returns garbage is bypassed and the operation runs directly, with
//! `insight.error` set.

pub mod metrics;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use grader_state::{CacheBackend, CacheKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::digest::canonical_json;
use crate::obs::emit_cache_lookup;

pub use metrics::{CacheMetrics, CacheMetricsSnapshot};

/// Which call site a cache layer serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSite {
    /// Request/response caching.
    Response,
    /// Persistent-store lookups.
    Query,
    /// External model calls.
    ModelCall,
}

impl CacheSite {
    pub const ALL: [CacheSite; 3] = [CacheSite::Response, CacheSite::Query, CacheSite::ModelCall];

    /// Key prefix for entries written through this site.
    pub fn prefix(&self) -> &'static str {
        match self {
            CacheSite::Response => "api",
            CacheSite::Query => "db",
            CacheSite::ModelCall => "llm",
        }
    }

    pub fn default_ttl_seconds(&self) -> u64 {
        match self {
            CacheSite::Response => 600,
            CacheSite::Query => 1800,
            CacheSite::ModelCall => 3600,
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.prefix() == prefix)
    }
}

impl std::fmt::Display for CacheSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Per-site TTLs in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtls {
    pub response: u64,
    pub query: u64,
    pub model_call: u64,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            response: CacheSite::Response.default_ttl_seconds(),
            query: CacheSite::Query.default_ttl_seconds(),
            model_call: CacheSite::ModelCall.default_ttl_seconds(),
        }
    }
}

impl CacheTtls {
    pub fn for_site(&self, site: CacheSite) -> u64 {
        match site {
            CacheSite::Response => self.response,
            CacheSite::Query => self.query,
            CacheSite::ModelCall => self.model_call,
        }
    }
}

/// What happened to the cache during one wrapped operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheInsight {
    pub site: CacheSite,
    pub hit: bool,
    pub miss: bool,
    pub set: bool,
    pub error: bool,
    /// Full cache key; empty when no key could be derived.
    pub key: String,
    pub ttl_seconds: u64,
    /// Wall time of the whole wrapped call, cache round-trips included.
    pub latency_ms: u64,
}

impl CacheInsight {
    fn new(site: CacheSite, key: String, ttl_seconds: u64) -> Self {
        Self {
            site,
            hit: false,
            miss: false,
            set: false,
            error: false,
            key,
            ttl_seconds,
            latency_ms: 0,
        }
    }
}

/// A value plus the insight describing how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub insight: CacheInsight,
}

/// Cache wrapper for one call site.
///
/// Cloning is cheap; clones share the backend and the counters.
#[derive(Clone)]
pub struct CacheLayer {
    backend: Arc<dyn CacheBackend>,
    site: CacheSite,
    ttl_seconds: u64,
    metrics: Arc<CacheMetrics>,
}

impl CacheLayer {
    /// Layer for `site` with that site's default TTL.
    pub fn new(backend: Arc<dyn CacheBackend>, site: CacheSite) -> Self {
        Self {
            backend,
            site,
            ttl_seconds: site.default_ttl_seconds(),
            metrics: Arc::new(CacheMetrics::new()),
        }
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    pub fn site(&self) -> CacheSite {
        self.site
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Key over `"{site}:{operation_id}:" + canonical JSON(args)`.
    pub fn derive_key<A: Serialize + ?Sized>(
        &self,
        operation_id: &str,
        args: &A,
    ) -> crate::domain::Result<CacheKey> {
        let value = serde_json::to_value(args)?;
        let canonical = canonical_json(&value)?;
        Ok(self.key_for(operation_id, &canonical))
    }

    /// Key over `"{site}:{operation_id}:" + prompt`.
    pub fn prompt_key(&self, operation_id: &str, prompt: &str) -> CacheKey {
        self.key_for(operation_id, prompt)
    }

    fn key_for(&self, operation_id: &str, payload: &str) -> CacheKey {
        let material = format!("{}:{}:{}", self.site.prefix(), operation_id, payload);
        CacheKey::derive(self.site.prefix(), material.as_bytes())
    }

    /// Run `f` through the cache, keyed by `operation_id` and `args`.
    ///
    /// Hit: `f` is not run. Miss: `f` runs and a successful result is
    /// stored. Errors from `f` come back unchanged and are never stored.
    pub async fn with_cache<T, A, F, Fut, E>(
        &self,
        operation_id: &str,
        args: &A,
        f: F,
    ) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned,
        A: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.with_cache_if(operation_id, args, f, |_| true).await
    }

    /// [`with_cache`](Self::with_cache), storing only results for which
    /// `should_store` returns `true`.
    pub async fn with_cache_if<T, A, F, Fut, E>(
        &self,
        operation_id: &str,
        args: &A,
        f: F,
        should_store: impl FnOnce(&T) -> bool,
    ) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned,
        A: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = match self.derive_key(operation_id, args) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(site = %self.site, operation_id, error = %e, "cache key derivation failed; bypassing cache");
                None
            }
        };
        self.run(key, f, should_store).await
    }

    /// Cache keyed on prompt text rather than structured arguments.
    ///
    /// Two calls with the same prompt are equivalent regardless of any
    /// bookkeeping around them.
    pub async fn with_prompt_cache<T, F, Fut, E>(
        &self,
        operation_id: &str,
        prompt: &str,
        f: F,
        should_store: impl FnOnce(&T) -> bool,
    ) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = self.prompt_key(operation_id, prompt);
        self.run(Some(key), f, should_store).await
    }

    async fn run<T, F, Fut, E>(
        &self,
        key: Option<CacheKey>,
        f: F,
        should_store: impl FnOnce(&T) -> bool,
    ) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let key_str = key.as_ref().map(|k| k.to_string()).unwrap_or_default();
        let mut insight = CacheInsight::new(self.site, key_str, self.ttl_seconds);

        let Some(key) = key else {
            insight.error = true;
            self.metrics.inc_errors();
            let value = f().await?;
            return Ok(self.finish(value, insight, started));
        };

        let mut store = true;
        match self.backend.get(&key).await {
            Ok(Some(payload)) => match serde_json::from_value::<T>(payload) {
                Ok(value) => {
                    insight.hit = true;
                    self.metrics.inc_hits();
                    return Ok(self.finish(value, insight, started));
                }
                Err(e) => {
                    // Undecodable entry: recompute and overwrite it.
                    warn!(site = %self.site, key = %key.short(), error = %e, "cached payload undecodable");
                    insight.miss = true;
                    insight.error = true;
                    self.metrics.inc_misses();
                    self.metrics.inc_errors();
                }
            },
            Ok(None) => {
                insight.miss = true;
                self.metrics.inc_misses();
            }
            Err(e) => {
                warn!(site = %self.site, key = %key.short(), error = %e, "cache lookup failed; bypassing cache");
                insight.error = true;
                self.metrics.inc_errors();
                store = false;
            }
        }

        let value = f().await?;

        if store && should_store(&value) {
            match serde_json::to_value(&value) {
                Ok(payload) => match self.backend.set(&key, payload, self.ttl_seconds).await {
                    Ok(()) => {
                        insight.set = true;
                        self.metrics.inc_sets();
                    }
                    Err(e) => {
                        warn!(site = %self.site, key = %key.short(), error = %e, "cache store failed");
                        insight.error = true;
                        self.metrics.inc_errors();
                    }
                },
                Err(e) => {
                    warn!(site = %self.site, key = %key.short(), error = %e, "result not serializable; not cached");
                    insight.error = true;
                    self.metrics.inc_errors();
                }
            }
        }

        Ok(self.finish(value, insight, started))
    }

    fn finish<T>(&self, value: T, mut insight: CacheInsight, started: Instant) -> Cached<T> {
        insight.latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        emit_cache_lookup(
            self.site.prefix(),
            &insight.key,
            insight.hit,
            insight.error,
            insight.latency_ms,
        );
        Cached { value, insight }
    }
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("site", &self.site)
            .field("ttl_seconds", &self.ttl_seconds)
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grader_state::fakes::{UnavailableCacheBackend, WriteFailingCacheBackend};
    use grader_state::MemoryCacheBackend;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn layer(site: CacheSite) -> CacheLayer {
        CacheLayer::new(Arc::new(MemoryCacheBackend::new()), site)
    }

    #[tokio::test]
    async fn second_identical_call_is_a_hit() {
        let cache = layer(CacheSite::Query);
        let runs = AtomicUsize::new(0);
        let counter = &runs;
        let op = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(vec![1u32, 2, 3])
        };

        let first = cache.with_cache("find_rubric", &"Lab3A.py", op).await.unwrap();
        let second = cache.with_cache("find_rubric", &"Lab3A.py", op).await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(first.insight.miss && first.insight.set && !first.insight.hit);
        assert!(second.insight.hit && !second.insight.miss);
        assert_eq!(second.value, vec![1, 2, 3]);
        assert_eq!(first.insight.key, second.insight.key);
        assert!(first.insight.key.starts_with("db:"));
    }

    #[tokio::test]
    async fn argument_key_order_does_not_matter() {
        let cache = layer(CacheSite::Response);
        let a = serde_json::json!({"x": 1, "y": 2.0});
        let b = serde_json::json!({"y": 2, "x": 1});
        assert_eq!(
            cache.derive_key("op", &a).unwrap(),
            cache.derive_key("op", &b).unwrap()
        );
        assert_ne!(
            cache.derive_key("op", &a).unwrap(),
            cache.derive_key("other_op", &a).unwrap()
        );
    }

    #[tokio::test]
    async fn unavailable_backend_still_returns_value() {
        let cache = CacheLayer::new(Arc::new(UnavailableCacheBackend::new()), CacheSite::ModelCall);
        let out = cache
            .with_cache("call", &1, || async { Ok::<_, Infallible>("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(out.value, "fresh");
        assert!(out.insight.error);
        assert!(!out.insight.hit && !out.insight.set);
        assert_eq!(cache.metrics().snapshot().errors, 1);
    }

    #[tokio::test]
    async fn store_failure_keeps_fresh_value() {
        let cache = CacheLayer::new(Arc::new(WriteFailingCacheBackend::new()), CacheSite::Query);
        let out = cache
            .with_cache("op", &"k", || async { Ok::<_, Infallible>(42u32) })
            .await
            .unwrap();
        assert_eq!(out.value, 42);
        assert!(out.insight.miss);
        assert!(out.insight.error);
        assert!(!out.insight.set);
    }

    #[tokio::test]
    async fn operation_errors_propagate_and_are_not_stored() {
        let backend = Arc::new(MemoryCacheBackend::new());
        let cache = CacheLayer::new(backend.clone(), CacheSite::Response);
        let err = cache
            .with_cache("op", &"k", || async { Err::<u32, _>("upstream 500") })
            .await
            .unwrap_err();
        assert_eq!(err, "upstream 500");
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn with_cache_if_declines_storage() {
        let backend = Arc::new(MemoryCacheBackend::new());
        let cache = CacheLayer::new(backend.clone(), CacheSite::ModelCall);
        let out = cache
            .with_cache_if(
                "op",
                &"k",
                || async { Ok::<_, Infallible>(String::new()) },
                |v: &String| !v.is_empty(),
            )
            .await
            .unwrap();
        assert!(out.insight.miss && !out.insight.set && !out.insight.error);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn undecodable_payload_is_recomputed_and_overwritten() {
        let backend = Arc::new(MemoryCacheBackend::new());
        let cache = CacheLayer::new(backend.clone(), CacheSite::Query);
        let key = cache.derive_key("op", &"k").unwrap();
        backend
            .set(&key, serde_json::json!({"not": "a number"}), 60)
            .await
            .unwrap();

        let out = cache
            .with_cache("op", &"k", || async { Ok::<_, Infallible>(7u32) })
            .await
            .unwrap();
        assert_eq!(out.value, 7);
        assert!(out.insight.error && out.insight.set);

        let again = cache
            .with_cache("op", &"k", || async { Ok::<_, Infallible>(0u32) })
            .await
            .unwrap();
        assert!(again.insight.hit);
        assert_eq!(again.value, 7);
    }

    #[tokio::test]
    async fn corrupt_fs_entry_is_recomputed_once() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(grader_state::FsCacheBackend::new(dir.path()).unwrap());
        let cache = CacheLayer::new(backend.clone(), CacheSite::ModelCall);
        let key = cache.derive_key("chat", &"prompt").unwrap();
        let digest = key.digest();
        let path = dir
            .path()
            .join("entries")
            .join(key.prefix())
            .join(&digest[..2])
            .join(format!("{}.json", &digest[2..]));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"garbage").unwrap();

        let runs = AtomicUsize::new(0);
        let counter = &runs;
        let mut insights = Vec::new();
        for _ in 0..3 {
            let out = cache
                .with_cache("chat", &"prompt", move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>("reply".to_string())
                })
                .await
                .unwrap();
            assert_eq!(out.value, "reply");
            insights.push(out.insight);
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(insights[0].miss && insights[0].set && !insights[0].error);
        assert!(insights[1].hit && insights[2].hit);
        let stats = backend.stats().await.unwrap();
        assert_eq!((stats.live_entries, stats.corrupt_entries), (1, 0));
    }

    #[tokio::test]
    async fn prompt_cache_keys_on_prompt_text_only() {
        let cache = layer(CacheSite::ModelCall);
        let first = cache
            .with_prompt_cache("chat", "grade this", || async { Ok::<_, Infallible>(1u8) }, |_| true)
            .await
            .unwrap();
        let second = cache
            .with_prompt_cache("chat", "grade this", || async { Ok::<_, Infallible>(2u8) }, |_| true)
            .await
            .unwrap();
        assert!(second.insight.hit);
        assert_eq!(second.value, 1);
        assert!(first.insight.key.starts_with("llm:"));
    }

    #[tokio::test]
    async fn unserializable_args_bypass_cache() {
        let cache = layer(CacheSite::Response);
        // JSON object keys must be strings.
        let mut bad = std::collections::HashMap::new();
        bad.insert(vec![1u8], 2u8);
        let out = cache
            .with_cache("op", &bad, || async { Ok::<_, Infallible>(3u8) })
            .await
            .unwrap();
        assert_eq!(out.value, 3);
        assert!(out.insight.error);
        assert!(out.insight.key.is_empty());
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let cache = layer(CacheSite::Query).with_ttl(0);
        let runs = AtomicUsize::new(0);
        let counter = &runs;
        for _ in 0..2 {
            cache
                .with_cache("op", &"k", move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(1u8)
                })
                .await
                .unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn site_prefixes_and_ttls() {
        assert_eq!(CacheSite::Response.prefix(), "api");
        assert_eq!(CacheSite::Query.default_ttl_seconds(), 1800);
        assert_eq!(CacheSite::from_prefix("llm"), Some(CacheSite::ModelCall));
        assert_eq!(CacheTtls::default().for_site(CacheSite::ModelCall), 3600);
    }
}
