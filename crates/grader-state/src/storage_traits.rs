//! Storage trait definitions for the rubric grader
//!
//! These traits define the storage abstractions the pipeline consumes:
//! - `CacheBackend`: TTL-bounded key/value store for opaque JSON payloads
//! - `RubricStore`: rubric lookup by artifact name
//!
//! All traits are async and backend-agnostic. Backends must be safe for
//! concurrent reads and writes; callers add no locking of their own.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// CacheKey
// ---------------------------------------------------------------------------

/// Cache key of the form `<prefix>:<sha256 hex>`.
///
/// The prefix names the call site (`api`, `db`, `llm`) so entries can be
/// counted and cleared per site. The inner field is private to guarantee the
/// string was produced by [`CacheKey::derive`] or validated via
/// `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hash `data` with SHA-256 and tag it with `prefix`.
    pub fn derive(prefix: &str, data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        CacheKey(format!("{}:{}", prefix, hex::encode(hasher.finalize())))
    }

    /// Return the full key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Call-site prefix (everything before the first `:`).
    pub fn prefix(&self) -> &str {
        self.0.split_once(':').map(|(p, _)| p).unwrap_or("")
    }

    /// Hex digest part of the key.
    pub fn digest(&self) -> &str {
        self.0.split_once(':').map(|(_, d)| d).unwrap_or(&self.0)
    }

    /// Short form (prefix plus first 12 hex chars), for log lines.
    pub fn short(&self) -> String {
        let digest = self.digest();
        format!("{}:{}", self.prefix(), &digest[..12.min(digest.len())])
    }
}

impl TryFrom<String> for CacheKey {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        let valid = match s.split_once(':') {
            Some((prefix, digest)) => {
                !prefix.is_empty()
                    && prefix
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                    && digest.len() == 64
                    && digest.chars().all(|c| c.is_ascii_hexdigit())
            }
            None => false,
        };
        if !valid {
            return Err(StorageError::InvalidKey { key: s });
        }
        Ok(CacheKey(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// CacheEntry
// ---------------------------------------------------------------------------

/// TTLs are clamped to roughly a century so expiry arithmetic cannot overflow.
const MAX_TTL_SECONDS: i64 = 100 * 365 * 24 * 60 * 60;

/// A stored cache payload with its expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Build an entry that expires `ttl_seconds` from now.
    pub fn new(key: CacheKey, value: serde_json::Value, ttl_seconds: u64) -> Self {
        let created_at = Utc::now();
        let secs = i64::try_from(ttl_seconds)
            .unwrap_or(MAX_TTL_SECONDS)
            .min(MAX_TTL_SECONDS);
        let ttl = Duration::seconds(secs);
        let expires_at = created_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            key,
            value,
            created_at,
            expires_at,
        }
    }

    /// `true` once `now` has reached `expires_at`. A zero TTL is expired on arrival.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Point-in-time view of what a backend holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStats {
    /// Entries that would still be returned by `get`.
    pub live_entries: usize,
    /// Entries past their expiry that have not been dropped yet.
    pub expired_entries: usize,
    /// Live entries grouped by key prefix.
    pub entries_by_prefix: BTreeMap<String, usize>,
    /// Stored entries that could not be decoded.
    #[serde(default)]
    pub corrupt_entries: usize,
}

/// TTL-bounded key/value store for serialized payloads.
///
/// Guarantees:
/// - `get` never returns an entry whose TTL has elapsed.
/// - `set` overwrites any previous entry under the same key.
/// - Safe to call from many tasks at once.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch the live payload for `key`, or `None` on a miss or expiry.
    async fn get(&self, key: &CacheKey) -> StorageResult<Option<serde_json::Value>>;

    /// Store `value` under `key` for `ttl_seconds`.
    async fn set(
        &self,
        key: &CacheKey,
        value: serde_json::Value,
        ttl_seconds: u64,
    ) -> StorageResult<()>;

    /// Remove `key`. No-op if absent.
    async fn delete(&self, key: &CacheKey) -> StorageResult<()>;

    /// Remove every entry, or only those whose key prefix equals `prefix`.
    /// Returns the number of entries removed.
    async fn clear(&self, prefix: Option<&str>) -> StorageResult<usize>;

    /// Count live and expired entries.
    async fn stats(&self) -> StorageResult<BackendStats>;
}

// ---------------------------------------------------------------------------
// RubricStore
// ---------------------------------------------------------------------------

/// A single scoring criterion as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCriterion {
    pub points: u32,
    #[serde(default)]
    pub description: String,
}

/// A rubric row as persisted, keyed by the artifact (file) name it grades.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRubric {
    pub filename: String,
    /// Declared total; may disagree with the criterion sum in legacy data.
    #[serde(default)]
    pub total_points: Option<u32>,
    pub criteria: BTreeMap<String, StoredCriterion>,
}

/// Rubric lookup.
///
/// Lookups are idempotent and side-effect free, so results may be cached.
#[async_trait]
pub trait RubricStore: Send + Sync {
    /// Find the active rubric for `artifact_name`; `Ok(None)` when absent.
    async fn find_rubric(&self, artifact_name: &str) -> StorageResult<Option<StoredRubric>>;

    /// All active rubrics, ordered by filename.
    async fn list_rubrics(&self) -> StorageResult<Vec<StoredRubric>>;
}
