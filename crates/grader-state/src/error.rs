//! Error types for grader-state

use thiserror::Error;

/// Errors surfaced by cache backends and rubric stores.
///
/// Callers in the grading pipeline treat every variant as recoverable: a
/// cache error means "bypass the cache", a store error means "skip the
/// artifact".
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend cannot be reached at all (connection refused, disk gone, ...)
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    /// Key is not `<prefix>:<64 hex chars>`
    #[error("invalid cache key: {key}")]
    InvalidKey { key: String },

    /// Backend-internal failure (poisoned lock, corrupt entry, ...)
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
