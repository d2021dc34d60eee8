//! Domain-level error taxonomy for the grader.

use grader_state::StorageError;

/// Grader domain errors.
///
/// None of these escape `Orchestrator::evaluate_batch`; they surface from
/// loading inputs (rubrics, config, submissions) and from the storage seam.
#[derive(Debug, thiserror::Error)]
pub enum GraderError {
    #[error("invalid rubric for {name}: {reason}")]
    InvalidRubric { name: String, reason: String },

    #[error("cache arguments not canonicalizable: {0}")]
    InvalidCacheArgs(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for grader domain operations.
pub type Result<T> = std::result::Result<T, GraderError>;
