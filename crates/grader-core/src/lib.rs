//! Rubric Grader Core Library
//!
//! Consensus grading of submitted code: artifacts fan out over a bounded
//! worker pool, each is judged by several model calls reconciled into one
//! verdict, and the batch is summarized into feedback. Model calls and
//! rubric lookups go through a content-addressed cache.

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod consensus;
pub mod domain;
pub mod model;
pub mod obs;
pub mod orchestrator;
pub mod parser;
pub mod prompt;
pub mod reporting;
pub mod rubric_store;
pub mod submission;
pub mod telemetry;

/// Crate version, recorded in persisted reports.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use domain::{
    BatchReport, Criterion, GraderError, Issue, Outcome, RawVerdict, Result, Rubric, RubricSet,
    TokenUsage, Verdict, VerdictStatus,
};

pub use aggregator::{aggregate, topic_phrase, Aggregate};
pub use cache::{
    CacheInsight, CacheLayer, CacheMetrics, CacheMetricsSnapshot, CacheSite, CacheTtls, Cached,
};
pub use config::GraderConfig;
pub use consensus::{select_double_pass, ArtifactEvaluation, ConsensusEngine, ConsensusPolicy};
pub use model::{
    prompt_content, CachedModelClient, ChatMessage, ModelCallResult, ModelClient, ModelConfig,
    ModelError, ModelReply, OpenAiClient, Role,
};
pub use orchestrator::Orchestrator;
pub use parser::parse;
pub use reporting::{read_feedback_json, render_summary_md, write_feedback_json, FeedbackArtifact};
pub use rubric_store::CachedRubricStore;
pub use submission::parse_submission;

pub use grader_state::{
    CacheBackend, FsCacheBackend, MemoryCacheBackend, MemoryRubricStore, RubricStore, StoredRubric,
};
