use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::verdict::{TokenUsage, Verdict};

/// Outcome of one `evaluate_batch` call.
///
/// Built once by the orchestrator after every task has finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub per_artifact: BTreeMap<String, Verdict>,
    /// Artifacts dropped because no rubric matched their name.
    pub skipped: Vec<String>,
    pub total_points_lost: u32,
    pub overall_feedback: String,
    pub files_evaluated: usize,
    pub successful_evaluations: usize,
    pub error_evaluations: usize,
    pub aggregate_tokens: TokenUsage,
    /// Model calls that actually left the process (cache misses and bypasses).
    pub external_call_count: u64,
    /// Model calls answered from the cache.
    pub cache_hits: u64,
    pub evaluation_time_seconds: f64,
    pub generated_at: DateTime<Utc>,
}

impl BatchReport {
    pub fn verdict(&self, artifact: &str) -> Option<&Verdict> {
        self.per_artifact.get(artifact)
    }

    /// `true` when every evaluated artifact came back without error.
    pub fn all_succeeded(&self) -> bool {
        self.error_evaluations == 0
    }
}
