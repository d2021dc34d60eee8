use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::domain::BatchReport;

/// Metadata block persisted alongside the batch report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackMetadata {
    pub total_files: usize,
    pub generated_at: DateTime<Utc>,
    pub system_version: String,
}

/// Canonical feedback artifact written after a batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackArtifact {
    pub evaluation_results: BatchReport,
    pub metadata: FeedbackMetadata,
}

impl FeedbackArtifact {
    pub fn new(report: BatchReport) -> Self {
        let metadata = FeedbackMetadata {
            total_files: report.files_evaluated,
            generated_at: report.generated_at,
            system_version: crate::VERSION.to_string(),
        };
        Self {
            evaluation_results: report,
            metadata,
        }
    }
}

/// Write feedback.json in pretty JSON format.
pub fn write_feedback_json(path: &Path, report: &BatchReport) -> Result<()> {
    let artifact = FeedbackArtifact::new(report.clone());
    let content = serde_json::to_string_pretty(&artifact).context("serialize feedback artifact")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
    }
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Read a feedback.json written by [`write_feedback_json`].
pub fn read_feedback_json(path: &Path) -> Result<FeedbackArtifact> {
    let content = std::fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("parse {:?}", path))
}

/// Render a short markdown summary for terminal or PR output.
pub fn render_summary_md(report: &BatchReport) -> String {
    let mut out = String::new();
    out.push_str("# Grading Summary\n\n");
    out.push_str(&format!(
        "- files evaluated: {}\n- successful: {}\n- errors: {}\n- total points lost: {}\n- model calls: {} (cache hits: {})\n\n",
        report.files_evaluated,
        report.successful_evaluations,
        report.error_evaluations,
        report.total_points_lost,
        report.external_call_count,
        report.cache_hits,
    ));

    out.push_str("## Per File\n");
    for (name, verdict) in &report.per_artifact {
        match verdict.error_message() {
            Some(err) => out.push_str(&format!("- `{}`: error ({})\n", name, err)),
            None => out.push_str(&format!(
                "- `{}`: -{} ({} issues)\n",
                name,
                verdict.points_lost(),
                verdict.issues().len()
            )),
        }
    }

    if !report.skipped.is_empty() {
        out.push_str("\n## Skipped (no rubric)\n");
        for name in &report.skipped {
            out.push_str(&format!("- `{}`\n", name));
        }
    }

    out.push_str(&format!("\n{}\n", report.overall_feedback));
    out
}
