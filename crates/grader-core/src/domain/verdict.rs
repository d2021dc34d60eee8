//! Per-call and per-artifact evaluation results.

use std::collections::BTreeSet;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// A single deduction found in an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub description: String,
    /// Always non-negative; the sign reported by the model is dropped at parse time.
    pub points_deducted: u32,
}

impl Issue {
    pub fn new(description: impl Into<String>, points_deducted: u32) -> Self {
        Self {
            description: description.into(),
            points_deducted,
        }
    }
}

/// Token accounting for one or more model calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            total: input + output,
        }
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: Self) -> Self::Output {
        TokenUsage {
            input: self.input + rhs.input,
            output: self.output + rhs.output,
            total: self.total + rhs.total,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// What one model response said about an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// The artifact meets the rubric.
    Correct,
    /// One or more deductions.
    Issues { issues: Vec<Issue> },
    /// Nothing interpretable, or the model declared an error. Carries the raw text.
    Unparseable { raw: String },
}

/// Parsed output of one model call. Ephemeral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawVerdict {
    pub outcome: Outcome,
    #[serde(default)]
    pub topics_lacking: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl RawVerdict {
    pub fn correct() -> Self {
        Self {
            outcome: Outcome::Correct,
            topics_lacking: Vec::new(),
            summary: None,
        }
    }

    /// Issues-shaped verdict. An empty list collapses to [`Outcome::Correct`].
    pub fn with_issues(issues: Vec<Issue>) -> Self {
        let outcome = if issues.is_empty() {
            Outcome::Correct
        } else {
            Outcome::Issues { issues }
        };
        Self {
            outcome,
            topics_lacking: Vec::new(),
            summary: None,
        }
    }

    pub fn unparseable(raw: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Unparseable { raw: raw.into() },
            topics_lacking: Vec::new(),
            summary: None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Unparseable { .. })
    }

    pub fn is_correct(&self) -> bool {
        matches!(self.outcome, Outcome::Correct)
    }

    pub fn issues(&self) -> &[Issue] {
        match &self.outcome {
            Outcome::Issues { issues } => issues,
            _ => &[],
        }
    }

    pub fn issue_count(&self) -> usize {
        self.issues().len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictStatus {
    Success,
    Error,
}

/// Reconciled result for one artifact.
///
/// `points_lost` is the sum of `issues[].points_deducted` on success; an
/// error verdict has no issues and loses no points. The only constructors
/// are [`Verdict::success`], [`Verdict::error`] and [`Verdict::from_raw`],
/// and deserialization re-checks the same rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "VerdictRecord")]
pub struct Verdict {
    status: VerdictStatus,
    issues: Vec<Issue>,
    points_lost: u32,
    topics_lacking: BTreeSet<String>,
    evaluation_time_seconds: f64,
    tokens_used: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Verdict {
    pub fn success(
        issues: Vec<Issue>,
        topics_lacking: impl IntoIterator<Item = String>,
        summary: Option<String>,
    ) -> Self {
        let points_lost = issues
            .iter()
            .fold(0u32, |acc, i| acc.saturating_add(i.points_deducted));
        Self {
            status: VerdictStatus::Success,
            issues,
            points_lost,
            topics_lacking: topics_lacking
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            evaluation_time_seconds: 0.0,
            tokens_used: TokenUsage::default(),
            summary,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: VerdictStatus::Error,
            issues: Vec::new(),
            points_lost: 0,
            topics_lacking: BTreeSet::new(),
            evaluation_time_seconds: 0.0,
            tokens_used: TokenUsage::default(),
            summary: None,
            error: Some(message.into()),
        }
    }

    /// Promote a parsed model response to a verdict.
    pub fn from_raw(raw: RawVerdict) -> Self {
        match raw.outcome {
            Outcome::Correct => Self::success(Vec::new(), raw.topics_lacking, raw.summary),
            Outcome::Issues { issues } => Self::success(issues, raw.topics_lacking, raw.summary),
            Outcome::Unparseable { raw } => {
                Self::error(format!("model output not interpretable: {}", excerpt(&raw)))
            }
        }
    }

    pub fn with_timing(mut self, seconds: f64) -> Self {
        self.evaluation_time_seconds = seconds;
        self
    }

    pub fn with_tokens(mut self, tokens: TokenUsage) -> Self {
        self.tokens_used = tokens;
        self
    }

    pub fn status(&self) -> VerdictStatus {
        self.status
    }

    pub fn is_error(&self) -> bool {
        self.status == VerdictStatus::Error
    }

    /// Success with no deductions.
    pub fn is_clean(&self) -> bool {
        self.status == VerdictStatus::Success && self.issues.is_empty()
    }

    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }

    pub fn points_lost(&self) -> u32 {
        self.points_lost
    }

    pub fn topics_lacking(&self) -> &BTreeSet<String> {
        &self.topics_lacking
    }

    pub fn evaluation_time_seconds(&self) -> f64 {
        self.evaluation_time_seconds
    }

    pub fn tokens_used(&self) -> TokenUsage {
        self.tokens_used
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

fn excerpt(raw: &str) -> String {
    const MAX: usize = 120;
    let trimmed = raw.trim();
    match trimmed.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[derive(Deserialize)]
struct VerdictRecord {
    status: VerdictStatus,
    #[serde(default)]
    issues: Vec<Issue>,
    points_lost: u32,
    #[serde(default)]
    topics_lacking: BTreeSet<String>,
    #[serde(default)]
    evaluation_time_seconds: f64,
    #[serde(default)]
    tokens_used: TokenUsage,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl TryFrom<VerdictRecord> for Verdict {
    type Error = String;

    fn try_from(r: VerdictRecord) -> std::result::Result<Self, Self::Error> {
        let verdict = match r.status {
            VerdictStatus::Success => {
                Verdict::success(r.issues, r.topics_lacking, r.summary)
            }
            VerdictStatus::Error => {
                if !r.issues.is_empty() {
                    return Err("error verdict must not carry issues".to_string());
                }
                Verdict::error(r.error.unwrap_or_default())
            }
        };
        if verdict.points_lost != r.points_lost {
            return Err(format!(
                "points_lost {} does not match issue total {}",
                r.points_lost, verdict.points_lost
            ));
        }
        Ok(verdict
            .with_timing(r.evaluation_time_seconds)
            .with_tokens(r.tokens_used))
    }
}
