//! Domain models for the grader.
//!
//! Canonical definitions for the core entities:
//! - `Rubric` / `RubricSet`: validated scoring criteria per artifact
//! - `RawVerdict`: one parsed model response
//! - `Verdict`: reconciled per-artifact result
//! - `BatchReport`: the outcome of one batch

pub mod digest;
pub mod error;
pub mod report;
pub mod rubric;
pub mod verdict;

pub use error::{GraderError, Result};
pub use report::BatchReport;
pub use rubric::{Criterion, Rubric, RubricSet};
pub use verdict::{Issue, Outcome, RawVerdict, TokenUsage, Verdict, VerdictStatus};
