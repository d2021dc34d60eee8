//! Batch-level feedback.
//!
//! Pure and rule-based: the same verdict map always yields the same text.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::Verdict;

/// Known topic tags and the phrase used for them in feedback.
const TOPIC_PHRASES: &[(&str, &str)] = &[
    ("array_handling", "array handling"),
    ("arrays", "array handling"),
    ("list_handling", "array handling"),
    ("loop_control", "loop implementation"),
    ("loops", "loop implementation"),
    ("loop_exit", "loop exit conditions"),
    ("variable_scope", "variable usage"),
    ("variables", "variable usage"),
    ("variable_naming", "variable naming"),
    ("variable_initialization", "variable initialization"),
    ("functions", "function implementation"),
    ("function_definition", "function implementation"),
    ("conditionals", "conditional logic"),
    ("conditional_logic", "conditional logic"),
    ("calculations", "mathematical calculations"),
    ("math", "mathematical calculations"),
    ("input_output", "input and output handling"),
    ("input_handling", "input handling"),
    ("output_formatting", "output formatting"),
    ("syntax", "syntax errors"),
];

/// Human-readable phrase for a topic tag. Unknown tags have underscores
/// replaced by spaces.
pub fn topic_phrase(tag: &str) -> String {
    let normalized = tag.trim().to_ascii_lowercase();
    TOPIC_PHRASES
        .iter()
        .find(|(known, _)| *known == normalized)
        .map(|(_, phrase)| phrase.to_string())
        .unwrap_or_else(|| normalized.replace('_', " "))
}

/// Batch totals and the narrative summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub total_points_lost: u32,
    pub overall_feedback: String,
}

/// Fold per-artifact verdicts into points and feedback.
///
/// Rules, first match wins:
/// 1. any error verdict: count errors
/// 2. every verdict clean: praise
/// 3. no verdict clean: all need improvement
/// 4. mixed: name the lacking topics, or count labs when no tags exist
pub fn aggregate(verdicts: &BTreeMap<String, Verdict>) -> Aggregate {
    let total_points_lost = verdicts
        .values()
        .filter(|v| !v.is_error())
        .fold(0u32, |acc, v| acc.saturating_add(v.points_lost()));

    let overall_feedback = feedback(verdicts, total_points_lost);
    Aggregate {
        total_points_lost,
        overall_feedback,
    }
}

fn feedback(verdicts: &BTreeMap<String, Verdict>, n: u32) -> String {
    if verdicts.is_empty() {
        return "No labs were evaluated.".to_string();
    }

    let errors = verdicts.values().filter(|v| v.is_error()).count();
    if errors > 0 {
        return format!("Student has evaluation errors in {errors} labs. Total points lost: {n}.");
    }

    let clean = verdicts.values().filter(|v| v.is_clean()).count();
    if clean == verdicts.len() {
        return "Student has completed all labs perfectly. Excellent work!".to_string();
    }
    if clean == 0 {
        return format!("Student needs improvement in all labs. Total points lost: {n}.");
    }

    let phrases: BTreeSet<String> = verdicts
        .values()
        .filter(|v| !v.is_clean())
        .flat_map(|v| v.topics_lacking().iter())
        .map(|tag| topic_phrase(tag))
        .filter(|p| !p.is_empty())
        .collect();

    if phrases.is_empty() {
        let needs_work = verdicts.len() - clean;
        format!(
            "Student has done well in {clean} labs but needs improvement in {needs_work} labs. Total points lost: {n}."
        )
    } else {
        let joined = phrases.into_iter().collect::<Vec<_>>().join(", ");
        format!("Student needs improvement in {joined}. Total points lost: {n}.")
    }
}
