//! Prompt construction.
//!
//! Only the contract matters to the rest of the pipeline: every prompt asks
//! for the JSON shape [`crate::parser`] decodes. Each evaluator and pass
//! puts its own label in the user message, because the model-call cache
//! keys on that message and independent opinions must not collapse into one
//! cache entry.

use std::fmt::Write as _;

use serde_json::json;

use crate::domain::{Outcome, RawVerdict, Rubric};
use crate::model::ChatMessage;

const RESPONSE_FORMAT: &str = r#"Respond in this exact JSON format:
{
    "status": "success",
    "result": "correct" OR {
        "issues": [
            {"issue": "specific programming issue found", "points": -X}
        ]
    },
    "topics_lacking": ["array_handling", "loop_control", "variable_scope"],
    "summary": "2-3 sentence summary focusing on programming topics the student needs to improve"
}

If the code is correct, use "correct". If there are issues, list the specific programming problems you find in the actual code."#;

const EVALUATION_RULES: &str = "Evaluation rules:
1. No deductions for missing input validation
2. No deductions for extra code or preprocessing steps
3. No deductions for formatting or comments
4. Focus only on core programming concepts: arrays, loops, variables, functions, conditionals, calculations, input/output
5. Only deduct points for fundamental programming errors";

/// Which half of a double-pass evaluation a prompt is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Initial,
    DoubleCheck,
}

/// Rubric-and-code prompt shared by every opinion and pass.
pub fn evaluation_prompt(artifact: &str, content: &str, rubric: &Rubric) -> String {
    let mut criteria = String::new();
    for (name, c) in rubric.criteria() {
        let _ = writeln!(criteria, "- {name}: {} points - {}", c.points, c.description);
    }
    format!(
        "Evaluate the Python file '{artifact}' using these criteria:\n\n{criteria}\n\
         Total possible points: {total}\n\n\
         Code to evaluate:\n{content}\n\n{EVALUATION_RULES}\n\n{RESPONSE_FORMAT}",
        total = rubric.total_points(),
    )
}

/// Messages for independent opinion number `index` (1-based).
pub fn opinion_messages(index: usize, artifact: &str, content: &str, rubric: &Rubric) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(format!(
            "You are evaluator_{index}, a beginner-friendly code evaluator. Focus on core programming concepts only."
        )),
        ChatMessage::user(format!(
            "[evaluator_{index}]\n{}",
            evaluation_prompt(artifact, content, rubric)
        )),
    ]
}

/// Messages for one half of a double-pass evaluation.
pub fn pass_messages(pass: Pass, artifact: &str, content: &str, rubric: &Rubric) -> Vec<ChatMessage> {
    let (label, instruction) = match pass {
        Pass::Initial => ("initial", "Grade the submission."),
        Pass::DoubleCheck => (
            "double_check",
            "This is a second, independent review. Re-read the code line by line and report every issue you can justify.",
        ),
    };
    vec![
        ChatMessage::system("You are a careful, beginner-friendly code evaluator."),
        ChatMessage::user(format!(
            "[{label}] {instruction}\n{}",
            evaluation_prompt(artifact, content, rubric)
        )),
    ]
}

/// Wire form of an opinion, in the same shape the model is asked to produce.
pub fn opinion_json(opinion: &RawVerdict) -> serde_json::Value {
    let result = match &opinion.outcome {
        Outcome::Correct => json!("correct"),
        Outcome::Issues { issues } => json!({
            "issues": issues
                .iter()
                .map(|i| json!({"issue": i.description, "points": -i64::from(i.points_deducted)}))
                .collect::<Vec<_>>()
        }),
        Outcome::Unparseable { raw } => json!({"unparsed": raw}),
    };
    json!({
        "status": "success",
        "result": result,
        "topics_lacking": opinion.topics_lacking,
        "summary": opinion.summary,
    })
}

/// Messages asking the adjudicator to merge `opinions` into one verdict.
pub fn adjudicator_messages(artifact: &str, rubric: &Rubric, opinions: &[RawVerdict]) -> Vec<ChatMessage> {
    let evaluations: Vec<_> = opinions.iter().map(opinion_json).collect();
    let evaluations =
        serde_json::to_string_pretty(&evaluations).unwrap_or_else(|_| "[]".to_string());
    vec![
        ChatMessage::system(
            "You are the final evaluator. Combine evaluations and focus on programming topics.",
        ),
        ChatMessage::user(format!(
            "[adjudicator]\nReview these {count} evaluations for '{artifact}' (total possible points: {total}) \
             and provide the final result.\n\nEvaluations:\n{evaluations}\n\n\
             Combine the evaluations and identify the specific programming issues found in the code.\n\n{RESPONSE_FORMAT}",
            count = opinions.len(),
            total = rubric.total_points(),
        )),
    ]
}
