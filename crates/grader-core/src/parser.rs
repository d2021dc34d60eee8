//! Resilient model-response parser.
//!
//! [`parse`] turns whatever text came back from the model into a
//! [`RawVerdict`]. It is pure and total: malformed JSON falls back to a line
//! heuristic, and text with nothing interpretable in it becomes
//! [`Outcome::Unparseable`] carrying the raw input.
//!
//! Expected shape:
//!
//! ```json
//! {
//!   "status": "success",
//!   "result": "correct" | {"issues": [{"issue": "...", "points": -2}]},
//!   "topics_lacking": ["loop_control"],
//!   "summary": "..."
//! }
//! ```

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::domain::{Issue, Outcome, RawVerdict};

/// Deduction applied when a heuristic issue line carries no number.
pub const DEFAULT_DEDUCTION: u32 = 2;

static CORRECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bcorrect\b").expect("correct-token regex"));

/// `-3 points`, `2 pts`, `(-1.5 point)`
static POINTS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\(?\s*([+-]?\d+(?:\.\d+)?)\s*(?:points?|pts?)\b\s*\)?")
        .expect("points regex")
});

/// `--> -3`, `=> 2`
static ARROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:-->|=>)\s*([+-]?\d+(?:\.\d+)?)").expect("arrow regex"));

/// Parse one raw model response. Never panics.
pub fn parse(raw: &str) -> RawVerdict {
    let body = strip_fences(raw);
    if let Some(verdict) = parse_structured(body, raw) {
        return verdict;
    }
    parse_heuristic(body).unwrap_or_else(|| RawVerdict::unparseable(raw))
}

/// Trim whitespace and a surrounding ``` / ```json fence.
fn strip_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        // Drop an optional language tag on the opening fence line.
        text = match rest.split_once('\n') {
            Some((tag, body)) if !tag.trim().contains(char::is_whitespace) => body,
            _ => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
        };
    }
    if let Some(rest) = text.trim_end().strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

fn parse_structured(body: &str, raw: &str) -> Option<RawVerdict> {
    let value: Value = serde_json::from_str(body).ok()?;
    let obj = value.as_object()?;

    let topics = obj
        .get("topics_lacking")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let summary = obj
        .get("summary")
        .and_then(Value::as_str)
        .map(str::to_string);

    let status = obj.get("status").and_then(Value::as_str).unwrap_or("success");
    let outcome = if status.eq_ignore_ascii_case("error") {
        Outcome::Unparseable {
            raw: raw.to_string(),
        }
    } else {
        match obj.get("result")? {
            Value::String(s) if s.trim().eq_ignore_ascii_case("correct") => Outcome::Correct,
            Value::Object(result) => {
                let entries = result.get("issues")?.as_array()?;
                if entries.is_empty() {
                    Outcome::Correct
                } else {
                    let issues = entries
                        .iter()
                        .filter_map(issue_from_value)
                        .collect::<Vec<_>>();
                    // Deductions in a shape we can't read are not a clean pass.
                    if issues.is_empty() {
                        return None;
                    }
                    Outcome::Issues { issues }
                }
            }
            _ => return None,
        }
    };

    Some(RawVerdict {
        outcome,
        topics_lacking: topics,
        summary,
    })
}

fn issue_from_value(value: &Value) -> Option<Issue> {
    let obj = value.as_object()?;
    let description = obj
        .get("issue")
        .or_else(|| obj.get("description"))
        .and_then(Value::as_str)?
        .trim()
        .to_string();
    if description.is_empty() {
        return None;
    }
    let points = match obj.get("points") {
        Some(Value::Number(n)) => n.as_f64().map(normalize_points),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok().map(normalize_points),
        _ => None,
    }
    .unwrap_or(DEFAULT_DEDUCTION);
    Some(Issue::new(description, points))
}

/// Absolute value, rounded, clamped into `u32`.
fn normalize_points(points: f64) -> u32 {
    if !points.is_finite() {
        return DEFAULT_DEDUCTION;
    }
    points.abs().round().min(u32::MAX as f64) as u32
}

/// `true` if `line` says "correct" without a direct negation in front.
fn affirms_correct(line: &str) -> bool {
    CORRECT_RE.find_iter(line).any(|m| {
        let before = line[..m.start()].trim_end().to_ascii_lowercase();
        !(before.ends_with("not") || before.ends_with("n't") || before.ends_with("never"))
    })
}

fn parse_heuristic(body: &str) -> Option<RawVerdict> {
    if body.lines().any(affirms_correct) {
        return Some(RawVerdict::correct());
    }

    let issues: Vec<Issue> = body.lines().filter_map(issue_from_line).collect();
    if issues.is_empty() {
        None
    } else {
        Some(RawVerdict::with_issues(issues))
    }
}

fn issue_from_line(line: &str) -> Option<Issue> {
    let line = line.trim();
    if line.is_empty() || line.starts_with("```") {
        return None;
    }

    let (points, stripped) = if let Some(caps) = POINTS_RE.captures(line) {
        let whole = caps.get(0)?;
        let value = caps.get(1)?.as_str().parse::<f64>().ok();
        (value, format!("{}{}", &line[..whole.start()], &line[whole.end()..]))
    } else if let Some(caps) = ARROW_RE.captures(line) {
        let whole = caps.get(0)?;
        let value = caps.get(1)?.as_str().parse::<f64>().ok();
        (value, format!("{}{}", &line[..whole.start()], &line[whole.end()..]))
    } else if line
        .split_once(':')
        .is_some_and(|(_, after)| !after.trim().is_empty())
    {
        (None, line.to_string())
    } else {
        return None;
    };

    let text = match stripped.split_once(':') {
        Some((_, after)) if !after.trim().is_empty() => after,
        _ => stripped.as_str(),
    };
    let description = clean_description(text);
    let description = if description.is_empty() {
        clean_description(line)
    } else {
        description
    };
    if description.is_empty() {
        return None;
    }

    Some(Issue::new(
        description,
        points.map(normalize_points).unwrap_or(DEFAULT_DEDUCTION),
    ))
}

fn clean_description(text: &str) -> String {
    let text = text.trim();
    let text = text
        .trim_start_matches(|c: char| c == '-' || c == '*' || c == '•' || c.is_whitespace())
        .trim_start_matches(|c: char| c.is_ascii_digit())
        .trim_start_matches(['.', ')', ' ']);
    text.trim_end_matches(|c: char| " -:>=,;()".contains(c))
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issues(items: &[(&str, u32)]) -> RawVerdict {
        RawVerdict::with_issues(items.iter().map(|(d, p)| Issue::new(*d, *p)).collect())
    }

    #[test]
    fn parse_table() {
        let cases: Vec<(&str, RawVerdict)> = vec![
            ("correct", RawVerdict::correct()),
            ("  CORRECT\n", RawVerdict::correct()),
            ("Correct.", RawVerdict::correct()),
            (
                "Missing loop --> -3 points",
                issues(&[("Missing loop", 3)]),
            ),
            (
                "Issues found:\n- Loop: missing exit condition (-2 points)\n- Output: wrong format",
                issues(&[("missing exit condition", 2), ("wrong format", 2)]),
            ),
            (
                "Variable naming --> -1",
                issues(&[("Variable naming", 1)]),
            ),
            (
                "The answer is incorrect: uses float division",
                issues(&[("uses float division", 2)]),
            ),
            (
                r#"{"status": "success", "result": {"issues": []}}"#,
                RawVerdict::correct(),
            ),
            ("", RawVerdict::unparseable("")),
            (
                "I cannot evaluate this",
                RawVerdict::unparseable("I cannot evaluate this"),
            ),
        ];
        for (input, expected) in cases {
            assert_eq!(parse(input), expected, "input: {input:?}");
        }
    }

    #[test]
    fn unreadable_structured_issues_fall_back() {
        let raw = r#"{"status":"success","result":{"issues":[{"points":-3},{"problem":"no loop","points":-4}]}}"#;
        let v = parse(raw);
        assert!(!v.is_correct());
        assert!(!v.issues().is_empty());

        let blank = r#"{"status": "success", "result": {"issues": [{"issue": "  "}]}}"#;
        assert!(!parse(blank).is_correct());
    }

    #[test]
    fn structured_correct() {
        let raw = r#"{"status": "success", "result": "correct", "topics_lacking": [], "summary": "Well done"}"#;
        let v = parse(raw);
        assert!(v.is_correct());
        assert_eq!(v.summary.as_deref(), Some("Well done"));
    }

    #[test]
    fn structured_issues_normalize_sign() {
        let raw = r#"```json
{
  "status": "success",
  "result": {"issues": [
    {"issue": "does not sort the array", "points": -3},
    {"issue": "prints wrong total", "points": "2"},
    {"issue": "no points given"}
  ]},
  "topics_lacking": ["array_handling", "output_formatting"],
  "summary": "Needs work on arrays."
}
```"#;
        let v = parse(raw);
        assert_eq!(
            v.issues(),
            &[
                Issue::new("does not sort the array", 3),
                Issue::new("prints wrong total", 2),
                Issue::new("no points given", DEFAULT_DEDUCTION),
            ]
        );
        assert_eq!(v.topics_lacking, vec!["array_handling", "output_formatting"]);
    }

    #[test]
    fn structured_empty_issue_list_is_correct() {
        let v = parse(r#"{"status": "success", "result": {"issues": []}}"#);
        assert!(v.is_correct());
    }

    #[test]
    fn structured_error_status_is_error_shape() {
        let raw = r#"{"status": "error", "feedback": "Evaluator model failed"}"#;
        assert_eq!(parse(raw), RawVerdict::unparseable(raw));
    }

    #[test]
    fn bare_fence_without_language_tag() {
        assert!(parse("```\ncorrect\n```").is_correct());
    }

    #[test]
    fn negated_correct_is_not_a_pass() {
        let v = parse("The loop is not correct: it never terminates");
        assert!(!v.is_correct());
        assert_eq!(v.issue_count(), 1);
    }

    #[test]
    fn fallback_numbers_are_non_zero_for_deductions() {
        let v = parse("{broken json\nMissing loop --> -3 points");
        assert!(v.issue_count() >= 1);
        assert!(v.issues().iter().all(|i| i.points_deducted > 0));
    }

    #[test]
    fn unparseable_keeps_raw_verbatim() {
        let raw = "   ??? \n";
        assert_eq!(
            parse(raw).outcome,
            Outcome::Unparseable {
                raw: raw.to_string()
            }
        );
    }

    #[test]
    fn never_panics_on_odd_input() {
        for input in ["```", "``````", "{", "-->", ":", "\u{1F600} 3 pts", "é: -2 points"] {
            let _ = parse(input);
        }
    }
}
