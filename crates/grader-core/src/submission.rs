//! Submission intake: split a pasted submission into named artifacts.
//!
//! A submission is a sequence of blocks:
//!
//! ```text
//! Lab3A.py
//! Download
//! # Name: ...
//! <code>
//! ```

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

/// `<name>.py` on one line, `Download` on the next.
static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(\w+\.py)[ \t]*\r?\n[ \t]*Download[ \t]*\r?$")
        .expect("submission header regex")
});

const HEADER_KEYWORDS: [&str; 6] = ["Class:", "Section:", "Term:", "Instructor:", "Name:", "Lab:"];

/// Split `text` into `artifact name -> code`.
///
/// Surrounding `"""` quotes are removed and each file loses its leading
/// course-header comments. A name that appears twice keeps the last block.
pub fn parse_submission(text: &str) -> BTreeMap<String, String> {
    let mut text = text.trim();
    if text.len() >= 6 && text.starts_with("\"\"\"") && text.ends_with("\"\"\"") {
        text = text[3..text.len() - 3].trim();
    }

    let headers: Vec<_> = HEADER_RE.captures_iter(text).collect();
    let mut files = BTreeMap::new();
    for (i, caps) in headers.iter().enumerate() {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let end = headers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(text.len(), |m| m.start());
        let body = &text[whole.end()..end];
        files.insert(name.as_str().to_string(), strip_header_comments(body));
    }
    files
}

/// Drop leading `# Name:`-style lines, then trim.
fn strip_header_comments(code: &str) -> String {
    let mut lines = code.lines().peekable();
    // Leading blank lines before the header block do not end it.
    while lines.peek().is_some_and(|l| l.trim().is_empty()) {
        lines.next();
    }
    while lines.peek().is_some_and(|l| is_header_comment(l)) {
        lines.next();
    }
    lines.collect::<Vec<_>>().join("\n").trim().to_string()
}

fn is_header_comment(line: &str) -> bool {
    line.trim_start().starts_with('#') && HEADER_KEYWORDS.iter().any(|k| line.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUBMISSION: &str = r#""""Lab3A.py
Download
# Class: CSE 1321L
# Section: 14
# Name: Student
# Lab: 3

amount = int(input("Amount owed: $"))
print(amount)

Lab3B.py
Download
# Term: Spring
hours = 4
# not a header: Name: stays
print(hours)
""""#;

    #[test]
    fn splits_blocks_and_strips_headers() {
        let files = parse_submission(SUBMISSION);
        assert_eq!(files.len(), 2);
        assert_eq!(
            files["Lab3A.py"],
            "amount = int(input(\"Amount owed: $\"))\nprint(amount)"
        );
        assert_eq!(
            files["Lab3B.py"],
            "hours = 4\n# not a header: Name: stays\nprint(hours)"
        );
    }

    #[test]
    fn text_without_headers_yields_nothing() {
        assert!(parse_submission("print('hi')").is_empty());
        assert!(parse_submission("").is_empty());
    }

    #[test]
    fn tolerates_crlf_and_indentation() {
        let files = parse_submission("  main.py \r\n Download\r\nprint(1)\r\n");
        assert_eq!(files.get("main.py").map(String::as_str), Some("print(1)"));
    }

    #[test]
    fn header_only_block_is_empty_code() {
        let files = parse_submission("a.py\nDownload\n# Name: x\nb.py\nDownload\nx = 1");
        assert_eq!(files["a.py"], "");
        assert_eq!(files["b.py"], "x = 1");
    }
}
