//! Failure analysis for raw test output
//!
//! Turns unstructured runner output into ordered (file, line, bug type)
//! candidates. Pure: no filesystem or process access.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Maximum characters of raw output carried on each candidate.
pub const RAW_SNIPPET_MAX_CHARS: usize = 4000;

/// Coarse category of a failing test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BugType {
    Linting,
    Syntax,
    Logic,
    TypeError,
    Import,
    Indentation,
}

impl BugType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BugType::Linting => "LINTING",
            BugType::Syntax => "SYNTAX",
            BugType::Logic => "LOGIC",
            BugType::TypeError => "TYPE_ERROR",
            BugType::Import => "IMPORT",
            BugType::Indentation => "INDENTATION",
        }
    }
}

impl std::fmt::Display for BugType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One fault-site hypothesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// Basename of the file, `None` when nothing could be localized
    pub file: Option<String>,
    pub line: Option<usize>,
    pub bug_type: BugType,
    pub raw_snippet: String,
}

impl Candidate {
    pub fn is_localized(&self) -> bool {
        self.file.is_some()
    }
}

/// Keyword table for classification. Order matters: the first keyword found
/// (case-insensitive) decides the category.
const TYPE_HINTS: &[(&str, BugType)] = &[
    ("SyntaxError", BugType::Syntax),
    ("Unexpected token", BugType::Syntax),
    ("is not defined", BugType::Logic),
    ("Cannot find module", BugType::Import),
    ("Module not found", BugType::Import),
    ("is not a function", BugType::TypeError),
    ("is not a constructor", BugType::TypeError),
    ("Cannot read propert", BugType::TypeError),
    ("Expected", BugType::Logic),
    ("Received", BugType::Logic),
    ("AssertionError", BugType::Logic),
    ("ReferenceError", BugType::Logic),
    ("TypeError", BugType::TypeError),
    ("IndentationError", BugType::Indentation),
    ("indent", BugType::Indentation),
    ("ESLint", BugType::Linting),
    ("Lint", BugType::Linting),
];

/// file:line recognizers, applied in order. Group 1 is the path, group 2 the line.
fn location_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // "at fn (path:line:col)" stack frames
            r"at\s+.*?\s+\(([^)]+):(\d+):\d+\)",
            // anonymous "at (path:line:col)" frames
            r"(?m)^\s*at\s+\(([^)]+):(\d+):\d+\)",
            // any "(path:line:col)"
            r"\(([^)]+):(\d+):(\d+)\)",
            // bare "file.ext:line" for script sources
            r"(?i)(\S+\.(?:js|ts|jsx|tsx|mjs|cjs)):(\d+)",
            // "at path:line"
            r"at\s+(\S+):(\d+)",
            // Python tracebacks: File "path", line N
            r#"File "([^"]+)", line (\d+)"#,
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Analyze test failure output.
///
/// Always returns at least one candidate. When no location could be
/// extracted, the single candidate has `file`/`line` set to `None`.
pub fn analyze(output: &str) -> Vec<Candidate> {
    let bug_type = classify_bug_type(output);
    let raw_snippet: String = output.chars().take(RAW_SNIPPET_MAX_CHARS).collect();
    let pairs = extract_file_line_pairs(output);

    if pairs.is_empty() {
        return vec![Candidate {
            file: None,
            line: None,
            bug_type,
            raw_snippet,
        }];
    }

    pairs
        .into_iter()
        .map(|(file, line)| Candidate {
            file: Some(file),
            line: Some(line),
            bug_type,
            raw_snippet: raw_snippet.clone(),
        })
        .collect()
}

/// Collect (basename, minimum line) pairs in first-seen order.
pub fn extract_file_line_pairs(output: &str) -> Vec<(String, usize)> {
    let mut pairs: Vec<(String, usize)> = Vec::new();

    for pattern in location_patterns() {
        for caps in pattern.captures_iter(output) {
            let (Some(file), Some(line)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let Ok(line) = line.as_str().parse::<usize>() else {
                continue;
            };
            if line == 0 {
                continue;
            }
            let key = basename(file.as_str());
            if key.is_empty() {
                continue;
            }

            match pairs.iter_mut().find(|(existing, _)| *existing == key) {
                Some(entry) if entry.1 > line => entry.1 = line,
                Some(_) => {}
                None => pairs.push((key, line)),
            }
        }
    }

    pairs
}

/// Classify output by the first matching keyword; `Logic` when none match.
pub fn classify_bug_type(output: &str) -> BugType {
    let text = output.to_lowercase();
    TYPE_HINTS
        .iter()
        .find(|(keyword, _)| text.contains(&keyword.to_lowercase()))
        .map(|(_, bug_type)| *bug_type)
        .unwrap_or(BugType::Logic)
}

// NOTE: keyed by basename, so two same-named files in different directories
// collapse into one candidate.
fn basename(path: &str) -> String {
    let trimmed = path
        .trim()
        .trim_start_matches(|c: char| matches!(c, '(' | '"' | '\'' | '['));
    let trimmed = trimmed.strip_prefix("file://").unwrap_or(trimmed);
    trimmed
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(trimmed)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_error_stack_frame() {
        let output = "TypeError: x is not a function\n    at foo (src/app.js:42:10)";
        let candidates = analyze(output);
        assert_eq!(candidates[0].bug_type, BugType::TypeError);
        assert_eq!(candidates[0].file.as_deref(), Some("app.js"));
        assert_eq!(candidates[0].line, Some(42));
    }

    #[test]
    fn test_minimum_line_wins_across_frames() {
        let output = "\
AssertionError: expected 1 to equal 2
    at check (/repo/src/math.js:30:5)
    at run (/repo/src/math.js:12:3)
    at Object.<anonymous> (/repo/test/math.test.js:8:1)
/repo/src/math.js:19";
        let candidates = analyze(output);
        let math = candidates
            .iter()
            .find(|c| c.file.as_deref() == Some("math.js"))
            .unwrap();
        assert_eq!(math.line, Some(12));
        assert!(candidates
            .iter()
            .any(|c| c.file.as_deref() == Some("math.test.js") && c.line == Some(8)));
    }

    #[test]
    fn test_candidates_keep_discovery_order() {
        let output = "at b (lib/zeta.js:90:1)\nat a (lib/alpha.js:3:1)";
        let files: Vec<_> = analyze(output)
            .into_iter()
            .map(|c| c.file.unwrap())
            .collect();
        assert_eq!(files, vec!["zeta.js", "alpha.js"]);
    }

    #[test]
    fn test_dependency_and_local_paths_merge_by_basename() {
        let output = "at x (node_modules/pkg/index.js:50:2)\nat y (src/index.js:7:2)";
        let candidates = analyze(output);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].line, Some(7));
    }

    #[test]
    fn test_unlocalized_output_yields_single_null_candidate() {
        let candidates = analyze("npm ERR! Test failed.  See above for more details.");
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].file.is_none());
        assert!(candidates[0].line.is_none());
        assert!(!candidates[0].is_localized());
    }

    #[test]
    fn test_empty_output_is_not_an_error() {
        let candidates = analyze("");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].bug_type, BugType::Logic);
    }

    #[test]
    fn test_zero_line_is_ignored() {
        let candidates = analyze("at foo (src/a.js:0:1)");
        assert!(candidates[0].file.is_none());
    }

    #[test]
    fn test_python_traceback_location() {
        let output = "Traceback (most recent call last):\n  File \"pkg/util.py\", line 14, in <module>\nIndentationError: unindent does not match any outer indentation level";
        let candidates = analyze(output);
        assert_eq!(candidates[0].file.as_deref(), Some("util.py"));
        assert_eq!(candidates[0].line, Some(14));
        assert_eq!(candidates[0].bug_type, BugType::Indentation);
    }

    #[test]
    fn test_classification_table_order() {
        assert_eq!(classify_bug_type("SyntaxError: Unexpected token }"), BugType::Syntax);
        assert_eq!(classify_bug_type("Error: Cannot find module './x'"), BugType::Import);
        assert_eq!(
            classify_bug_type("TypeError: Cannot read properties of undefined"),
            BugType::TypeError
        );
        // "is not defined" precedes "ReferenceError" in the table
        assert_eq!(classify_bug_type("ReferenceError: y is not defined"), BugType::Logic);
        assert_eq!(classify_bug_type("eslint found 3 problems"), BugType::Linting);
        assert_eq!(classify_bug_type("something odd happened"), BugType::Logic);
    }

    #[test]
    fn test_raw_snippet_is_bounded() {
        let output = "x".repeat(RAW_SNIPPET_MAX_CHARS * 2);
        let candidates = analyze(&output);
        assert_eq!(candidates[0].raw_snippet.chars().count(), RAW_SNIPPET_MAX_CHARS);
    }

    #[test]
    fn test_bug_type_serializes_screaming_case() {
        let json = serde_json::to_string(&BugType::TypeError).unwrap();
        assert_eq!(json, "\"TYPE_ERROR\"");
        assert_eq!(BugType::TypeError.to_string(), "TYPE_ERROR");
    }
}
