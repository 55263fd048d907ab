//! Minimal patch parsing and application
//!
//! Accepts the two dialects a patch model tends to produce:
//! - unified diff hunks (`@@ -a,b +c,d @@`), possibly without file headers
//! - free-text `REPLACE line N with: ...` / `Line N: ...` instructions
//!
//! Parsing and application are pure; [`apply_patch_to_file`] is the only
//! function that touches the filesystem.

use crate::util::write_atomic;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("no recognizable edits in patch")]
    NoRecognizableEdits,
    #[error("target file does not exist: {}", .0.display())]
    FileMissing(PathBuf),
    #[error("failed to update file: {0}")]
    Io(#[from] std::io::Error),
}

/// A resolved change: replace lines `start..=end` (1-based, in the original
/// file) with `new_lines`. `end < start` means a pure insertion before `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub start: usize,
    pub end: usize,
    pub new_lines: Vec<String>,
}

/// A single line in a diff hunk
#[derive(Debug, Clone, PartialEq, Eq)]
enum DiffLine {
    Context(String),
    Add(String),
    Remove,
}

fn hunk_header() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^@@ -\d+(?:,\d+)? \+(\d+)(?:,(\d+))? @@").ok())
        .as_ref()
}

fn replace_instruction() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(?:replace\s+)?line\s+(\d+)\s*(?:with)?:?\s*").ok())
        .as_ref()
}

fn next_replace_keyword() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)replace\s+line").ok()).as_ref()
}

/// Parse unified-diff hunks into edits against the new-file numbering.
///
/// File headers (`---`/`+++`) and anything without a diff prefix (prose,
/// code fences, `\ No newline at end of file`) are ignored.
pub fn parse_unified_diff(patch: &str) -> Vec<Edit> {
    let Some(header) = hunk_header() else {
        return Vec::new();
    };
    let lines: Vec<&str> = patch.lines().collect();
    let mut edits = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let Some(caps) = header.captures(lines[i]) else {
            i += 1;
            continue;
        };
        let start: usize = caps
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        let count: usize = caps
            .get(2)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(1);

        i += 1;
        let mut body = Vec::new();
        while i < lines.len() {
            let line = lines[i];
            if line.starts_with("@@") {
                break;
            }
            // Inside a hunk only the `--- `/`+++ ` pair opening the next file is
            // a header; a lone `+++i;` adds `++i;`.
            let next_is_new_header = lines.get(i + 1).is_some_and(|n| n.starts_with("+++ "));
            if line.starts_with("--- ") && next_is_new_header {
                i += 2;
                continue;
            }
            if let Some(added) = line.strip_prefix('+') {
                body.push(DiffLine::Add(added.to_string()));
            } else if line.starts_with('-') {
                body.push(DiffLine::Remove);
            } else if let Some(context) = line.strip_prefix(' ') {
                body.push(DiffLine::Context(context.to_string()));
            } else if line.is_empty() {
                body.push(DiffLine::Context(String::new()));
            }
            i += 1;
        }

        let mut new_lines: Vec<String> = body
            .into_iter()
            .filter_map(|l| match l {
                DiffLine::Context(s) | DiffLine::Add(s) => Some(s),
                DiffLine::Remove => None,
            })
            .collect();
        // Blank separator lines after the hunk body are not part of it.
        while new_lines.len() > count && new_lines.last().is_some_and(|l| l.is_empty()) {
            new_lines.pop();
        }

        edits.push(Edit {
            start,
            end: start.saturating_add(count).saturating_sub(1),
            new_lines,
        });
    }

    edits
}

/// Parse `REPLACE line N with: ...` and `Line N: ...` instructions.
///
/// Each instruction replaces exactly one line; the replacement runs until the
/// next instruction, a blank line, or the end of the text. A fenced code
/// block replacement runs to its closing fence and loses the fences.
pub fn parse_replace_instructions(patch: &str) -> Vec<Edit> {
    let Some(instruction) = replace_instruction() else {
        return Vec::new();
    };
    let mut edits = Vec::new();
    let mut pos = 0;

    while let Some(caps) = instruction.captures_at(patch, pos) {
        let (Some(whole), Some(number)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        let body_start = whole.end();
        let body_end = replacement_end(patch, body_start);
        pos = body_end.max(body_start + 1).min(patch.len());

        let Ok(line) = number.as_str().parse::<usize>() else {
            if body_end >= patch.len() {
                break;
            }
            continue;
        };

        let content = strip_code_fence(patch[body_start..body_end].trim());
        edits.push(Edit {
            start: line,
            end: line,
            new_lines: content.split('\n').map(|l| l.trim_end_matches('\r').to_string()).collect(),
        });

        if body_end >= patch.len() {
            break;
        }
    }

    edits
}

fn replacement_end(patch: &str, body_start: usize) -> usize {
    let rest = &patch[body_start..];

    if rest.starts_with("```") {
        let after_open = rest.find('\n').map(|i| i + 1).unwrap_or(rest.len());
        if let Some(close) = rest[after_open..].find("```") {
            return body_start + after_open + close + 3;
        }
    }

    let mut end = patch.len();
    if let Some(m) = next_replace_keyword().and_then(|re| re.find(rest)) {
        end = end.min(body_start + m.start());
    }
    if let Some(i) = rest.find("\n\n") {
        end = end.min(body_start + i);
    }
    end
}

fn strip_code_fence(content: &str) -> String {
    let Some(without_open) = content.strip_prefix("```") else {
        return content.to_string();
    };
    // Drop the info string (```js) along with the opening fence line.
    let body = match without_open.find('\n') {
        Some(newline) if without_open[..newline].chars().all(|c| c.is_alphanumeric()) => {
            &without_open[newline + 1..]
        }
        _ => without_open.trim_start_matches(|c: char| c.is_alphanumeric()),
    };
    let body = body.strip_suffix("```").unwrap_or(body);
    body.strip_suffix('\n').unwrap_or(body).to_string()
}

/// Parse `patch` with the diff dialect first, then the instruction dialect.
pub fn parse_edits(patch: &str) -> Result<Vec<Edit>, ApplyError> {
    let mut edits = parse_unified_diff(patch);
    if edits.is_empty() {
        edits = parse_replace_instructions(patch);
    }
    if edits.is_empty() {
        return Err(ApplyError::NoRecognizableEdits);
    }
    Ok(edits)
}

/// Splice `edits` into `content`, bottom-up so every edit's line numbers
/// still refer to the untouched original above it.
pub fn apply_edits(content: &str, edits: &[Edit]) -> String {
    let separator = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let mut lines: Vec<String> = content.split(separator).map(str::to_string).collect();

    let mut ordered: Vec<&Edit> = edits.iter().collect();
    ordered.sort_by(|a, b| b.start.cmp(&a.start));

    for edit in ordered {
        let prefix_end = edit.start.saturating_sub(1).min(lines.len());
        let suffix_start = edit.end.min(lines.len()).max(prefix_end);
        lines.splice(prefix_end..suffix_start, edit.new_lines.iter().cloned());
    }

    lines.join(separator)
}

/// Apply `patch` to in-memory `content`.
pub fn apply_patch(content: &str, patch: &str) -> Result<String, ApplyError> {
    let edits = parse_edits(patch)?;
    Ok(apply_edits(content, &edits))
}

/// Apply `patch` to the file at `path` in place. On any error the file is
/// left untouched.
pub fn apply_patch_to_file(path: &Path, patch: &str) -> Result<(), ApplyError> {
    if !path.is_file() {
        return Err(ApplyError::FileMissing(path.to_path_buf()));
    }
    let original = std::fs::read_to_string(path)?;
    let patched = apply_patch(&original, patch)?;
    write_atomic(path, &patched)?;
    Ok(())
}
