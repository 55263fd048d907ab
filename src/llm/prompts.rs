use super::PatchRequest;
use crate::util::prefix_chars;

/// Error text sent with a request.
pub const ERROR_SNIPPET_MAX_CHARS: usize = 3000;
/// Files up to this size are sent whole; larger ones as a window.
pub const FILE_EXCERPT_MAX_CHARS: usize = 6000;
/// Lines kept on each side of the failing line in a windowed excerpt.
const EXCERPT_CONTEXT_LINES: usize = 60;

pub const PATCH_RULES: &str = r#"Rules:
- Output ONLY a minimal patch: use unified diff format (lines starting with - or +) or explicit "REPLACE line X with: ...".
- Do NOT rewrite the whole file. Change only the minimal lines needed to fix the bug.
- Match the exact test/assertion expectations if shown.
- Keep existing code style and indentation.
- If you use diff format, make it a valid small unified diff for the single file."#;

/// A bounded view of the target file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileExcerpt {
    pub text: String,
    /// 1-based inclusive line range, `None` when the whole file is included
    pub range: Option<(usize, usize)>,
}

pub fn file_excerpt(content: &str, line: Option<usize>) -> FileExcerpt {
    if content.chars().count() <= FILE_EXCERPT_MAX_CHARS {
        return FileExcerpt {
            text: content.to_string(),
            range: None,
        };
    }

    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len().max(1);
    let focus = line.unwrap_or(1).clamp(1, total);
    let first = focus.saturating_sub(EXCERPT_CONTEXT_LINES).max(1);
    let last = (focus + EXCERPT_CONTEXT_LINES).min(total);

    let window = lines
        .get(first - 1..last)
        .map(|slice| slice.join("\n"))
        .unwrap_or_default();
    // Long lines can still blow the budget.
    FileExcerpt {
        text: prefix_chars(&window, FILE_EXCERPT_MAX_CHARS),
        range: Some((first, last)),
    }
}

pub fn build_patch_prompt(request: &PatchRequest) -> String {
    let line = request
        .line
        .map(|l| l.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let excerpt = file_excerpt(&request.file_content, request.line);
    let heading = match excerpt.range {
        Some((first, last)) => format!("Current file content (lines {}-{}):", first, last),
        None => "Current file content:".to_string(),
    };

    format!(
        "You are a code fixer. The test output shows a failure. Provide ONLY a minimal patch.\n\n\
Bug type: {bug_type}\n\
File: {file}\n\
Failing line (approx): {line}\n\n\
Test/error snippet:\n```\n{snippet}\n```\n\n\
{heading}\n```\n{excerpt}\n```\n\n\
{rules}",
        bug_type = request.bug_type,
        file = request.file_path,
        line = line,
        snippet = prefix_chars(&request.error_snippet, ERROR_SNIPPET_MAX_CHARS),
        heading = heading,
        excerpt = excerpt.text,
        rules = PATCH_RULES,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::BugType;

    fn request(content: String, line: Option<usize>) -> PatchRequest {
        PatchRequest {
            bug_type: BugType::TypeError,
            file_path: "src/app.js".to_string(),
            line,
            error_snippet: "E".repeat(ERROR_SNIPPET_MAX_CHARS + 500),
            file_content: content,
        }
    }

    #[test]
    fn test_small_file_is_sent_whole() {
        let excerpt = file_excerpt("a\nb\nc", Some(2));
        assert_eq!(excerpt.text, "a\nb\nc");
        assert!(excerpt.range.is_none());
    }

    #[test]
    fn test_large_file_is_windowed_around_line() {
        let content: String = (1..=2000).map(|i| format!("line {}\n", i)).collect();
        let excerpt = file_excerpt(&content, Some(1000));
        assert_eq!(excerpt.range, Some((940, 1060)));
        assert!(excerpt.text.starts_with("line 940\n"));
        assert!(excerpt.text.contains("line 1000"));
        assert!(excerpt.text.chars().count() <= FILE_EXCERPT_MAX_CHARS);
    }

    #[test]
    fn test_window_clamps_at_file_edges() {
        let content: String = (1..=2000).map(|i| format!("line {}\n", i)).collect();
        assert_eq!(file_excerpt(&content, None).range, Some((1, 61)));
        assert_eq!(file_excerpt(&content, Some(99_999)).range, Some((1940, 2000)));
    }

    #[test]
    fn test_prompt_carries_request_fields() {
        let prompt = build_patch_prompt(&request("let x = 1;".to_string(), Some(42)));
        assert!(prompt.contains("Bug type: TYPE_ERROR"));
        assert!(prompt.contains("File: src/app.js"));
        assert!(prompt.contains("Failing line (approx): 42"));
        assert!(prompt.contains("REPLACE line X with"));
        let snippet_len = prompt.matches('E').count();
        assert!(snippet_len <= ERROR_SNIPPET_MAX_CHARS + 10);
    }
}
