//! Run report and audit timeline
//!
//! One [`RunReport`] per run. Timeline and fix records are append-only; the
//! report is sealed by [`RunReport::finish`] and serialized as `results.json`.

use crate::analyzer::BugType;
use crate::score::Score;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const REPORT_FILE_NAME: &str = "results.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixStatus {
    Fixed,
    Failed,
}

/// An applied patch and what verification made of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixRecord {
    pub file: String,
    pub bug_type: BugType,
    pub line: Option<usize>,
    pub commit_message: String,
    pub status: FixStatus,
    /// Whether the stage + commit succeeded
    pub committed: bool,
}

/// Commit message for a fix: `[AI-AGENT] Fix: {BUG_TYPE} in {path}:{line|?}`.
pub fn commit_message(bug_type: BugType, file: &str, line: Option<usize>) -> String {
    let line = line
        .map(|l| l.to_string())
        .unwrap_or_else(|| "?".to_string());
    format!(
        "{} Fix: {} in {}:{}",
        crate::git_ops::COMMIT_PREFIX,
        bug_type,
        file,
        line
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    /// 1-based
    pub iteration: u32,
    pub pass: bool,
    pub timestamp: DateTime<Utc>,
    /// "i/limit"
    pub retry_counter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TimelineEntry {
    pub fn start(iteration: u32, retry_limit: u32) -> Self {
        Self {
            iteration,
            pass: false,
            timestamp: Utc::now(),
            retry_counter: format!("{}/{}", iteration, retry_limit),
            error: None,
        }
    }

    /// Attach an error. Several errors in one iteration are joined with "; ".
    pub fn record_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.error = Some(match self.error.take() {
            Some(existing) => format!("{}; {}", existing, message),
            None => message,
        });
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub repo_url: String,
    pub team_name: String,
    pub leader_name: String,
    pub branch: String,
    pub total_failures: u32,
    pub total_fixes: u32,
    pub iterations: u32,
    pub retry_limit: u32,
    pub status: RunStatus,
    /// e.g. "12.34s"
    pub time_taken: String,
    pub elapsed_ms: u64,
    pub score: Score,
    #[serde(default)]
    pub push_failed: bool,
    fixes: Vec<FixRecord>,
    timeline: Vec<TimelineEntry>,
}

impl RunReport {
    pub fn new(
        run_id: impl Into<String>,
        repo_url: impl Into<String>,
        team_name: impl Into<String>,
        leader_name: impl Into<String>,
        branch: impl Into<String>,
        retry_limit: u32,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            repo_url: repo_url.into(),
            team_name: team_name.into(),
            leader_name: leader_name.into(),
            branch: branch.into(),
            total_failures: 0,
            total_fixes: 0,
            iterations: 0,
            retry_limit,
            status: RunStatus::Failed,
            time_taken: String::new(),
            elapsed_ms: 0,
            score: Score::default(),
            push_failed: false,
            fixes: Vec::new(),
            timeline: Vec::new(),
        }
    }

    pub fn fixes(&self) -> &[FixRecord] {
        &self.fixes
    }

    pub fn timeline(&self) -> &[TimelineEntry] {
        &self.timeline
    }

    /// Append a completed iteration. Entries must arrive in iteration order.
    pub fn push_timeline(&mut self, entry: TimelineEntry) {
        debug_assert!(
            self.timeline
                .last()
                .map(|last| last.iteration < entry.iteration)
                .unwrap_or(true),
            "timeline entries must be strictly increasing"
        );
        self.iterations = self.iterations.max(entry.iteration);
        self.timeline.push(entry);
    }

    pub fn push_fix(&mut self, fix: FixRecord) {
        if fix.status == FixStatus::Fixed {
            self.total_fixes += 1;
        }
        self.fixes.push(fix);
    }

    /// Seal the report: status, elapsed time and score.
    pub fn finish(mut self, passed: bool, elapsed: Duration) -> Self {
        self.status = if passed {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        };
        self.elapsed_ms = elapsed.as_millis() as u64;
        self.time_taken = format!("{:.2}s", elapsed.as_secs_f64());
        self.score = Score::compute(elapsed, self.fixes.len());
        self
    }
}

/// Write `report` as pretty JSON to `dir/results.json`.
pub fn write_report(report: &RunReport, dir: &Path) -> Result<PathBuf> {
    let path = dir.join(REPORT_FILE_NAME);
    write_report_to(report, &path)?;
    Ok(path)
}

pub fn write_report_to(report: &RunReport, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize run report")?;
    crate::util::write_atomic(path, &json)
        .with_context(|| format!("Failed to write report to '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> RunReport {
        RunReport::new(
            "run-1",
            "https://github.com/acme/app",
            "Acme",
            "Jo",
            "ACME_JO_AI_Fix",
            5,
        )
    }

    fn fix(status: FixStatus) -> FixRecord {
        FixRecord {
            file: "src/app.js".into(),
            bug_type: BugType::TypeError,
            line: Some(42),
            commit_message: commit_message(BugType::TypeError, "src/app.js", Some(42)),
            status,
            committed: true,
        }
    }

    #[test]
    fn test_commit_message_format() {
        assert_eq!(
            commit_message(BugType::Syntax, "lib/a.js", Some(3)),
            "[AI-AGENT] Fix: SYNTAX in lib/a.js:3"
        );
        assert_eq!(
            commit_message(BugType::Logic, "lib/a.js", None),
            "[AI-AGENT] Fix: LOGIC in lib/a.js:?"
        );
    }

    #[test]
    fn test_only_fixed_records_count_as_fixes() {
        let mut report = report();
        report.push_fix(fix(FixStatus::Failed));
        report.push_fix(fix(FixStatus::Fixed));
        assert_eq!(report.total_fixes, 1);
        assert_eq!(report.fixes().len(), 2);
    }

    #[test]
    fn test_timeline_errors_accumulate() {
        let mut entry = TimelineEntry::start(2, 5);
        assert_eq!(entry.retry_counter, "2/5");
        entry.record_error("Patch could not be applied");
        entry.record_error("Commit failed");
        assert_eq!(
            entry.error.as_deref(),
            Some("Patch could not be applied; Commit failed")
        );
    }

    #[test]
    fn test_finish_sets_status_time_and_score() {
        let mut report = report();
        report.push_timeline(TimelineEntry::start(1, 5));
        let report = report.finish(true, Duration::from_millis(12_346));
        assert_eq!(report.status, RunStatus::Passed);
        assert_eq!(report.time_taken, "12.35s");
        assert_eq!(report.score.final_score, 110);
        assert_eq!(report.iterations, 1);
    }

    #[test]
    fn test_serialized_shape() {
        let mut report = report();
        let mut entry = TimelineEntry::start(1, 5);
        entry.record_error("Could not extract file/line");
        report.push_timeline(entry);
        report.push_fix(fix(FixStatus::Fixed));
        let json = serde_json::to_value(report.finish(false, Duration::from_secs(1))).unwrap();

        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["totalFixes"], 1);
        assert_eq!(json["retryLimit"], 5);
        assert_eq!(json["fixes"][0]["bugType"], "TYPE_ERROR");
        assert_eq!(json["fixes"][0]["status"], "Fixed");
        assert_eq!(json["timeline"][0]["retryCounter"], "1/5");
        assert!(json["timeline"][0]["error"].is_string());
        assert!(json.get("githubToken").is_none());
    }

    #[test]
    fn test_write_report() {
        let dir = tempfile::tempdir().unwrap();
        let report = report().finish(true, Duration::from_secs(2));
        let path = write_report(&report, dir.path()).unwrap();
        let back: RunReport =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(back.run_id, "run-1");
        assert_eq!(back.status, RunStatus::Passed);
    }
}
