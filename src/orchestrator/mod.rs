//! Repair run orchestration
//!
//! One run = access check, clone, branch, then up to `retry_limit`
//! iterations of test -> analyze -> patch -> apply -> verify -> commit,
//! followed by push, report and cleanup. Only failures before the first
//! iteration are fatal; everything later lands on the report.

use crate::analyzer::{self, Candidate};
use crate::config::{clamp_retry_limit, Config, MAX_RETRY_LIMIT, MIN_RETRY_LIMIT};
use crate::error::RunError;
use crate::git_ops::{generate_branch_name, CloneError};
use crate::github::{parse_github_url, RepoAccess};
use crate::llm::{PatchRequest, PatchService};
use crate::patch::apply_patch_to_file;
use crate::report::{commit_message, write_report, FixRecord, FixStatus, RunReport, TimelineEntry};
use crate::sandbox::{Isolation, TestRun, TestRunner};
use crate::vcs::Vcs;
use crate::workflow::{RunPhase, Workflow};
use crate::workspace::RunWorkspace;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use walkdir::WalkDir;


/// Directories never searched for candidate files.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git"];

/// Parameters of one run.
#[derive(Clone, Default)]
pub struct RunRequest {
    pub repo_url: String,
    pub team_name: String,
    pub leader_name: String,
    pub github_token: Option<String>,
    pub retry_limit: Option<u32>,
}

impl fmt::Debug for RunRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunRequest")
            .field("repo_url", &self.repo_url)
            .field("team_name", &self.team_name)
            .field("leader_name", &self.leader_name)
            .field("github_token", &self.github_token.as_ref().map(|_| "<redacted>"))
            .field("retry_limit", &self.retry_limit)
            .finish()
    }
}

#[derive(Debug, Error)]
#[error("{}", .0.join("; "))]
pub struct ValidationError(pub Vec<String>);

impl RunRequest {
    /// Trim every field and reject requests a run could not start from.
    pub fn validate(self) -> Result<Self, ValidationError> {
        let repo_url = self.repo_url.trim().to_string();
        let team_name = self.team_name.trim().to_string();
        let leader_name = self.leader_name.trim().to_string();
        let github_token = self
            .github_token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let mut errors = Vec::new();
        if repo_url.is_empty() {
            errors.push("repo URL is required".to_string());
        } else if !is_github_https_url(&repo_url) {
            errors.push("repo URL must be a valid GitHub repository URL".to_string());
        }
        if team_name.is_empty() {
            errors.push("team name is required".to_string());
        }
        if leader_name.is_empty() {
            errors.push("leader name is required".to_string());
        }
        if let Some(limit) = self.retry_limit {
            if !(MIN_RETRY_LIMIT..=MAX_RETRY_LIMIT).contains(&limit) {
                errors.push(format!(
                    "retry limit must be between {} and {}",
                    MIN_RETRY_LIMIT, MAX_RETRY_LIMIT
                ));
            }
        }

        if !errors.is_empty() {
            return Err(ValidationError(errors));
        }
        Ok(Self {
            repo_url,
            team_name,
            leader_name,
            github_token,
            retry_limit: self.retry_limit,
        })
    }

    /// The request's override clamped to [1, 10], or `default`.
    pub fn effective_retry_limit(&self, default: u32) -> u32 {
        clamp_retry_limit(self.retry_limit.unwrap_or(default))
    }
}

fn is_github_https_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    (lower.starts_with("https://") || lower.starts_with("http://"))
        && parse_github_url(url).is_some()
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Process-wide default; requests may override it
    pub default_retry_limit: u32,
    pub clones_dir: PathBuf,
    pub patch_timeout: Duration,
    /// Leave the working tree (and its `results.json`) on disk after the run
    pub keep_workspace: bool,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_retry_limit: config.retry_limit,
            clones_dir: config.clones_dir(),
            patch_timeout: config.patch_timeout(),
            keep_workspace: false,
        }
    }
}

enum IterationOutcome {
    Passed,
    Failed,
}

/// Drives repair runs. Cheap to share: every run owns its own workspace.
pub struct Orchestrator {
    runner: Arc<dyn TestRunner>,
    patches: Arc<dyn PatchService>,
    vcs: Arc<dyn Vcs>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        runner: Arc<dyn TestRunner>,
        patches: Arc<dyn PatchService>,
        vcs: Arc<dyn Vcs>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            runner,
            patches,
            vcs,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub async fn run(&self, request: &RunRequest) -> Result<RunReport, RunError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("run", run_id = %run_id, repo = %request.repo_url);
        self.run_with_id(request, run_id).instrument(span).await
    }

    async fn run_with_id(&self, request: &RunRequest, run_id: String) -> Result<RunReport, RunError> {
        let started = Instant::now();
        let token = request.github_token.as_deref();
        let retry_limit = request.effective_retry_limit(self.settings.default_retry_limit);

        if parse_github_url(&request.repo_url).is_none() {
            return Err(RunError::InvalidRepoUrl(request.repo_url.clone()));
        }

        match self.vcs.check_access(&request.repo_url, token).await {
            RepoAccess::Public => {}
            RepoAccess::NeedsCredential => return Err(RunError::NeedsCredential),
            RepoAccess::Unavailable(reason) => return Err(RunError::Inaccessible(reason)),
        }

        let branch = generate_branch_name(&request.team_name, &request.leader_name);
        let workspace = RunWorkspace::create(&self.settings.clones_dir, &run_id)?;
        let repo_path = workspace.path().to_path_buf();

        let mut workflow = Workflow::new();
        match self
            .vcs
            .clone_shallow(&request.repo_url, token, &repo_path)
            .await
        {
            Ok(()) => {}
            Err(CloneError::Authentication) => return Err(RunError::NeedsCredential),
            Err(CloneError::Failed(reason)) => return Err(RunError::Clone(reason)),
        }
        self.vcs
            .checkout_branch(&repo_path, &branch)
            .await
            .map_err(|e| RunError::Branch(format!("{:#}", e)))?;
        workflow.advance(RunPhase::Cloned);
        info!(branch = %branch, retry_limit, "repository ready");

        let mut report = RunReport::new(
            run_id,
            request.repo_url.clone(),
            request.team_name.clone(),
            request.leader_name.clone(),
            branch.clone(),
            retry_limit,
        );

        let mut passed = false;
        for iteration in 1..=retry_limit {
            let outcome = self
                .run_iteration(&repo_path, iteration, retry_limit, &mut report, &mut workflow)
                .await;
            if let IterationOutcome::Passed = outcome {
                passed = true;
                break;
            }
        }
        workflow.advance(RunPhase::Done { passed });

        let mut report = report.finish(passed, started.elapsed());

        if let Err(e) = self.vcs.push(&repo_path, &branch, token).await {
            warn!(error = %format!("{:#}", e), "push failed");
            report.push_failed = true;
        }

        match write_report(&report, &repo_path) {
            Ok(path) => info!(path = %path.display(), "report written"),
            Err(e) => warn!(error = %format!("{:#}", e), "could not write report"),
        }

        if self.settings.keep_workspace {
            let kept = workspace.keep();
            info!(path = %kept.display(), "workspace kept");
        } else if let Err(e) = workspace.release() {
            warn!(error = %format!("{:#}", e), "could not remove workspace");
        }

        info!(
            status = ?report.status,
            iterations = report.iterations,
            failures = report.total_failures,
            fixes = report.total_fixes,
            score = report.score.final_score,
            "run finished"
        );
        Ok(report)
    }

    async fn run_iteration(
        &self,
        repo_path: &Path,
        iteration: u32,
        retry_limit: u32,
        report: &mut RunReport,
        workflow: &mut Workflow,
    ) -> IterationOutcome {
        workflow.advance(RunPhase::Running { iteration });
        let mut entry = TimelineEntry::start(iteration, retry_limit);

        let run = self.run_suite(repo_path, false).await;
        entry.pass = run.success;
        if run.success {
            info!(iteration, "test suite passed");
            report.push_timeline(entry);
            return IterationOutcome::Passed;
        }

        report.total_failures += 1;
        workflow.advance(RunPhase::Analyzing { iteration });
        self.attempt_fix(repo_path, iteration, &run, report, workflow, &mut entry)
            .await;
        report.push_timeline(entry);
        IterationOutcome::Failed
    }

    /// Everything between a failing run and the next iteration. Problems are
    /// written to `entry` and never end the run.
    async fn attempt_fix(
        &self,
        repo_path: &Path,
        iteration: u32,
        run: &TestRun,
        report: &mut RunReport,
        workflow: &mut Workflow,
        entry: &mut TimelineEntry,
    ) {
        let output = run.combined_output();
        let Some(candidate) = analyzer::analyze(&output)
            .into_iter()
            .next()
            .filter(Candidate::is_localized)
        else {
            warn!(iteration, "failure could not be localized");
            entry.record_error("Could not extract file/line from test output");
            return;
        };
        let Candidate {
            file,
            line,
            bug_type,
            raw_snippet,
        } = candidate;
        let file = file.unwrap_or_default();
        if !self.patches.is_available() {
            entry.record_error("No patch service API key configured");
            return;
        }

        let Some(relative) = find_file_in_repo(repo_path, &file) else {
            entry.record_error(format!("Could not locate {} in repository", file));
            return;
        };
        let rel_path = relative.to_string_lossy().replace('\\', "/");
        let full_path = repo_path.join(&relative);
        let file_content = match std::fs::read_to_string(&full_path) {
            Ok(content) => content,
            Err(e) => {
                entry.record_error(format!("Could not read {}: {}", rel_path, e));
                return;
            }
        };
        info!(iteration, file = %rel_path, line, %bug_type, "requesting patch");

        workflow.advance(RunPhase::Patching {
            iteration,
            file: rel_path.clone(),
        });
        let request = PatchRequest {
            bug_type,
            file_path: rel_path.clone(),
            line,
            error_snippet: raw_snippet,
            file_content,
        };
        let patch_text = match tokio::time::timeout(
            self.settings.patch_timeout,
            self.patches.request_patch(&request),
        )
        .await
        {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!(iteration, error = %e, "patch request failed");
                entry.record_error(e.to_string());
                return;
            }
            Err(_) => {
                warn!(iteration, "patch request timed out");
                entry.record_error(format!(
                    "patch request timed out after {}s",
                    self.settings.patch_timeout.as_secs()
                ));
                return;
            }
        };

        workflow.advance(RunPhase::Applying {
            iteration,
            file: rel_path.clone(),
        });
        if let Err(e) = apply_patch_to_file(&full_path, &patch_text) {
            warn!(iteration, file = %rel_path, error = %e, "patch not applied");
            entry.record_error(format!("Patch could not be applied: {}", e));
            return;
        }

        workflow.advance(RunPhase::Verifying {
            iteration,
            file: rel_path.clone(),
        });
        let verification = self.run_suite(repo_path, true).await;
        let status = if verification.success {
            FixStatus::Fixed
        } else {
            FixStatus::Failed
        };
        info!(iteration, file = %rel_path, ?status, "patch verified");

        workflow.advance(RunPhase::Committing {
            iteration,
            file: rel_path.clone(),
        });
        let message = commit_message(bug_type, &rel_path, line);
        let committed = match self.vcs.commit_file(repo_path, &rel_path, &message).await {
            Ok(oid) => {
                info!(iteration, commit = %oid, "fix committed");
                true
            }
            Err(e) => {
                warn!(iteration, error = %format!("{:#}", e), "commit failed");
                entry.record_error("Commit failed");
                false
            }
        };

        report.push_fix(FixRecord {
            file: rel_path,
            bug_type,
            line,
            commit_message: message,
            status,
            committed,
        });
    }

    async fn run_suite(&self, repo_path: &Path, verify: bool) -> TestRun {
        let runner = Arc::clone(&self.runner);
        let path = repo_path.to_path_buf();
        let joined = tokio::task::spawn_blocking(move || {
            if verify {
                runner.run_tests_only(&path)
            } else {
                runner.run(&path)
            }
        })
        .await;
        joined.unwrap_or_else(|e| TestRun {
            success: false,
            stdout: String::new(),
            stderr: format!("test runner crashed: {}", e),
            test_command: String::new(),
            isolation: Isolation::Process,
            timed_out: false,
            output_truncated: false,
            duration_ms: 0,
        })
    }
}

/// Resolve `name` inside `repo_path`: as a relative path first, then by
/// basename anywhere in the tree outside dependency and VCS directories.
/// Returns the path relative to `repo_path`.
pub fn find_file_in_repo(repo_path: &Path, name: &str) -> Option<PathBuf> {
    let direct = Path::new(name);
    if direct.is_relative()
        && !direct
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        && repo_path.join(direct).is_file()
    {
        return Some(direct.to_path_buf());
    }

    let base = direct.file_name()?;
    WalkDir::new(repo_path)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .map(|n| SKIPPED_DIRS.contains(&n))
                    .unwrap_or(false))
        })
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_file() && e.file_name() == base)
        .and_then(|e| e.path().strip_prefix(repo_path).ok().map(Path::to_path_buf))
}
