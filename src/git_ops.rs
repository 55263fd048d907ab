//! Git operations for the repair workflow
//!
//! Clone, branch, stage, commit and push. Local operations go through git2;
//! network operations shell out to `git` under a timeout so they can be
//! bounded and never prompt.

use crate::util::run_command_with_timeout;
use anyhow::{Context, Result};
use git2::{BranchType, Repository, Signature};
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use thiserror::Error;

const FALLBACK_AUTHOR_NAME: &str = "ripple-agent";
const FALLBACK_AUTHOR_EMAIL: &str = "ripple-agent@users.noreply.github.com";

/// Marker every agent commit message starts with.
pub const COMMIT_PREFIX: &str = "[AI-AGENT]";

#[derive(Debug, Error)]
pub enum CloneError {
    #[error("authentication required")]
    Authentication,
    #[error("{0}")]
    Failed(String),
}

/// Branch name for a team's repair run: `{TEAM}_{LEADER}_AI_Fix`.
pub fn generate_branch_name(team: &str, leader: &str) -> String {
    fn clean(part: &str) -> String {
        part.split_whitespace()
            .collect::<Vec<_>>()
            .join("_")
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect::<String>()
            .to_uppercase()
    }

    let team = clean(team);
    let leader = clean(leader);
    format!(
        "{}_{}_AI_Fix",
        if team.is_empty() { "TEAM" } else { &team },
        if leader.is_empty() { "LEADER" } else { &leader }
    )
}

/// Embed `token` in an HTTPS clone URL. Anything unparseable is returned as-is.
pub fn clone_url_with_token(repo_url: &str, token: Option<&str>) -> String {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return repo_url.to_string();
    };
    let Ok(mut url) = url::Url::parse(repo_url) else {
        return repo_url.to_string();
    };
    if url.set_username(token).is_err() || url.set_password(Some("x-oauth-basic")).is_err() {
        return repo_url.to_string();
    }
    url.to_string()
}

/// Remove `token` from text that may be shown or stored.
pub fn scrub_token(text: &str, token: Option<&str>) -> String {
    match token.filter(|t| !t.is_empty()) {
        Some(token) => text.replace(token, "***"),
        None => text.to_string(),
    }
}

fn looks_like_auth_failure(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    [
        "authentication",
        "401",
        "403",
        "could not read username",
        "terminal prompts disabled",
        "repository not found",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

fn git_command(cwd: Option<&Path>) -> Command {
    let mut command = Command::new("git");
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    command
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_ASKPASS", "/bin/true");
    command
}

/// `git clone --depth 1` into `dest`.
pub fn shallow_clone(
    repo_url: &str,
    token: Option<&str>,
    dest: &Path,
    timeout: Duration,
) -> std::result::Result<(), CloneError> {
    let clone_url = clone_url_with_token(repo_url, token);
    let mut command = git_command(None);
    command
        .args(["clone", "--depth", "1", "--", &clone_url])
        .arg(dest);

    let result = run_command_with_timeout(&mut command, timeout)
        .map_err(|e| CloneError::Failed(scrub_token(&e, token)))?;

    if result.timed_out {
        return Err(CloneError::Failed(format!(
            "git clone timed out after {}s",
            timeout.as_secs()
        )));
    }
    if !result.success() {
        let stderr = scrub_token(result.stderr.trim(), token);
        if looks_like_auth_failure(&stderr) {
            return Err(CloneError::Authentication);
        }
        return Err(CloneError::Failed(stderr));
    }
    reset_origin_url(dest, repo_url)
}

/// Point `origin` back at the credential-free URL so the token never rests in
/// `.git/config`; [`push_branch`] supplies it again per push.
fn reset_origin_url(repo_path: &Path, repo_url: &str) -> std::result::Result<(), CloneError> {
    Repository::open(repo_path)
        .and_then(|repo| repo.remote_set_url("origin", repo_url))
        .map_err(|e| CloneError::Failed(format!("Failed to reset origin URL: {}", e.message())))
}

fn origin_url(repo_path: &Path) -> Result<String> {
    let repo = Repository::open(repo_path).context("Failed to open repository")?;
    let remote = repo
        .find_remote("origin")
        .context("Repository has no origin remote")?;
    remote
        .url()
        .map(str::to_string)
        .context("Origin URL is not valid UTF-8")
}

/// Create `name` from HEAD (reusing it if it already exists) and check it out.
pub fn checkout_new_branch(repo_path: &Path, name: &str) -> Result<()> {
    let repo = Repository::open(repo_path).context("Failed to open repository")?;
    let head_commit = repo
        .head()
        .context("Failed to get HEAD")?
        .peel_to_commit()
        .context("HEAD does not point at a commit")?;

    let branch = match repo.find_branch(name, BranchType::Local) {
        Ok(branch) => branch,
        Err(_) => repo
            .branch(name, &head_commit, false)
            .with_context(|| format!("Failed to create branch '{}'", name))?,
    };

    let reference = branch.into_reference();
    let target = reference
        .peel_to_commit()
        .with_context(|| format!("Branch '{}' has no commit", name))?;
    repo.checkout_tree(target.as_object(), None)
        .with_context(|| format!("Failed to check out '{}'", name))?;
    repo.set_head(reference.name().unwrap_or("HEAD"))
        .with_context(|| format!("Failed to move HEAD to '{}'", name))?;
    Ok(())
}

/// Stage a specific file
pub fn stage_file(repo_path: &Path, file_path: &str) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let mut index = repo.index()?;

    index
        .add_path(Path::new(file_path))
        .with_context(|| format!("Failed to stage '{}'", file_path))?;
    index.write()?;

    Ok(())
}

/// Commit staged changes, returning the new commit id.
pub fn commit(repo_path: &Path, message: &str) -> Result<String> {
    let repo = Repository::open(repo_path)?;
    let mut index = repo.index()?;

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;

    let parent = repo.head()?.peel_to_commit()?;

    let config = repo.config()?;
    let name = config
        .get_string("user.name")
        .unwrap_or_else(|_| FALLBACK_AUTHOR_NAME.to_string());
    let email = config
        .get_string("user.email")
        .unwrap_or_else(|_| FALLBACK_AUTHOR_EMAIL.to_string());

    let sig = Signature::now(&name, &email)?;

    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;

    Ok(oid.to_string())
}

/// Push `branch` to origin's URL, with `token` embedded for this push only.
pub fn push_branch(
    repo_path: &Path,
    branch: &str,
    token: Option<&str>,
    timeout: Duration,
) -> Result<()> {
    let target = match token.filter(|t| !t.is_empty()) {
        Some(_) => clone_url_with_token(&origin_url(repo_path)?, token),
        None => "origin".to_string(),
    };
    let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
    let mut command = git_command(Some(repo_path));
    command.args(["push", &target, &refspec]);

    let result = run_command_with_timeout(&mut command, timeout)
        .map_err(|e| anyhow::anyhow!("{}", scrub_token(&e, token)))
        .context("Failed to execute git push")?;

    if result.timed_out {
        anyhow::bail!("git push timed out after {}s", timeout.as_secs());
    }
    if !result.success() {
        anyhow::bail!(
            "git push failed: {}",
            scrub_token(result.stderr.trim(), token)
        );
    }
    Ok(())
}
