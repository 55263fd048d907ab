//! Version-control seam used by the orchestrator.

use crate::git_ops::{self, CloneError};
use crate::github::{self, RepoAccess};
use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[async_trait]
pub trait Vcs: Send + Sync {
    async fn check_access(&self, repo_url: &str, token: Option<&str>) -> RepoAccess;

    async fn clone_shallow(
        &self,
        repo_url: &str,
        token: Option<&str>,
        dest: &Path,
    ) -> std::result::Result<(), CloneError>;

    async fn checkout_branch(&self, repo_path: &Path, branch: &str) -> Result<()>;

    /// Stage `file` (relative to the repository root) and commit it.
    async fn commit_file(&self, repo_path: &Path, file: &str, message: &str) -> Result<String>;

    async fn push(&self, repo_path: &Path, branch: &str, token: Option<&str>) -> Result<()>;
}

/// GitHub + local git implementation.
pub struct GitVcs {
    git_timeout: Duration,
}

impl GitVcs {
    pub fn new(git_timeout: Duration) -> Self {
        Self { git_timeout }
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow::anyhow!("git task panicked: {}", e))?
}

#[async_trait]
impl Vcs for GitVcs {
    async fn check_access(&self, repo_url: &str, token: Option<&str>) -> RepoAccess {
        github::check_repo_access(repo_url, token).await
    }

    async fn clone_shallow(
        &self,
        repo_url: &str,
        token: Option<&str>,
        dest: &Path,
    ) -> std::result::Result<(), CloneError> {
        let url = repo_url.to_string();
        let token = token.map(str::to_string);
        let dest = dest.to_path_buf();
        let timeout = self.git_timeout;
        tokio::task::spawn_blocking(move || {
            git_ops::shallow_clone(&url, token.as_deref(), &dest, timeout)
        })
        .await
        .map_err(|e| CloneError::Failed(format!("clone task panicked: {}", e)))?
    }

    async fn checkout_branch(&self, repo_path: &Path, branch: &str) -> Result<()> {
        let repo: PathBuf = repo_path.to_path_buf();
        let branch = branch.to_string();
        blocking(move || git_ops::checkout_new_branch(&repo, &branch)).await
    }

    async fn commit_file(&self, repo_path: &Path, file: &str, message: &str) -> Result<String> {
        let repo = repo_path.to_path_buf();
        let file = file.to_string();
        let message = message.to_string();
        blocking(move || {
            git_ops::stage_file(&repo, &file)?;
            git_ops::commit(&repo, &message)
        })
        .await
    }

    async fn push(&self, repo_path: &Path, branch: &str, token: Option<&str>) -> Result<()> {
        let repo = repo_path.to_path_buf();
        let branch = branch.to_string();
        let token = token.map(str::to_string);
        let timeout = self.git_timeout;
        blocking(move || git_ops::push_branch(&repo, &branch, token.as_deref(), timeout)).await
    }
}
