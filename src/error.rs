//! Errors that end a run before the first iteration.
//!
//! Everything after the loop starts is recorded on the report instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    /// The repository exists but a credential is required to read it.
    #[error("PRIVATE_REPO: repository requires a GitHub token")]
    NeedsCredential,
    #[error("repository is not accessible: {0}")]
    Inaccessible(String),
    #[error("invalid GitHub repository URL: {0}")]
    InvalidRepoUrl(String),
    #[error("clone failed: {0}")]
    Clone(String),
    #[error("could not create branch: {0}")]
    Branch(String),
    #[error("could not prepare working directory: {0}")]
    Workspace(#[from] std::io::Error),
}

impl RunError {
    /// Stable machine-readable code for CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            RunError::NeedsCredential => "PRIVATE_REPO",
            RunError::Inaccessible(_) => "REPO_UNAVAILABLE",
            RunError::InvalidRepoUrl(_) => "INVALID_REPO_URL",
            RunError::Clone(_) => "CLONE_FAILED",
            RunError::Branch(_) => "BRANCH_FAILED",
            RunError::Workspace(_) => "WORKSPACE_FAILED",
        }
    }

    pub fn needs_credential(&self) -> bool {
        matches!(self, RunError::NeedsCredential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_credential_is_distinct() {
        assert!(RunError::NeedsCredential.needs_credential());
        assert!(!RunError::Inaccessible("timeout".into()).needs_credential());
        assert_eq!(RunError::NeedsCredential.code(), "PRIVATE_REPO");
    }

    #[test]
    fn test_io_converts_to_workspace_error() {
        let err: RunError = std::io::Error::other("disk full").into();
        assert_eq!(err.code(), "WORKSPACE_FAILED");
        assert!(err.to_string().contains("disk full"));
    }
}
