//! GitHub repository access checks
//!
//! Decides, before anything is cloned, whether a repository can be read with
//! the credential at hand. Tokens are only ever sent as request headers.

use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const GITHUB_API_URL: &str = "https://api.github.com";
const ACCESS_CHECK_TIMEOUT_SECS: u64 = 10;

/// Maximum length for error body content in error messages
const MAX_ERROR_BODY_LEN: usize = 200;

/// Result of probing a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoAccess {
    /// Readable with the credential supplied (or without one).
    Public,
    /// GitHub answered 401/404: private, or missing, for this credential.
    NeedsCredential,
    Unavailable(String),
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    message: String,
}

/// Sanitize an API error body to prevent credential leakage.
/// Truncates long responses and redacts potential secrets.
fn sanitize_error_body(body: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "token",
        "secret",
        "password",
        "credential",
        "bearer",
        "ghp_",        // GitHub personal access token prefix
        "gho_",        // GitHub OAuth token prefix
        "ghu_",        // GitHub user token prefix
        "github_pat_", // GitHub PAT prefix
    ];

    let message = serde_json::from_str::<ApiErrorResponse>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| body.to_string());
    let truncated = crate::util::truncate(&message, MAX_ERROR_BODY_LEN);

    let lower = truncated.to_lowercase();
    if SECRET_PATTERNS.iter().any(|p| lower.contains(p)) {
        return "(error details redacted - may contain sensitive data)".to_string();
    }
    truncated
}

/// Extract owner and repo from a github.com URL.
///
/// Supports:
/// - https://github.com/owner/repo(.git)(/)
/// - git@github.com:owner/repo(.git)
pub fn parse_github_url(url: &str) -> Option<(String, String)> {
    let url = url.trim();

    let path = if let Some(rest) = url.strip_prefix("git@github.com:") {
        rest.to_string()
    } else {
        let parsed = url::Url::parse(url).ok()?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return None;
        }
        let host = parsed.host_str()?.to_ascii_lowercase();
        if host != "github.com" && host != "www.github.com" {
            return None;
        }
        parsed.path().to_string()
    };

    let mut parts = path
        .trim_matches('/')
        .split('/')
        .filter(|p| !p.is_empty());
    let owner = parts.next()?;
    let repo = parts.next()?.trim_end_matches(".git");
    if parts.next().is_some() || owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

/// Query `GET /repos/{owner}/{repo}` on the public GitHub API.
pub async fn check_repo_access(repo_url: &str, token: Option<&str>) -> RepoAccess {
    check_repo_access_at(GITHUB_API_URL, repo_url, token).await
}

pub async fn check_repo_access_at(
    api_base: &str,
    repo_url: &str,
    token: Option<&str>,
) -> RepoAccess {
    let Some((owner, repo)) = parse_github_url(repo_url) else {
        return RepoAccess::Unavailable("Invalid GitHub URL".to_string());
    };

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(ACCESS_CHECK_TIMEOUT_SECS))
        .build()
    {
        Ok(client) => client,
        Err(e) => return RepoAccess::Unavailable(format!("HTTP client error: {}", e)),
    };

    let url = format!(
        "{}/repos/{}/{}",
        api_base.trim_end_matches('/'),
        owner,
        repo
    );
    let mut request = client
        .get(&url)
        .header("Accept", "application/vnd.github.v3+json")
        .header("User-Agent", "ripple-agent");
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        request = request.header("Authorization", format!("token {}", token));
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            let reason = if e.is_timeout() {
                "GitHub request timed out".to_string()
            } else {
                format!("GitHub request failed: {}", e.without_url())
            };
            return RepoAccess::Unavailable(reason);
        }
    };

    let status = response.status().as_u16();
    debug!(owner = %owner, repo = %repo, status, "repository access check");
    match status {
        200 => RepoAccess::Public,
        401 | 404 => RepoAccess::NeedsCredential,
        _ => {
            let body = response.text().await.unwrap_or_default();
            RepoAccess::Unavailable(format!(
                "GitHub API error ({}): {}",
                status,
                sanitize_error_body(&body)
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StubServer;

    #[test]
    fn test_parse_https_url() {
        let (owner, repo) = parse_github_url("https://github.com/acme/widgets").unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(repo, "widgets");
    }

    #[test]
    fn test_parse_https_url_with_git_suffix_and_slash() {
        let (owner, repo) = parse_github_url("https://github.com/acme/widgets.git/").unwrap();
        assert_eq!((owner.as_str(), repo.as_str()), ("acme", "widgets"));
    }

    #[test]
    fn test_parse_ssh_url() {
        let (owner, repo) = parse_github_url("git@github.com:My-Org/my_repo.git").unwrap();
        assert_eq!(owner, "My-Org");
        assert_eq!(repo, "my_repo");
    }

    #[test]
    fn test_parse_rejects_other_hosts_and_shapes() {
        assert!(parse_github_url("https://gitlab.com/user/repo").is_none());
        assert!(parse_github_url("https://github.mycompany.com/owner/repo").is_none());
        assert!(parse_github_url("https://github.com/owner").is_none());
        assert!(parse_github_url("https://github.com/org/sub/repo").is_none());
        assert!(parse_github_url("ftp://github.com/owner/repo").is_none());
        assert!(parse_github_url("not-a-url").is_none());
        assert!(parse_github_url("").is_none());
    }

    #[test]
    fn test_sanitize_error_body_extracts_message() {
        assert_eq!(
            sanitize_error_body(r#"{"message":"API rate limit exceeded"}"#),
            "API rate limit exceeded"
        );
    }

    #[test]
    fn test_sanitize_error_body_redacts_secrets() {
        let sanitized = sanitize_error_body("bad credentials for ghp_abcdef");
        assert!(!sanitized.contains("ghp_"));
    }

    #[tokio::test]
    async fn test_invalid_url_is_unavailable_without_network() {
        let access = check_repo_access("https://example.com/a/b", None).await;
        assert_eq!(access, RepoAccess::Unavailable("Invalid GitHub URL".into()));
    }

    #[tokio::test]
    async fn test_unreachable_api_is_unavailable() {
        let access =
            check_repo_access_at("http://127.0.0.1:1", "https://github.com/acme/widgets", None)
                .await;
        assert!(matches!(access, RepoAccess::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_access_status_mapping() {
        let server = StubServer::start(vec![
            (200, r#"{"private":false}"#),
            (401, r#"{"message":"Bad credentials"}"#),
            (404, r#"{"message":"Not Found"}"#),
            (500, r#"{"message":"Server Error"}"#),
        ])
        .await;
        let url = "https://github.com/acme/widgets";

        let results = [
            check_repo_access_at(&server.base_url, url, Some("ghp_abc")).await,
            check_repo_access_at(&server.base_url, url, None).await,
            check_repo_access_at(&server.base_url, url, None).await,
            check_repo_access_at(&server.base_url, url, None).await,
        ];

        assert_eq!(results[0], RepoAccess::Public);
        assert_eq!(results[1], RepoAccess::NeedsCredential);
        assert_eq!(results[2], RepoAccess::NeedsCredential);
        let RepoAccess::Unavailable(reason) = &results[3] else {
            panic!("expected Unavailable, got {:?}", results[3]);
        };
        assert!(reason.contains("500"));
        assert!(reason.contains("Server Error"));

        let heads = server.heads();
        assert!(heads[0].starts_with("GET /repos/acme/widgets "));
        assert!(heads[0].to_lowercase().contains("authorization: token ghp_abc"));
        assert!(!heads[1].to_lowercase().contains("authorization"));
    }
}
