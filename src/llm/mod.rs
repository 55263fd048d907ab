//! Patch-generation service: prompt in, patch text out.

pub mod client;
pub mod prompts;

use crate::analyzer::BugType;
use async_trait::async_trait;
use thiserror::Error;

pub use client::GeminiPatchService;

/// What the service is told about one failure.
#[derive(Debug, Clone)]
pub struct PatchRequest {
    pub bug_type: BugType,
    /// Path of the target file relative to the repository root
    pub file_path: String,
    pub line: Option<usize>,
    /// Raw test output around the failure
    pub error_snippet: String,
    pub file_content: String,
}

#[derive(Debug, Error)]
pub enum PatchServiceError {
    #[error("patch service API key is not configured")]
    MissingCredential,
    #[error("patch service rate limit exceeded after {retries} retries")]
    RateLimited { retries: u32 },
    #[error("patch service error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("patch request timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("patch service returned no text")]
    EmptyResponse,
    #[error("patch request failed: {0}")]
    Transport(String),
}

/// External patch generator. Implementations must bound their own latency;
/// callers additionally wrap each request in a timeout.
#[async_trait]
pub trait PatchService: Send + Sync {
    /// Whether a credential is configured. Runs without one skip patching.
    fn is_available(&self) -> bool;

    async fn request_patch(&self, request: &PatchRequest) -> Result<String, PatchServiceError>;
}
