use super::prompts::build_patch_prompt;
use super::{PatchRequest, PatchService, PatchServiceError};
use crate::config::Config;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

const TEMPERATURE: f32 = 0.2;
const MAX_OUTPUT_TOKENS: u32 = 2048;

/// Rate limit retry configuration
const INITIAL_BACKOFF_SECS: u64 = 2;
const BACKOFF_MULTIPLIER: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 60;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
}

#[derive(Deserialize)]
struct ResponseCandidate {
    content: Option<Content>,
}

/// Gemini `generateContent` client.
pub struct GeminiPatchService {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    timeout: Duration,
    max_retries: u32,
}

impl GeminiPatchService {
    pub fn new(api_key: Option<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model: model.into(),
            base_url: GEMINI_BASE_URL.to_string(),
            timeout,
            max_retries: 2,
        }
    }

    /// Key from the environment, everything else from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(Config::api_key(), config.model.clone(), config.patch_timeout())
            .with_max_retries(config.patch_max_retries)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/{}:generateContent", self.base_url, self.model)
    }
}

#[async_trait]
impl PatchService for GeminiPatchService {
    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn request_patch(&self, request: &PatchRequest) -> Result<String, PatchServiceError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(PatchServiceError::MissingCredential)?;

        let body = GenerateRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: Some(build_patch_prompt(request)),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: TEMPERATURE,
                max_output_tokens: MAX_OUTPUT_TOKENS,
            },
        };

        let started = Instant::now();
        let mut retry_count = 0;
        loop {
            // The key goes in a header so it never appears in a logged URL.
            let response = self
                .client
                .post(self.endpoint())
                .header("Content-Type", "application/json")
                .header("x-goog-api-key", api_key)
                .timeout(self.timeout)
                .json(&body)
                .send()
                .await
                .map_err(|e| map_transport_error(e, self.timeout))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| map_transport_error(e, self.timeout))?;

            if status.is_success() {
                return extract_patch_text(&text);
            }

            if status.as_u16() == 429 {
                if retry_count >= self.max_retries {
                    return Err(PatchServiceError::RateLimited {
                        retries: retry_count,
                    });
                }
                let delay = parse_retry_after(&text)
                    .unwrap_or_else(|| backoff_secs(retry_count + 1))
                    .min(MAX_BACKOFF_SECS);
                // Waiting past the request budget would surface as a timeout
                // instead of a rate limit.
                if started.elapsed() + Duration::from_secs(delay) >= self.timeout {
                    warn!(
                        delay_secs = delay,
                        "rate limit backoff exceeds the request budget; giving up"
                    );
                    return Err(PatchServiceError::RateLimited {
                        retries: retry_count,
                    });
                }
                retry_count += 1;
                warn!(
                    attempt = retry_count,
                    max = self.max_retries,
                    delay_secs = delay,
                    "patch service rate limited; backing off"
                );
                tokio::time::sleep(Duration::from_secs(delay)).await;
                continue;
            }

            let message = match status.as_u16() {
                401 | 403 => "API key was rejected".to_string(),
                500..=599 => "server error; the service may be temporarily unavailable".to_string(),
                _ => redact(&crate::util::truncate(&text, 200), api_key),
            };
            debug!(status = status.as_u16(), "patch service returned an error");
            return Err(PatchServiceError::Api {
                status: status.as_u16(),
                message,
            });
        }
    }
}

fn map_transport_error(err: reqwest::Error, timeout: Duration) -> PatchServiceError {
    if err.is_timeout() {
        PatchServiceError::Timeout {
            secs: timeout.as_secs(),
        }
    } else {
        // reqwest errors carry the URL, which does not include the key.
        PatchServiceError::Transport(err.without_url().to_string())
    }
}

/// Pull `candidates[0].content.parts[0].text` out of a response body.
fn extract_patch_text(body: &str) -> Result<String, PatchServiceError> {
    let parsed: GenerateResponse = serde_json::from_str(body)
        .map_err(|e| PatchServiceError::Transport(format!("unreadable response: {}", e)))?;
    parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .and_then(|c| c.parts.into_iter().next())
        .and_then(|p| p.text)
        .filter(|t| !t.trim().is_empty())
        .ok_or(PatchServiceError::EmptyResponse)
}

fn backoff_secs(attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1).min(16);
    (INITIAL_BACKOFF_SECS * BACKOFF_MULTIPLIER.pow(exp)).min(MAX_BACKOFF_SECS)
}

/// Extract a retry hint like "retry in 7s" from an error body.
fn parse_retry_after(text: &str) -> Option<u64> {
    let lower = text.to_lowercase();
    let pos = lower.find("retry")?;
    lower[pos..]
        .split_whitespace()
        .skip(1)
        .take(5)
        .filter_map(|word| {
            word.trim_matches(|c: char| !c.is_ascii_digit())
                .parse::<u64>()
                .ok()
        })
        .find(|secs| *secs > 0 && *secs < 300)
}

fn redact(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        return text.to_string();
    }
    text.replace(secret, "[REDACTED]")
}
