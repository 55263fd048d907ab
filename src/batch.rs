//! Several runs from one TOML manifest, executed concurrently.
//!
//! ```toml
//! schema_version = 1
//!
//! [[run]]
//! repo_url = "https://github.com/acme/app"
//! team_name = "Acme"
//! leader_name = "Jo"
//! retry_limit = 3
//! ```

use crate::orchestrator::{Orchestrator, RunRequest};
use crate::report::RunReport;
use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

pub const SCHEMA_VERSION: u32 = 1;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub run: Vec<BatchRunSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRunSpec {
    pub repo_url: String,
    pub team_name: String,
    pub leader_name: String,
    #[serde(default)]
    pub retry_limit: Option<u32>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl BatchRunSpec {
    fn request(&self, github_token: Option<String>) -> RunRequest {
        RunRequest {
            repo_url: self.repo_url.clone(),
            team_name: self.team_name.clone(),
            leader_name: self.leader_name.clone(),
            github_token,
            retry_limit: self.retry_limit,
        }
    }
}

impl BatchManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read batch manifest '{}'", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid batch manifest '{}'", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let manifest: BatchManifest =
            toml::from_str(content).context("Failed to parse batch manifest TOML")?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(anyhow!(
                "Unsupported batch manifest schema_version={} (expected {})",
                self.schema_version,
                SCHEMA_VERSION
            ));
        }
        for (index, spec) in self.run.iter().enumerate() {
            spec.request(None)
                .validate()
                .map_err(|e| anyhow!("run #{} ({}): {}", index + 1, spec.repo_url, e))?;
        }
        Ok(())
    }

    pub fn enabled_runs(&self) -> impl Iterator<Item = &BatchRunSpec> {
        self.run.iter().filter(|spec| spec.enabled)
    }
}

/// One manifest entry's result: the report, or why the run never started.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BatchOutcome {
    Report(Box<RunReport>),
    #[serde(rename_all = "camelCase")]
    Failed {
        repo_url: String,
        error: String,
        code: String,
    },
}

impl BatchOutcome {
    pub fn is_report(&self) -> bool {
        matches!(self, BatchOutcome::Report(_))
    }
}

/// Run every enabled entry concurrently. Outcomes keep manifest order.
pub async fn run_batch(
    orchestrator: &Orchestrator,
    manifest: &BatchManifest,
    github_token: Option<String>,
) -> Vec<BatchOutcome> {
    let requests: Vec<RunRequest> = manifest
        .enabled_runs()
        .map(|spec| spec.request(github_token.clone()))
        .collect();
    info!(runs = requests.len(), "starting batch");

    let runs = requests.iter().map(|request| async move {
        let request = match request.clone().validate() {
            Ok(request) => request,
            Err(e) => {
                return BatchOutcome::Failed {
                    repo_url: request.repo_url.clone(),
                    error: e.to_string(),
                    code: "INVALID_REQUEST".to_string(),
                }
            }
        };
        match orchestrator.run(&request).await {
            Ok(report) => BatchOutcome::Report(Box::new(report)),
            Err(e) => BatchOutcome::Failed {
                repo_url: request.repo_url.clone(),
                error: e.to_string(),
                code: e.code().to_string(),
            },
        }
    });
    join_all(runs).await
}
