//! Configuration management for ripple
//!
//! Stores settings in ~/.config/ripple/config.json. Secrets never go to disk:
//! the patch-service key and the default GitHub token come from the
//! environment only.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Bounds for the retry budget of a single run.
pub const MIN_RETRY_LIMIT: u32 = 1;
pub const MAX_RETRY_LIMIT: u32 = 10;

const DEFAULT_RETRY_LIMIT: u32 = 5;
const DEFAULT_MODEL: &str = "gemini-1.5-flash";
const DEFAULT_CONTAINER_IMAGE: &str = "node:20-alpine";
const DEFAULT_MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

const API_KEY_ENV: &str = "GEMINI_API_KEY";
const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default retry budget when a run does not override it
    pub retry_limit: u32,
    /// Patch model identifier
    pub model: String,
    pub patch_timeout_secs: u64,
    /// Extra attempts after an HTTP 429 before giving up
    pub patch_max_retries: u32,
    pub container_image: String,
    pub container_timeout_secs: u64,
    /// When false, containers run with `--network none`
    pub container_network: bool,
    pub install_timeout_secs: u64,
    pub test_timeout_secs: u64,
    /// Cap on combined stdout+stderr captured from one sandbox command
    pub max_output_bytes: usize,
    pub git_timeout_secs: u64,
    /// Parent directory for per-run working trees (default `./clones`)
    pub clones_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_limit: DEFAULT_RETRY_LIMIT,
            model: DEFAULT_MODEL.to_string(),
            patch_timeout_secs: 30,
            patch_max_retries: 2,
            container_image: DEFAULT_CONTAINER_IMAGE.to_string(),
            container_timeout_secs: 300,
            container_network: true,
            install_timeout_secs: 120,
            test_timeout_secs: 180,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            git_timeout_secs: 300,
            clones_dir: None,
        }
    }
}

/// Clamp a requested retry budget into the supported range.
pub fn clamp_retry_limit(limit: u32) -> u32 {
    limit.clamp(MIN_RETRY_LIMIT, MAX_RETRY_LIMIT)
}

impl Config {
    fn sanitize(&mut self) {
        self.retry_limit = clamp_retry_limit(self.retry_limit);
        self.patch_timeout_secs = self.patch_timeout_secs.max(1);
        self.container_timeout_secs = self.container_timeout_secs.max(1);
        self.install_timeout_secs = self.install_timeout_secs.max(1);
        self.test_timeout_secs = self.test_timeout_secs.max(1);
        self.git_timeout_secs = self.git_timeout_secs.max(1);
        self.max_output_bytes = self.max_output_bytes.max(1);
        if self.model.trim().is_empty() {
            self.model = DEFAULT_MODEL.to_string();
        }
        if self.container_image.trim().is_empty() {
            self.container_image = DEFAULT_CONTAINER_IMAGE.to_string();
        }
    }

    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ripple"))
    }

    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Resolve the process-wide configuration: file, then environment.
    pub fn resolve() -> Self {
        let mut config = Self::load();
        config.apply_env(|key| std::env::var(key).ok());
        config.sanitize();
        config
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str::<Config>(&content) {
            Ok(mut config) => {
                config.sanitize();
                config
            }
            Err(err) => {
                preserve_corrupt_config(path, &content);
                warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    /// Apply environment overrides through `lookup` (injectable for tests).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(limit) = lookup("RETRY_LIMIT").and_then(|v| v.trim().parse::<u32>().ok()) {
            self.retry_limit = limit;
        }
        if let Some(model) = lookup("RIPPLE_MODEL").filter(|v| !v.trim().is_empty()) {
            self.model = model.trim().to_string();
        }
        if let Some(dir) = lookup("RIPPLE_CLONES_DIR").filter(|v| !v.trim().is_empty()) {
            self.clones_dir = Some(PathBuf::from(dir.trim()));
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<PathBuf, String> {
        let mut sanitized = self.clone();
        sanitized.sanitize();
        let dir =
            Self::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;

        fs::create_dir_all(&dir)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)) {
                warn!(error = %e, "failed to set config directory permissions");
            }
        }

        let path = dir.join("config.json");
        let content = serde_json::to_string_pretty(&sanitized)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        crate::util::write_atomic(&path, &content)
            .map_err(|e| format!("Failed to write config: {}", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(&path, fs::Permissions::from_mode(0o600)) {
                warn!(error = %e, "failed to set config file permissions");
            }
        }

        Ok(path)
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/ripple/config.json".to_string())
    }

    /// Patch-service API key (environment only).
    pub fn api_key() -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }

    /// Default GitHub token used when a run does not bring its own.
    pub fn default_github_token() -> Option<String> {
        std::env::var(GITHUB_TOKEN_ENV)
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }

    /// Environment variables that must never reach sandboxed commands.
    pub fn secret_env_vars() -> &'static [&'static str] {
        &[API_KEY_ENV, GITHUB_TOKEN_ENV, "GH_TOKEN"]
    }

    pub fn clones_dir(&self) -> PathBuf {
        self.clones_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("clones"))
    }

    pub fn patch_timeout(&self) -> Duration {
        Duration::from_secs(self.patch_timeout_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.retry_limit, 5);
        assert_eq!(config.container_image, "node:20-alpine");
        assert!(config.clones_dir.is_none());
    }

    #[test]
    fn test_retry_limit_is_clamped() {
        assert_eq!(clamp_retry_limit(0), 1);
        assert_eq!(clamp_retry_limit(7), 7);
        assert_eq!(clamp_retry_limit(99), 10);
    }

    #[test]
    fn test_env_overrides_then_sanitize() {
        let env: HashMap<&str, &str> = [
            ("RETRY_LIMIT", "42"),
            ("RIPPLE_MODEL", " gemini-2.0-flash "),
            ("RIPPLE_CLONES_DIR", "/tmp/ripple-clones"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));
        config.sanitize();

        assert_eq!(config.retry_limit, 10);
        assert_eq!(config.model, "gemini-2.0-flash");
        assert_eq!(config.clones_dir(), PathBuf::from("/tmp/ripple-clones"));
    }

    #[test]
    fn test_unparseable_env_retry_limit_is_ignored() {
        let mut config = Config::default();
        config.apply_env(|key| (key == "RETRY_LIMIT").then(|| "lots".to_string()));
        assert_eq!(config.retry_limit, 5);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"retry_limit": 3, "container_network": false}"#).unwrap();

        let config = Config::load_from(&path);
        assert_eq!(config.retry_limit, 3);
        assert!(!config.container_network);
        assert_eq!(config.test_timeout_secs, 180);
    }

    #[test]
    fn test_corrupt_file_is_preserved_and_defaults_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let config = Config::load_from(&path);
        assert_eq!(config, Config::default());
        assert!(dir.path().join("config.json.corrupt").exists());
    }
}
