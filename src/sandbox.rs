//! Sandboxed install + test execution
//!
//! Runs a repository's test suite inside a throwaway container when a
//! container runtime is available, otherwise as plain child processes with
//! a scrubbed environment. Every outcome, including timeouts and runaway
//! output, comes back as a [`TestRun`]; nothing here returns an error.

use crate::config::Config;
use crate::util::{run_command_with_limits, run_command_with_timeout, CommandRunResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DOCKER_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const CONTAINER_REMOVE_TIMEOUT: Duration = Duration::from_secs(30);
const CONTAINER_WORKDIR: &str = "/app";

/// How a suite was isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    Container,
    Process,
}

/// A test command as program + arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl TestCommand {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn npm_test() -> Self {
        Self::new("npm", &["test"])
    }

    pub fn label(&self) -> String {
        let mut parts = vec![self.program.as_str()];
        parts.extend(self.args.iter().map(String::as_str));
        parts.join(" ")
    }

    fn to_command(&self, cwd: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command.current_dir(cwd).args(&self.args);
        command
    }
}

/// Outcome of one sandboxed suite execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRun {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub test_command: String,
    pub isolation: Isolation,
    pub timed_out: bool,
    pub output_truncated: bool,
    pub duration_ms: u64,
}

impl TestRun {
    /// stdout followed by stderr, the text handed to the analyzer.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Executes a repository's test suite.
pub trait TestRunner: Send + Sync {
    /// Install dependencies, then run the suite.
    fn run(&self, repo_path: &Path) -> TestRun;

    /// Re-run after a patch. Same operation as [`TestRunner::run`].
    fn run_tests_only(&self, repo_path: &Path) -> TestRun {
        self.run(repo_path)
    }
}

/// The repository's test command. Always `npm test`, which is how npm runs
/// the `scripts.test` entry of `package.json`; a repository without one is
/// logged here and fails the run with npm's missing-script error.
pub fn discover_test_command(repo_path: &Path) -> TestCommand {
    let declared = fs::read_to_string(repo_path.join("package.json"))
        .ok()
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
        .and_then(|pkg| {
            pkg.get("scripts")
                .and_then(|s| s.get("test"))
                .and_then(|t| t.as_str())
                .map(|t| !t.trim().is_empty())
        })
        .unwrap_or(false);
    if !declared {
        debug!(repo = %repo_path.display(), "no declared test script; defaulting to npm test");
    }
    TestCommand::npm_test()
}

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub container_image: String,
    pub container_timeout: Duration,
    pub container_network: bool,
    pub install_timeout: Duration,
    pub test_timeout: Duration,
    pub max_output_bytes: usize,
}

impl SandboxSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            container_image: config.container_image.clone(),
            container_timeout: Duration::from_secs(config.container_timeout_secs),
            container_network: config.container_network,
            install_timeout: Duration::from_secs(config.install_timeout_secs),
            test_timeout: Duration::from_secs(config.test_timeout_secs),
            max_output_bytes: config.max_output_bytes,
        }
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Container-or-process test runner. Safe to share across concurrent runs:
/// each invocation owns its child processes and timeouts.
pub struct SandboxRunner {
    settings: SandboxSettings,
    forced: Option<Isolation>,
    docker_available: OnceLock<bool>,
    install: Option<TestCommand>,
    test_override: Option<TestCommand>,
}

impl SandboxRunner {
    pub fn new(settings: SandboxSettings) -> Self {
        Self {
            settings,
            forced: None,
            docker_available: OnceLock::new(),
            install: Some(TestCommand::new("npm", &["install", "--silent"])),
            test_override: None,
        }
    }

    /// Never check for a container runtime.
    pub fn process_only(mut self) -> Self {
        self.forced = Some(Isolation::Process);
        self
    }

    /// Run `command` instead of the discovered one (process mode only).
    pub fn with_test_command(mut self, command: TestCommand) -> Self {
        self.test_override = Some(command);
        self
    }

    /// Skip the dependency install step (process mode only).
    pub fn without_install(mut self) -> Self {
        self.install = None;
        self
    }

    pub fn isolation(&self) -> Isolation {
        if let Some(forced) = self.forced {
            return forced;
        }
        let available = *self.docker_available.get_or_init(detect_docker);
        if available {
            Isolation::Container
        } else {
            Isolation::Process
        }
    }

    /// `docker run` invocation for one suite: repo bind-mounted at `/app`,
    /// install then test in one shell, secrets scrubbed.
    fn container_command(&self, abs: &Path, name: &str, test: &TestCommand) -> Command {
        let script = format!(
            "npm install --silent 2>/dev/null; {} 2>&1",
            test.label()
        );

        let mut command = Command::new("docker");
        command
            .arg("run")
            .arg("--rm")
            .args(["--name", name])
            .arg("-v")
            .arg(format!("{}:{}", abs.display(), CONTAINER_WORKDIR))
            .args(["-w", CONTAINER_WORKDIR])
            .args(["-e", "CI=true"]);
        if !self.settings.container_network {
            command.args(["--network", "none"]);
        }
        command
            .arg(&self.settings.container_image)
            .args(["sh", "-c", &script]);
        scrub_env(&mut command);
        command
    }

    fn run_in_container(&self, repo_path: &Path, test: &TestCommand) -> TestRun {
        let start = Instant::now();
        let name = container_name();
        let mut command = self.container_command(&absolute(repo_path), &name, test);

        info!(container = %name, image = %self.settings.container_image, "running tests in container");
        let outcome = run_command_with_limits(
            &mut command,
            self.settings.container_timeout,
            Some(self.settings.max_output_bytes),
        );

        if let Ok(result) = &outcome {
            if result.timed_out || result.output_overflow {
                remove_container(&name);
            }
        }
        finish(outcome, test, Isolation::Container, start)
    }

    fn run_in_process(&self, repo_path: &Path, test: &TestCommand) -> TestRun {
        let start = Instant::now();

        if let Some(install) = &self.install {
            let mut command = install.to_command(repo_path);
            scrub_env(&mut command);
            match run_command_with_limits(
                &mut command,
                self.settings.install_timeout,
                Some(self.settings.max_output_bytes),
            ) {
                Ok(result) if !result.success() => {
                    warn!(
                        timed_out = result.timed_out,
                        output_overflow = result.output_overflow,
                        "dependency install did not succeed; running tests anyway"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "dependency install could not start"),
            }
        }

        let mut command = test.to_command(repo_path);
        scrub_env(&mut command);
        let outcome = run_command_with_limits(
            &mut command,
            self.settings.test_timeout,
            Some(self.settings.max_output_bytes),
        );
        finish(outcome, test, Isolation::Process, start)
    }
}

impl TestRunner for SandboxRunner {
    fn run(&self, repo_path: &Path) -> TestRun {
        let isolation = self.isolation();
        let run = match isolation {
            Isolation::Container => {
                self.run_in_container(repo_path, &discover_test_command(repo_path))
            }
            Isolation::Process => {
                let test = self
                    .test_override
                    .clone()
                    .unwrap_or_else(|| discover_test_command(repo_path));
                self.run_in_process(repo_path, &test)
            }
        };
        debug!(
            success = run.success,
            timed_out = run.timed_out,
            truncated = run.output_truncated,
            duration_ms = run.duration_ms,
            "test run finished"
        );
        run
    }
}

fn finish(
    outcome: Result<CommandRunResult, String>,
    test: &TestCommand,
    isolation: Isolation,
    start: Instant,
) -> TestRun {
    let duration_ms = start.elapsed().as_millis() as u64;
    match outcome {
        Ok(result) => TestRun {
            success: result.success(),
            stdout: result.stdout,
            stderr: result.stderr,
            test_command: test.label(),
            isolation,
            timed_out: result.timed_out,
            output_truncated: result.output_overflow,
            duration_ms,
        },
        Err(e) => TestRun {
            success: false,
            stdout: String::new(),
            stderr: e,
            test_command: test.label(),
            isolation,
            timed_out: false,
            output_truncated: false,
            duration_ms,
        },
    }
}

/// Secrets never reach the suite; prompts must not block it.
fn scrub_env(command: &mut Command) {
    for key in Config::secret_env_vars() {
        command.env_remove(key);
    }
    command.env("CI", "true").env("GIT_TERMINAL_PROMPT", "0");
}

/// Unique per invocation so a stuck container can be removed by name.
fn container_name() -> String {
    format!("ripple-{}", uuid::Uuid::new_v4().simple())
}

fn detect_docker() -> bool {
    let mut command = Command::new("docker");
    command.arg("info");
    let available = run_command_with_timeout(&mut command, DOCKER_CHECK_TIMEOUT)
        .map(|r| r.success())
        .unwrap_or(false);
    info!(available, "container runtime detection");
    available
}

fn remove_container(name: &str) {
    let mut command = Command::new("docker");
    command.args(["rm", "-f", name]);
    match run_command_with_timeout(&mut command, CONTAINER_REMOVE_TIMEOUT) {
        Ok(result) if result.success() => debug!(container = %name, "removed container"),
        Ok(result) => warn!(container = %name, stderr = %result.stderr.trim(), "container removal failed"),
        Err(e) => warn!(container = %name, error = %e, "container removal failed"),
    }
}

fn absolute(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    })
}
