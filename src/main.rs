use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use ripple::batch::{run_batch, BatchManifest};
use ripple::config::Config;
use ripple::llm::{GeminiPatchService, PatchService};
use ripple::orchestrator::{Orchestrator, OrchestratorSettings, RunRequest};
use ripple::report::write_report_to;
use ripple::sandbox::{SandboxRunner, SandboxSettings, TestRunner};
use ripple::vcs::{GitVcs, Vcs};
use ripple::{analyzer, patch};
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "ripple",
    about = "Run a repository's tests, patch what fails, verify and commit",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Repair one repository and print its report
    Run(RunArgs),
    /// Repair every enabled repository in a TOML manifest
    Batch(BatchArgs),
    /// Localize and classify failures in test output
    Analyze(AnalyzeArgs),
    /// Apply a unified diff or line-replacement patch to a file
    Apply(ApplyArgs),
    /// Show the effective configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    repo_url: String,
    #[arg(long)]
    team: String,
    #[arg(long)]
    leader: String,
    /// 1-10; defaults to the configured limit
    #[arg(long)]
    retry_limit: Option<u32>,
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// Leave the working tree and its results.json on disk
    #[arg(long)]
    keep_workspace: bool,
    /// Also write the report here
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct BatchArgs {
    manifest: PathBuf,
    #[arg(long)]
    keep_workspace: bool,
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    /// Test output file; stdin when omitted
    file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ApplyArgs {
    file: PathBuf,
    patch: PathBuf,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Write the effective configuration to the config file
    #[arg(long)]
    init: bool,
}

const EXIT_FAILURE: u8 = 1;
const EXIT_NEEDS_CREDENTIAL: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let config = Arc::new(Config::resolve());

    let result = match cli.command {
        Commands::Run(args) => cmd_run(args, config).await,
        Commands::Batch(args) => cmd_batch(args, config).await,
        Commands::Analyze(args) => cmd_analyze(args).map(|_| ExitCode::SUCCESS),
        Commands::Apply(args) => cmd_apply(args).map(|_| ExitCode::SUCCESS),
        Commands::Config(args) => cmd_config(args, &config).map(|_| ExitCode::SUCCESS),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_orchestrator(config: &Config, keep_workspace: bool) -> Orchestrator {
    let runner: Arc<dyn TestRunner> =
        Arc::new(SandboxRunner::new(SandboxSettings::from_config(config)));
    let patches: Arc<dyn PatchService> = Arc::new(GeminiPatchService::from_config(config));
    if !patches.is_available() {
        warn!("no patch service API key configured; failures will be reported but not patched");
    }
    let vcs: Arc<dyn Vcs> = Arc::new(GitVcs::new(config.git_timeout()));

    let mut settings = OrchestratorSettings::from_config(config);
    settings.keep_workspace = keep_workspace;
    Orchestrator::new(runner, patches, vcs, settings)
}

async fn cmd_run(args: RunArgs, config: Arc<Config>) -> Result<ExitCode> {
    let request = RunRequest {
        repo_url: args.repo_url,
        team_name: args.team,
        leader_name: args.leader,
        github_token: args.token,
        retry_limit: args.retry_limit,
    }
    .validate()?;

    let orchestrator = build_orchestrator(&config, args.keep_workspace);
    match orchestrator.run(&request).await {
        Ok(report) => {
            if let Some(out) = args.out.as_deref() {
                write_report_to(&report, out)?;
                info!(path = %out.display(), "report copied");
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            let body = serde_json::json!({ "error": e.to_string(), "code": e.code() });
            println!("{}", serde_json::to_string_pretty(&body)?);
            if e.needs_credential() {
                eprintln!("PRIVATE_REPO: supply a GitHub token with --token or GITHUB_TOKEN");
                Ok(ExitCode::from(EXIT_NEEDS_CREDENTIAL))
            } else {
                eprintln!("Error: {}", e);
                Ok(ExitCode::from(EXIT_FAILURE))
            }
        }
    }
}

async fn cmd_batch(args: BatchArgs, config: Arc<Config>) -> Result<ExitCode> {
    let manifest = BatchManifest::load(&args.manifest)?;
    let orchestrator = build_orchestrator(&config, args.keep_workspace);
    let outcomes = run_batch(&orchestrator, &manifest, Config::default_github_token()).await;
    println!("{}", serde_json::to_string_pretty(&outcomes)?);
    if outcomes.iter().all(|o| o.is_report()) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_FAILURE))
    }
}

fn cmd_analyze(args: AnalyzeArgs) -> Result<()> {
    let output = match args.file.as_deref() {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read '{}'", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read test output from stdin")?;
            buf
        }
    };
    let candidates = analyzer::analyze(&output);
    println!("{}", serde_json::to_string_pretty(&candidates)?);
    Ok(())
}

fn cmd_apply(args: ApplyArgs) -> Result<()> {
    let patch_text = std::fs::read_to_string(&args.patch)
        .with_context(|| format!("Failed to read patch '{}'", args.patch.display()))?;
    patch::apply_patch_to_file(&args.file, &patch_text)
        .with_context(|| format!("Failed to patch '{}'", args.file.display()))?;
    eprintln!("Patched {}", args.file.display());
    Ok(())
}

fn cmd_config(args: ConfigArgs, config: &Config) -> Result<()> {
    if args.init {
        let path = config.save().map_err(|e| anyhow!(e))?;
        eprintln!("Saved config to {}", path.display());
    } else {
        eprintln!("# {}", Config::config_location());
    }
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
