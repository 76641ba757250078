//! # Sandpool CLI
//!
//! Operator front end for `sandpool_core`: run code or a test command in a pooled sandbox,
//! check candidate inputs against the security validator, and inspect configuration.
//!
//! ```bash
//! sandpool run --code 'print(1+1)'
//! sandpool run --language bash script.sh --timeout-secs 5
//! sandpool test 'pytest -q tests' --include tests/test_math.py --include math_utils.py
//! sandpool validate path ../../etc/passwd --root /srv/workspace
//! sandpool --config sandpool.toml config check
//! ```

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use sandpool_core::{
    ExecutionRequest, ExecutionResult, Executor, Language, SandboxConstraints, SandpoolConfig,
    config::RuntimeBackend,
    error::format_error_message,
    report::TestSummary,
    security::{self, ValidationOutcome},
};
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run untrusted code in pooled, isolated sandboxes",
    long_about = "Validate and run code or test suites inside resource-bounded sandboxes. Configuration comes from a TOML file (--config) with selected values overridable by flags."
)]
struct Cli {
    /// Path to a sandpool TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Runtime backend, overriding the configuration
    #[arg(long, value_enum, global = true)]
    backend: Option<BackendArg>,

    /// Workspace root, overriding the configuration
    #[arg(long, global = true)]
    workspace_root: Option<PathBuf>,

    /// Maximum number of live sandboxes, overriding the configuration
    #[arg(long, global = true)]
    max_size: Option<usize>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Log to the rolling log file instead of stderr
    #[arg(long, global = true)]
    log_to_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Local,
    Docker,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LanguageArg {
    Python,
    Bash,
    Node,
}

impl From<LanguageArg> for Language {
    fn from(value: LanguageArg) -> Self {
        match value {
            LanguageArg::Python => Language::Python,
            LanguageArg::Bash => Language::Bash,
            LanguageArg::Node => Language::Node,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ValidationKind {
    Path,
    Command,
    Filename,
    Input,
}

#[derive(Debug, clap::Args)]
struct SandboxArgs {
    /// Timeout in seconds (defaults to executor.default_timeout_ms)
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Image to run in, overriding runtime.defaults.image
    #[arg(long)]
    image: Option<String>,

    /// Memory ceiling in MiB
    #[arg(long)]
    memory_mb: Option<u64>,

    /// CPU ceiling in cores
    #[arg(long)]
    cpus: Option<f64>,

    /// Local file copied into the workspace under the same relative path (repeatable)
    #[arg(long = "include")]
    includes: Vec<PathBuf>,

    /// Discard the sandbox afterwards because the run installs packages
    #[arg(long)]
    installs_dependencies: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a code payload
    Run {
        /// Source file to run (read locally, written into the sandbox)
        #[arg(conflicts_with = "code", required_unless_present = "code")]
        source: Option<PathBuf>,

        /// Inline code to run instead of a source file
        #[arg(long)]
        code: Option<String>,

        #[arg(long, value_enum, default_value_t = LanguageArg::Python)]
        language: LanguageArg,

        /// Workspace-relative path the code is written to
        #[arg(long)]
        target: Option<String>,

        #[command(flatten)]
        sandbox: SandboxArgs,
    },
    /// Run a test command and summarize its report
    Test {
        /// Test command, e.g. "pytest -q tests"
        command: String,

        /// Workspace-relative working directory
        #[arg(long)]
        dir: Option<String>,

        #[command(flatten)]
        sandbox: SandboxArgs,
    },
    /// Check a candidate value against the security validator
    Validate {
        #[arg(value_enum)]
        kind: ValidationKind,

        value: String,

        /// Workspace root for path validation (relative-only check when omitted)
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Inspect the effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the effective configuration
    Check,
}

fn load_config(cli: &Cli) -> Result<SandpoolConfig> {
    let mut config = SandpoolConfig::load_or_default(cli.config.as_deref())?;
    if let Some(backend) = cli.backend {
        config.runtime.backend = match backend {
            BackendArg::Local => RuntimeBackend::Local,
            BackendArg::Docker => RuntimeBackend::Docker,
        };
    }
    if let Some(root) = &cli.workspace_root {
        config.workspace_root = root.clone();
    }
    if let Some(max_size) = cli.max_size {
        config.pool.max_size = max_size;
    }
    Ok(config)
}

async fn apply_sandbox_args(
    mut request: ExecutionRequest,
    args: &SandboxArgs,
    defaults: &SandboxConstraints,
) -> Result<ExecutionRequest> {
    if let Some(secs) = args.timeout_secs {
        request = request.with_timeout(Duration::from_secs(secs));
    }
    if args.image.is_some() || args.memory_mb.is_some() || args.cpus.is_some() {
        let mut constraints = defaults.clone();
        if let Some(image) = &args.image {
            constraints.image = image.clone();
        }
        if let Some(mb) = args.memory_mb {
            constraints.memory_limit_mb = Some(mb);
        }
        if let Some(cpus) = args.cpus {
            constraints.cpu_limit = Some(cpus);
        }
        request = request.with_constraints(constraints);
    }
    for include in &args.includes {
        let relative = include
            .to_str()
            .ok_or_else(|| anyhow!("Include path {} is not valid UTF-8", include.display()))?;
        let contents = tokio::fs::read_to_string(include)
            .await
            .with_context(|| format!("Failed to read included file {}", include.display()))?;
        request = request.with_file(relative, contents);
    }
    if args.installs_dependencies {
        request = request.installing_dependencies();
    }
    Ok(request)
}

fn print_summary(summary: &TestSummary) {
    println!(
        "{} tests: {} passed, {} failed, {} errors, {} skipped",
        summary.total, summary.passed, summary.failed, summary.errors, summary.skipped
    );
    for failure in &summary.failures {
        println!(
            "  FAILED {} ({}): {}",
            failure.node_id.as_deref().unwrap_or(&failure.test_name),
            failure.error_type.as_deref().unwrap_or("unknown error"),
            failure.message
        );
        if let Some(location) = &failure.location {
            println!("    at {}", location);
        }
    }
}

fn print_result(result: &ExecutionResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(result)?),
        OutputFormat::Text => {
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            if let Some(summary) = &result.test_summary {
                print_summary(summary);
            }
            if result.truncated {
                eprintln!("[output truncated]");
            }
            eprintln!(
                "[exit {} in {}ms on {}{}]",
                result.exit_code,
                result.duration.as_millis(),
                result.sandbox_id,
                if result.tainted { ", discarded" } else { "" }
            );
        }
    }
    Ok(())
}

fn print_outcome(outcome: &ValidationOutcome, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(outcome)?),
        OutputFormat::Text => match (outcome.value(), outcome.reason()) {
            (Some(value), _) if outcome.is_valid() => println!("valid: {}", value),
            (_, reason) => println!(
                "rejected ({:?}): {}",
                outcome.rule,
                reason.unwrap_or("no reason given")
            ),
        },
    }
    Ok(())
}

fn exit_code_of(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn execute(cli: &Cli, request: ExecutionRequest) -> Result<ExitCode> {
    let config = load_config(cli)?;
    let executor = Executor::from_config(&config).map_err(|e| anyhow!(format_error_message(&e)))?;
    executor.start_background_tasks();

    let outcome = executor.execute(request).await;
    debug!("Pool after execution: {:?}", executor.get_pool_stats());
    executor.shutdown().await;

    match outcome {
        Ok(result) => {
            print_result(&result, cli.format)?;
            Ok(exit_code_of(result.exit_code))
        }
        Err(err) => {
            match cli.format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&sandpool_core::error::to_record(&err))?
                ),
                OutputFormat::Text => eprintln!("{}", format_error_message(&err)),
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read source file {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "warn" };
    sandpool_core::logging::init_logging(log_level, cli.log_to_file)?;

    match &cli.command {
        Command::Run {
            source,
            code,
            language,
            target,
            sandbox,
        } => {
            let payload = match (code, source) {
                (Some(code), _) => code.clone(),
                (None, Some(path)) => read_source(path)?,
                (None, None) => bail!("Provide a source file or --code"),
            };
            let defaults = load_config(&cli)?.runtime.defaults;
            let mut request = ExecutionRequest::code(payload).with_language((*language).into());
            if let Some(target) = target {
                request = request.with_target_path(target.clone());
            }
            let request = apply_sandbox_args(request, sandbox, &defaults).await?;
            execute(&cli, request).await
        }
        Command::Test {
            command,
            dir,
            sandbox,
        } => {
            let defaults = load_config(&cli)?.runtime.defaults;
            let mut request = ExecutionRequest::test_run(command.clone());
            if let Some(dir) = dir {
                request = request.with_target_path(dir.clone());
            }
            let request = apply_sandbox_args(request, sandbox, &defaults).await?;
            execute(&cli, request).await
        }
        Command::Validate { kind, value, root } => {
            let outcome = match (kind, root) {
                (ValidationKind::Path, Some(root)) => security::validate_path(value, root),
                (ValidationKind::Path, None) => security::validate_relative_path(value),
                (ValidationKind::Command, _) => security::validate_command(value),
                (ValidationKind::Filename, _) => security::validate_filename(value),
                (ValidationKind::Input, _) => security::validate_user_input(value),
            };
            print_outcome(&outcome, cli.format)?;
            Ok(if outcome.is_valid() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Config { action } => {
            let config = load_config(&cli)?;
            match action {
                ConfigAction::Show => {
                    print!("{}", config.to_toml_string()?);
                    Ok(ExitCode::SUCCESS)
                }
                ConfigAction::Check => match config.validate() {
                    Ok(()) => {
                        println!("configuration is valid");
                        Ok(ExitCode::SUCCESS)
                    }
                    Err(err) => {
                        eprintln!("{}", format_error_message(&err));
                        Ok(ExitCode::FAILURE)
                    }
                },
            }
        }
    }
}
