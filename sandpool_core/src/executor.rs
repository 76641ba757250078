//! # Execution Orchestrator
//!
//! [`Executor::execute`] is the single entry point that turns an [`ExecutionRequest`] into an
//! [`ExecutionResult`] or a [`TypedError`]. Every execution gets a UUID and walks through
//! the phases of [`ExecutionPhase`], each logged inside an `execution` span:
//!
//! ```text
//! Validating -> Acquiring -> Running -> Capturing -> Releasing -> Done
//!      \            \           \           \            \
//!       +------------+-----------+-----------+------------+--> Failed
//! ```
//!
//! ## Guarantees
//!
//! - Validation runs before the pool is touched. A rejected request never acquires,
//!   creates or execs anything.
//! - The process runs under a hard wall-clock timeout. On expiry the sandbox is stopped and
//!   discarded, and the call fails with an `Execution` error whose reason is `timeout`.
//! - stdout and stderr are each capped at `max_output_bytes`; overflow sets `truncated`.
//! - The sandbox is always handed back: released clean or tainted on every return path,
//!   and destroyed in the background by the lease's `Drop` if the caller is cancelled.
//! - `Sandbox` errors (creation or runtime communication) are retried with a fresh sandbox
//!   per [`RetryConfig`]; `Execution` errors surface on the first occurrence. An acquire
//!   timeout is surfaced at once, so a caller never waits longer than `acquire_timeout`
//!   for a sandbox.
//!
//! ## Taint policy
//!
//! A sandbox is released tainted (destroyed, never reused) when:
//!
//! 1. the execution timed out;
//! 2. the process was killed by a signal or exited with a code of 128 or more;
//! 3. the request sets `installs_dependencies`, or the test command invokes a package
//!    installer (`pip install`, `npm install`, `apt-get install`, ...);
//! 4. the sandbox's memory high-water mark reached its ceiling (the cgroup peak when the
//!    backend exposes one, otherwise usage sampled after the run);
//! 5. talking to the runtime failed (exec error, workspace I/O error).
//!
//! Any other outcome, including a non-zero exit or failing tests, releases the sandbox
//! clean; the pool health-checks it and empties its workspace before reuse.

use crate::config::SandpoolConfig;
use crate::error::{ErrorKind, ExecutionFailure, Result, SandboxOperation, TypedError, log_error};
use crate::metrics::{MetricsRegistry, MetricsSnapshot, PoolMetrics};
use crate::pool::{SandboxLease, SandboxPool};
use crate::report::{TestSummary, parse_test_report};
use crate::retry::{RetryConfig, execute_with_retry_when, should_retry};
use crate::runtime::{ExecRequest, SandboxConstraints};
use crate::security::{validate_command, validate_path, validate_relative_path};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::time::{Instant, timeout};
use tracing::Instrument;
use uuid::Uuid;

const PACKAGE_INSTALLERS: &[&str] = &[
    "pip", "pip3", "npm", "yarn", "pnpm", "apt", "apt-get", "apk", "yum", "dnf", "conda",
    "poetry", "uv", "gem",
];
const INSTALL_VERBS: &[&str] = &["install", "add", "i", "sync"];
const SHELLS: &[&str] = &["sh", "bash", "dash", "zsh"];

/// How the payload of a request is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// The payload is source code written to the target path and run by an interpreter.
    #[default]
    ArbitraryCode,
    /// The payload is a test command; its report is parsed into a [`TestSummary`].
    TestRun,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
    Bash,
    Node,
}

impl Language {
    pub fn interpreter(&self) -> &'static str {
        match self {
            Language::Python => "python3",
            Language::Bash => "bash",
            Language::Node => "node",
        }
    }

    /// File the payload is written to when the request names none.
    pub fn default_target(&self) -> &'static str {
        match self {
            Language::Python => "main.py",
            Language::Bash => "main.sh",
            Language::Node => "main.js",
        }
    }
}

/// An extra file placed in the workspace before the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceFile {
    /// Workspace-relative path.
    pub path: String,
    pub contents: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    /// Source code, or the test command in [`ExecutionMode::TestRun`].
    pub payload: String,
    /// Workspace-relative file the code is written to, or the working directory of a
    /// test run.
    pub target_path: Option<String>,
    /// Falls back to the executor's default timeout.
    pub timeout: Option<Duration>,
    /// Falls back to the executor's default constraints.
    pub constraints: Option<SandboxConstraints>,
    pub mode: ExecutionMode,
    pub language: Language,
    pub files: Vec<WorkspaceFile>,
    /// The run installs packages; the sandbox is discarded afterwards.
    pub installs_dependencies: bool,
}

impl ExecutionRequest {
    /// Run `code` with the default (Python) interpreter.
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            payload: code.into(),
            target_path: None,
            timeout: None,
            constraints: None,
            mode: ExecutionMode::ArbitraryCode,
            language: Language::default(),
            files: Vec::new(),
            installs_dependencies: false,
        }
    }

    /// Run a test command such as `pytest -q tests`.
    pub fn test_run(command: impl Into<String>) -> Self {
        Self {
            mode: ExecutionMode::TestRun,
            ..Self::code(command)
        }
    }

    pub fn with_language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    pub fn with_target_path(mut self, path: impl Into<String>) -> Self {
        self.target_path = Some(path.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_constraints(mut self, constraints: SandboxConstraints) -> Self {
        self.constraints = Some(constraints);
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.push(WorkspaceFile {
            path: path.into(),
            contents: contents.into(),
        });
        self
    }

    pub fn installing_dependencies(mut self) -> Self {
        self.installs_dependencies = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock time of the sandboxed process.
    #[serde(rename = "duration_ms", with = "crate::retry::millis")]
    pub duration: Duration,
    /// stdout or stderr was cut at `max_output_bytes`.
    pub truncated: bool,
    pub sandbox_id: String,
    /// The sandbox came from the idle set.
    pub reused: bool,
    /// The sandbox was discarded instead of returned to the pool.
    pub tainted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_summary: Option<TestSummary>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Timeout applied when a request declares none.
    #[serde(rename = "default_timeout_ms", with = "crate::retry::millis")]
    pub default_timeout: Duration,
    /// Longest timeout a request may declare.
    #[serde(rename = "max_timeout_ms", with = "crate::retry::millis")]
    pub max_timeout: Duration,
    /// Cap per captured stream.
    pub max_output_bytes: usize,
    /// Cap on payload plus extra file contents.
    pub max_payload_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(300),
            max_output_bytes: 1024 * 1024,
            max_payload_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    Validating,
    Acquiring,
    Running,
    Capturing,
    Releasing,
    Done,
    Failed,
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionPhase::Validating => "validating",
            ExecutionPhase::Acquiring => "acquiring",
            ExecutionPhase::Running => "running",
            ExecutionPhase::Capturing => "capturing",
            ExecutionPhase::Releasing => "releasing",
            ExecutionPhase::Done => "done",
            ExecutionPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

fn enter(phase: ExecutionPhase) {
    tracing::debug!(%phase, "execution phase");
}

/// A request after validation: everything the sandbox needs, already normalized.
#[derive(Debug)]
struct ExecutionPlan {
    mode: ExecutionMode,
    argv: Vec<String>,
    working_dir: String,
    /// Files to write (workspace-relative path, contents), payload last.
    files: Vec<(String, String)>,
    timeout: Duration,
    constraints: SandboxConstraints,
    taints_workspace: bool,
}

/// What one attempt produced, and whether its sandbox may be reused.
struct AttemptOutcome {
    tainted: bool,
    result: Result<ExecutionResult>,
}

impl AttemptOutcome {
    fn tainted(error: TypedError) -> Self {
        Self {
            tainted: true,
            result: Err(error),
        }
    }
}

/// Whether `argv` runs a package installer, directly or through `sh -c`.
pub fn invokes_package_installer(argv: &[String]) -> bool {
    let program_name = |arg: &str| {
        Path::new(arg)
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
    };

    let direct = argv.windows(2).any(|pair| {
        program_name(&pair[0]).is_some_and(|name| PACKAGE_INSTALLERS.contains(&name.as_str()))
            && INSTALL_VERBS.contains(&pair[1].as_str())
    });
    if direct {
        return true;
    }

    match argv {
        [shell, flag, script, ..]
            if flag == "-c"
                && program_name(shell).is_some_and(|name| SHELLS.contains(&name.as_str())) =>
        {
            shell_words::split(script).is_ok_and(|inner| invokes_package_installer(&inner))
        }
        _ => false,
    }
}

/// Decode and cap captured output at a char boundary at or below `cap` bytes.
fn truncate_output(bytes: &[u8], cap: usize) -> (String, bool) {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= cap {
        return (text.into_owned(), false);
    }
    let mut end = cap;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (text[..end].to_string(), true)
}

fn valid_image_name(image: &str) -> bool {
    !image.is_empty()
        && !image.starts_with('-')
        && image
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '/' | '_' | '-' | '@'))
}

/// Runs requests in pooled sandboxes.
#[derive(Debug, Clone)]
pub struct Executor {
    pool: Arc<SandboxPool>,
    config: ExecutorConfig,
    retry: RetryConfig,
    default_constraints: SandboxConstraints,
}

impl Executor {
    pub fn new(pool: Arc<SandboxPool>, config: ExecutorConfig, retry: RetryConfig) -> Self {
        Self {
            pool,
            config,
            retry,
            default_constraints: SandboxConstraints::default(),
        }
    }

    /// Validate `config` and build the runtime, pool and executor it describes.
    pub fn from_config(config: &SandpoolConfig) -> Result<Self> {
        config.validate()?;
        let runtime = config.build_runtime();
        let pool = SandboxPool::new(
            runtime,
            config.pool.clone(),
            config.retry.clone(),
            Arc::new(MetricsRegistry::new()),
        );
        Ok(Self::new(Arc::new(pool), config.executor.clone(), config.retry.clone())
            .with_default_constraints(config.runtime.defaults.clone()))
    }

    pub fn with_default_constraints(mut self, constraints: SandboxConstraints) -> Self {
        self.default_constraints = constraints;
        self
    }

    pub fn pool(&self) -> &Arc<SandboxPool> {
        &self.pool
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Start the pool's idle sweeper.
    pub fn start_background_tasks(&self) {
        Arc::clone(&self.pool).start_background_tasks();
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    /// Validate, run and report one request.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let execution_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("execution", id = %execution_id);
        self.execute_traced(execution_id, request)
            .instrument(span)
            .await
    }

    async fn execute_traced(
        &self,
        execution_id: String,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        enter(ExecutionPhase::Validating);

        let outcome = match self.plan(&request) {
            Ok(plan) => {
                let id = execution_id.as_str();
                let plan = &plan;
                // Acquire timeouts are final: the pool already bounded the wait.
                let retryable = |err: &TypedError| should_retry(err) && !err.is_acquire_timeout();
                execute_with_retry_when(&self.retry, "execution", retryable, move || {
                    self.attempt(id, plan)
                })
                .await
            }
            Err(err) => Err(err),
        };

        let elapsed = started.elapsed();
        let failure = outcome.as_ref().err();
        self.pool.metrics().record_execution(
            elapsed,
            failure.map(TypedError::kind),
            failure.is_some_and(TypedError::is_timeout),
        );

        match &outcome {
            Ok(result) => {
                enter(ExecutionPhase::Done);
                tracing::info!(
                    target: "sandpool::audit",
                    execution_id = %execution_id,
                    sandbox_id = %result.sandbox_id,
                    mode = ?request.mode,
                    exit_code = result.exit_code,
                    duration_ms = (result.duration.as_millis() as u64),
                    truncated = result.truncated,
                    tainted = result.tainted,
                    "execution completed"
                );
            }
            Err(err) => {
                enter(ExecutionPhase::Failed);
                log_error(err);
            }
        }
        outcome
    }

    /// Check every field of `request` and resolve defaults.
    fn plan(&self, request: &ExecutionRequest) -> Result<ExecutionPlan> {
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        if timeout.is_zero() || timeout > self.config.max_timeout {
            return Err(TypedError::input_validation(
                "timeout",
                format!(
                    "timeout must be between 1ms and {}ms, got {}ms",
                    self.config.max_timeout.as_millis(),
                    timeout.as_millis()
                ),
            )
            .with_hint("Choose a timeout within the executor's limit."));
        }

        let payload_bytes =
            request.payload.len() + request.files.iter().map(|f| f.contents.len()).sum::<usize>();
        if payload_bytes > self.config.max_payload_bytes {
            return Err(TypedError::input_validation(
                "payload",
                format!(
                    "payload is {} bytes, limit is {} bytes",
                    payload_bytes, self.config.max_payload_bytes
                ),
            )
            .with_hint("Reduce the payload size or split the work into several runs."));
        }
        if request.payload.trim().is_empty() {
            return Err(TypedError::input_validation("payload", "payload is empty"));
        }

        let constraints = request
            .constraints
            .clone()
            .unwrap_or_else(|| self.default_constraints.clone());
        if !valid_image_name(&constraints.image) {
            return Err(TypedError::input_validation(
                "constraints.image",
                format!("'{}' is not a valid image reference", constraints.image),
            ));
        }

        let mut files = Vec::with_capacity(request.files.len() + 1);
        for (index, file) in request.files.iter().enumerate() {
            let field = format!("files[{index}].path");
            let path = validate_relative_path(&file.path).into_result(&field)?;
            if path == "." {
                return Err(TypedError::input_validation(field, "path must name a file"));
            }
            files.push((path, file.contents.clone()));
        }

        let (argv, working_dir, taints_workspace) = match request.mode {
            ExecutionMode::ArbitraryCode => {
                let target = request
                    .target_path
                    .as_deref()
                    .unwrap_or(request.language.default_target());
                let target = validate_relative_path(target).into_result("target_path")?;
                if target == "." {
                    return Err(TypedError::input_validation(
                        "target_path",
                        "path must name a file",
                    ));
                }
                files.push((target.clone(), request.payload.clone()));
                let argv = vec![request.language.interpreter().to_string(), target];
                (argv, ".".to_string(), request.installs_dependencies)
            }
            ExecutionMode::TestRun => {
                let working_dir = match request.target_path.as_deref() {
                    Some(dir) => validate_relative_path(dir).into_result("target_path")?,
                    None => ".".to_string(),
                };
                let command = validate_command(&request.payload).into_result("command")?;
                let argv = shell_words::split(&command)
                    .map_err(|e| TypedError::input_validation("command", e.to_string()))?;
                let installs = request.installs_dependencies || invokes_package_installer(&argv);
                (argv, working_dir, installs)
            }
        };

        Ok(ExecutionPlan {
            mode: request.mode,
            argv,
            working_dir,
            files,
            timeout,
            constraints,
            taints_workspace,
        })
    }

    /// One acquire/run/release cycle.
    async fn attempt(&self, execution_id: &str, plan: &ExecutionPlan) -> Result<ExecutionResult> {
        enter(ExecutionPhase::Acquiring);
        let lease = self.pool.acquire(&plan.constraints).await?;
        tracing::info!(
            target: "sandpool::audit",
            execution_id = %execution_id,
            sandbox_id = %lease.id(),
            reused = lease.reused(),
            "execution attempt"
        );

        let outcome = self.run_in_sandbox(execution_id, &lease, plan).await;

        enter(ExecutionPhase::Releasing);
        if outcome.tainted {
            tracing::debug!("Releasing sandbox {} as tainted", lease.id());
        }
        self.pool.release(lease, outcome.tainted).await;
        outcome.result
    }

    async fn write_files(&self, lease: &SandboxLease, plan: &ExecutionPlan) -> Result<()> {
        let workspace = lease.workspace();
        for (relative, contents) in &plan.files {
            // Re-check against the real workspace: a symlink could redirect the write.
            let path = PathBuf::from(validate_path(relative, workspace).into_result("files.path")?);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| workspace_error(lease, &path, e))?;
            }
            tokio::fs::write(&path, contents)
                .await
                .map_err(|e| workspace_error(lease, &path, e))?;
        }

        let working_dir =
            PathBuf::from(validate_path(&plan.working_dir, workspace).into_result("target_path")?);
        tokio::fs::create_dir_all(&working_dir)
            .await
            .map_err(|e| workspace_error(lease, &working_dir, e))
    }

    async fn run_in_sandbox(
        &self,
        execution_id: &str,
        lease: &SandboxLease,
        plan: &ExecutionPlan,
    ) -> AttemptOutcome {
        enter(ExecutionPhase::Running);
        if let Err(err) = self.write_files(lease, plan).await {
            let tainted = err.kind() == ErrorKind::Sandbox;
            return AttemptOutcome {
                tainted,
                result: Err(err),
            };
        }

        let runtime = self.pool.runtime();
        let request = ExecRequest::new(plan.argv.clone())
            .in_dir(&plan.working_dir)
            .with_env("PYTHONUNBUFFERED", "1")
            .with_env("PYTHONDONTWRITEBYTECODE", "1")
            .with_output_limit(self.config.max_output_bytes);

        let started = Instant::now();
        let output = match timeout(plan.timeout, runtime.exec(lease.id(), &request)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return AttemptOutcome::tainted(
                    e.into_typed(SandboxOperation::Exec, Some(lease.id())),
                );
            }
            Err(_) => {
                tracing::warn!(
                    "Execution {} exceeded {}ms in sandbox {}; stopping it",
                    execution_id,
                    plan.timeout.as_millis(),
                    lease.id()
                );
                let stop_limit = self.pool.config().health_check_timeout;
                match timeout(stop_limit, runtime.stop(lease.id())).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!("Failed to stop sandbox {}: {}", lease.id(), e),
                    Err(_) => tracing::warn!("Stopping sandbox {} timed out", lease.id()),
                }
                return AttemptOutcome::tainted(
                    TypedError::execution(
                        lease.id(),
                        ExecutionFailure::Timeout,
                        None,
                        "",
                        format!("execution exceeded its timeout of {}ms", plan.timeout.as_millis()),
                    )
                    .with_hint("Make the code finish sooner or request a longer timeout."),
                );
            }
        };
        let duration = started.elapsed();

        enter(ExecutionPhase::Capturing);
        let cap = self.config.max_output_bytes;
        let (stdout, stdout_truncated) = truncate_output(&output.stdout, cap);
        let (stderr, stderr_truncated) = truncate_output(&output.stderr, cap);
        let test_summary = match plan.mode {
            ExecutionMode::TestRun => {
                Some(parse_test_report(&String::from_utf8_lossy(&output.stdout)))
            }
            ExecutionMode::ArbitraryCode => None,
        };

        let over_memory = self.exceeded_memory(lease).await;
        let crashed = output.crashed();
        let tainted = crashed || plan.taints_workspace || over_memory;
        if tainted {
            tracing::debug!(
                "Sandbox {} tainted (crashed: {}, installs: {}, over memory: {})",
                lease.id(),
                crashed,
                plan.taints_workspace,
                over_memory
            );
        }

        let exit_code = output.effective_exit_code();
        if crashed {
            return AttemptOutcome {
                tainted,
                result: Err(TypedError::execution(
                    lease.id(),
                    ExecutionFailure::Crashed,
                    Some(exit_code),
                    stderr,
                    match output.signal {
                        Some(signal) => format!("process was killed by signal {signal}"),
                        None => format!("process crashed with exit code {exit_code}"),
                    },
                )
                .with_hint(
                    "The process was killed, often for exceeding its memory limit. \
                     Reduce memory use or raise the limit.",
                )),
            };
        }
        if plan.mode == ExecutionMode::ArbitraryCode && exit_code != 0 {
            return AttemptOutcome {
                tainted,
                result: Err(TypedError::execution(
                    lease.id(),
                    ExecutionFailure::NonZeroExit,
                    Some(exit_code),
                    stderr,
                    format!("process exited with code {exit_code}"),
                )
                .with_hint("Fix the error reported on stderr and run again.")),
            };
        }

        AttemptOutcome {
            tainted,
            result: Ok(ExecutionResult {
                execution_id: execution_id.to_string(),
                exit_code,
                stdout,
                stderr,
                duration,
                truncated: output.truncated || stdout_truncated || stderr_truncated,
                sandbox_id: lease.id().to_string(),
                reused: lease.reused(),
                tainted,
                test_summary,
            }),
        }
    }

    /// Whether the sandbox's memory high-water mark reached its ceiling.
    ///
    /// The kernel holds usage at the ceiling, so reaching it counts.
    async fn exceeded_memory(&self, lease: &SandboxLease) -> bool {
        let limit = self.pool.config().health_check_timeout;
        match timeout(limit, self.pool.runtime().usage(lease.id())).await {
            Ok(Ok(usage)) => {
                let high_water = usage.high_water_bytes();
                self.pool.metrics().record_memory_usage(high_water);
                lease
                    .constraints()
                    .memory_limit_bytes()
                    .is_some_and(|ceiling| high_water >= ceiling)
            }
            Ok(Err(e)) => {
                tracing::debug!("No resource usage for sandbox {}: {}", lease.id(), e);
                false
            }
            Err(_) => false,
        }
    }

    pub fn get_pool_stats(&self) -> PoolMetrics {
        self.pool.stats()
    }

    /// Destroy idle sandboxes and drain leased ones.
    pub async fn clear_pool(&self) -> usize {
        self.pool.clear().await
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.pool.metrics().snapshot()
    }

    /// Clear the pool, then zero every counter.
    pub async fn reset_metrics(&self) {
        self.pool.clear().await;
        self.pool
            .wait_for_pending_destroys(self.pool.config().health_check_timeout)
            .await;
        self.pool.metrics().reset();
        tracing::info!("Metrics reset");
    }
}

fn workspace_error(lease: &SandboxLease, path: &Path, error: std::io::Error) -> TypedError {
    TypedError::sandbox(
        SandboxOperation::WorkspaceIo,
        Some(lease.id().to_string()),
        format!("failed to write {}: {}", path.display(), error),
    )
}
