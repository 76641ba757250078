//! Container runtime boundary.
//!
//! The pool and executor never spawn processes themselves; they go through a
//! [`ContainerRuntime`]. Two backends ship with the crate:
//!
//! - [`LocalProcessRuntime`]: a private directory per sandbox, commands run as host
//!   subprocesses. No isolation beyond the directory; for development and tests.
//! - [`DockerCliRuntime`]: one long-lived `docker run -d` container per sandbox.
//!
//! Backends report failures as [`RuntimeError`]; callers turn them into typed errors with
//! [`RuntimeError::into_typed`].

mod docker;
mod local;

pub use docker::{DockerCliRuntime, DockerSettings};
pub use local::LocalProcessRuntime;

use crate::error::{SandboxOperation, TypedError};
use crate::retry::is_permanent_runtime_failure;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

/// Image and resource ceilings a sandbox is created with.
///
/// Two sandboxes are interchangeable when their constraints are equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConstraints {
    pub image: String,
    /// CPU ceiling in cores.
    pub cpu_limit: Option<f64>,
    /// Memory ceiling in MiB.
    pub memory_limit_mb: Option<u64>,
}

impl Default for SandboxConstraints {
    fn default() -> Self {
        Self {
            image: "python:3.12-slim".to_string(),
            cpu_limit: Some(1.0),
            memory_limit_mb: Some(512),
        }
    }
}

impl SandboxConstraints {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            cpu_limit: None,
            memory_limit_mb: None,
        }
    }

    pub fn with_cpu_limit(mut self, cores: f64) -> Self {
        self.cpu_limit = Some(cores);
        self
    }

    pub fn with_memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = Some(mb);
        self
    }

    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.memory_limit_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }
}

/// One command to run inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    /// Working directory relative to the sandbox workspace.
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Bytes kept per stream; the rest is read and discarded.
    pub output_limit: Option<usize>,
}

impl ExecRequest {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            working_dir: PathBuf::from("."),
            env: Vec::new(),
            output_limit: None,
        }
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit = Some(bytes);
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Raw result of a command that ran to completion (or was killed by a signal).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// A stream went past the request's output limit and was cut.
    pub truncated: bool,
}

impl ExecOutput {
    /// Exit code as the shell would report it (`128 + signal` for signalled processes).
    pub fn effective_exit_code(&self) -> i32 {
        match (self.exit_code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => -1,
        }
    }

    /// Killed by a signal or reported a crash-range exit code.
    pub fn crashed(&self) -> bool {
        self.signal.is_some() || self.effective_exit_code() >= 128 || self.effective_exit_code() < 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Memory in use when sampled.
    pub memory_bytes: u64,
    pub cpu_percent: f64,
    /// High-water mark since the sandbox started, when the backend can read it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_memory_bytes: Option<u64>,
}

impl ResourceUsage {
    /// Best available figure for "how much memory did the workload need".
    pub fn high_water_bytes(&self) -> u64 {
        self.peak_memory_bytes
            .map_or(self.memory_bytes, |peak| peak.max(self.memory_bytes))
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("{operation} failed{}: {stderr}", .status.map(|s| format!(" (exit {s})")).unwrap_or_default())]
    Command {
        operation: &'static str,
        status: Option<i32>,
        stderr: String,
    },

    #[error("unknown sandbox '{0}'")]
    UnknownSandbox(String),

    #[error("sandbox '{0}' is unhealthy: {1}")]
    Unhealthy(String, String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Map into the public taxonomy.
    ///
    /// Failures retrying cannot fix (missing runtime, missing image, denied access) become
    /// `Configuration` errors; everything else is a retryable `Sandbox` error.
    pub fn into_typed(self, operation: SandboxOperation, sandbox_id: Option<&str>) -> TypedError {
        let message = self.to_string();
        let permanent =
            matches!(self, RuntimeError::Unavailable(_)) || is_permanent_runtime_failure(&message);

        if permanent {
            TypedError::configuration("runtime", message)
                .with_hint("Check that the container runtime is installed, running and allowed to start the configured image.")
        } else {
            TypedError::sandbox(operation, sandbox_id.map(str::to_string), message)
        }
    }
}

/// Backend that creates, runs and tears down sandboxes.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short backend name for logs (`"local"`, `"docker"`).
    fn name(&self) -> &'static str;

    /// Create sandbox `sandbox_id`; returns the host-side workspace directory.
    async fn create(
        &self,
        sandbox_id: &str,
        constraints: &SandboxConstraints,
    ) -> Result<PathBuf, RuntimeError>;

    async fn exec(&self, sandbox_id: &str, request: &ExecRequest)
    -> Result<ExecOutput, RuntimeError>;

    /// Terminate anything still running inside the sandbox.
    async fn stop(&self, sandbox_id: &str) -> Result<(), RuntimeError>;

    async fn destroy(&self, sandbox_id: &str) -> Result<(), RuntimeError>;

    async fn usage(&self, sandbox_id: &str) -> Result<ResourceUsage, RuntimeError>;

    async fn health_check(&self, sandbox_id: &str) -> Result<(), RuntimeError>;

    /// Empty the workspace so the next lease starts clean.
    async fn reset_workspace(&self, _sandbox_id: &str, workspace: &Path) -> Result<(), RuntimeError> {
        clear_directory(workspace).await
    }
}

const READ_CHUNK: usize = 8 * 1024;

/// Read `reader` to EOF, keeping at most `cap` bytes.
///
/// The stream is drained past the cap so the writer never blocks on a full pipe.
pub(crate) async fn read_capped<R>(mut reader: R, cap: Option<usize>) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let cap = cap.unwrap_or(usize::MAX);
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(kept.len());
        if n > room {
            truncated = true;
        }
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }
    Ok((kept, truncated))
}

/// Exit status and bounded output of a finished child.
#[derive(Debug)]
pub(crate) struct CapturedOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub truncated: bool,
}

/// Spawn `command` with piped output and wait for it, keeping at most `cap` bytes per
/// stream.
pub(crate) async fn capture_output(
    command: &mut Command,
    cap: Option<usize>,
) -> std::io::Result<CapturedOutput> {
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    let child = command.spawn()?;
    wait_capped(child, cap).await
}

pub(crate) async fn wait_capped(mut child: Child, cap: Option<usize>) -> std::io::Result<CapturedOutput> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let read_stdout = async {
        match stdout {
            Some(pipe) => read_capped(pipe, cap).await,
            None => Ok((Vec::new(), false)),
        }
    };
    let read_stderr = async {
        match stderr {
            Some(pipe) => read_capped(pipe, cap).await,
            None => Ok((Vec::new(), false)),
        }
    };

    let ((stdout, out_cut), (stderr, err_cut), status) =
        tokio::try_join!(read_stdout, read_stderr, child.wait())?;

    Ok(CapturedOutput {
        status,
        stdout,
        stderr,
        truncated: out_cut || err_cut,
    })
}

/// Remove every entry under `dir`, keeping `dir` itself.
pub(crate) async fn clear_directory(dir: &Path) -> Result<(), RuntimeError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}
