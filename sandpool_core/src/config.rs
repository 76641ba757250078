//! # Configuration
//!
//! [`SandpoolConfig`] gathers every tunable of the subsystem. It is loaded from a TOML file
//! with [`SandpoolConfig::load_from_file`]; every section and field is optional and falls
//! back to its default, while unknown keys are rejected so typos surface immediately.
//!
//! ```toml
//! workspace_root = "/var/lib/sandpool"
//!
//! [pool]
//! max_size = 8
//! acquire_timeout_ms = 30000
//!
//! [executor]
//! default_timeout_ms = 30000
//! max_output_bytes = 1048576
//!
//! [retry]
//! max_retries = 3
//!
//! [runtime]
//! backend = "docker"
//!
//! [runtime.docker]
//! network = "none"
//!
//! [runtime.defaults]
//! image = "python:3.12-slim"
//! memory_limit_mb = 512
//! ```
//!
//! Loading only checks the syntax. [`SandpoolConfig::validate`] checks the values and
//! reports problems as `Configuration` errors with a remediation hint.

use crate::error::{Result, TypedError};
use crate::executor::ExecutorConfig;
use crate::pool::PoolConfig;
use crate::retry::RetryConfig;
use crate::runtime::{
    ContainerRuntime, DockerCliRuntime, DockerSettings, LocalProcessRuntime, SandboxConstraints,
};
use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// Which [`ContainerRuntime`] implementation backs the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeBackend {
    /// Host subprocesses in per-sandbox directories. For development and tests.
    #[default]
    Local,
    /// One container per sandbox through the docker CLI.
    Docker,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub backend: RuntimeBackend,
    pub docker: DockerSettings,
    /// Constraints used when a request does not name its own.
    pub defaults: SandboxConstraints,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandpoolConfig {
    /// Host directory under which every sandbox workspace is created.
    pub workspace_root: PathBuf,
    pub pool: PoolConfig,
    pub executor: ExecutorConfig,
    pub retry: RetryConfig,
    pub runtime: RuntimeConfig,
}

impl Default for SandpoolConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            pool: PoolConfig::default(),
            executor: ExecutorConfig::default(),
            retry: RetryConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

/// Per-user data directory, or `<tmp>/sandpool` where there is none.
pub fn default_workspace_root() -> PathBuf {
    ProjectDirs::from("dev", "sandpool", "sandpool")
        .map(|dirs| dirs.data_local_dir().join("workspaces"))
        .unwrap_or_else(|| std::env::temp_dir().join("sandpool"))
}

fn reject_zero(setting: &str, value: Duration, hint: &str) -> Result<()> {
    if value.is_zero() {
        return Err(TypedError::configuration(setting, format!("{setting} must be greater than zero"))
            .with_hint(hint));
    }
    Ok(())
}

impl SandpoolConfig {
    /// Read and parse a TOML configuration file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Load `path` if given, otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).context("Invalid sandpool configuration")
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Check value ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_size == 0 {
            return Err(TypedError::configuration("pool.max_size", "pool.max_size must be at least 1")
                .with_hint("Set pool.max_size to the number of sandboxes that may run at once."));
        }
        if self.pool.create_attempts == 0 {
            return Err(TypedError::configuration(
                "pool.create_attempts",
                "pool.create_attempts must be at least 1",
            )
            .with_hint("Use 1 to disable creation retries."));
        }
        reject_zero(
            "pool.acquire_timeout",
            self.pool.acquire_timeout,
            "Set pool.acquire_timeout_ms to how long callers may wait for a free sandbox.",
        )?;
        reject_zero(
            "pool.health_check_timeout",
            self.pool.health_check_timeout,
            "Set pool.health_check_timeout_ms; a few seconds is typical.",
        )?;
        reject_zero(
            "pool.idle_timeout",
            self.pool.idle_timeout,
            "Set pool.idle_timeout_ms to how long an unused sandbox may stay warm.",
        )?;
        reject_zero(
            "pool.cleanup_interval",
            self.pool.cleanup_interval,
            "Set pool.cleanup_interval_ms to how often idle sandboxes are swept.",
        )?;

        reject_zero(
            "executor.default_timeout",
            self.executor.default_timeout,
            "Set executor.default_timeout_ms to the timeout applied when a request has none.",
        )?;
        reject_zero(
            "executor.max_timeout",
            self.executor.max_timeout,
            "Set executor.max_timeout_ms to the longest timeout a request may ask for.",
        )?;
        if self.executor.default_timeout > self.executor.max_timeout {
            return Err(TypedError::configuration(
                "executor.default_timeout",
                format!(
                    "executor.default_timeout ({}ms) exceeds executor.max_timeout ({}ms)",
                    self.executor.default_timeout.as_millis(),
                    self.executor.max_timeout.as_millis()
                ),
            )
            .with_hint("Lower executor.default_timeout_ms or raise executor.max_timeout_ms."));
        }
        if self.executor.max_output_bytes == 0 {
            return Err(TypedError::configuration(
                "executor.max_output_bytes",
                "executor.max_output_bytes must be greater than zero",
            )
            .with_hint("Output beyond the cap is truncated, so a generous cap such as 1048576 is safe."));
        }
        if self.executor.max_payload_bytes == 0 {
            return Err(TypedError::configuration(
                "executor.max_payload_bytes",
                "executor.max_payload_bytes must be greater than zero",
            )
            .with_hint("Set executor.max_payload_bytes to the largest code payload accepted."));
        }

        if self.retry.initial_delay > self.retry.max_delay {
            return Err(TypedError::configuration(
                "retry.initial_delay",
                "retry.initial_delay exceeds retry.max_delay",
            )
            .with_hint("Lower retry.initial_delay_ms or raise retry.max_delay_ms."));
        }
        if self.retry.backoff_factor.is_nan() || self.retry.backoff_factor < 1.0 {
            return Err(TypedError::configuration(
                "retry.backoff_factor",
                format!("retry.backoff_factor must be at least 1.0, got {}", self.retry.backoff_factor),
            ));
        }

        let defaults = &self.runtime.defaults;
        if defaults.image.trim().is_empty() {
            return Err(TypedError::configuration("runtime.defaults.image", "default image is empty")
                .with_hint("Set runtime.defaults.image, e.g. \"python:3.12-slim\"."));
        }
        if defaults.cpu_limit.is_some_and(|cpus| cpus.is_nan() || cpus <= 0.0) {
            return Err(TypedError::configuration(
                "runtime.defaults.cpu_limit",
                "runtime.defaults.cpu_limit must be positive",
            ));
        }
        if defaults.memory_limit_mb == Some(0) {
            return Err(TypedError::configuration(
                "runtime.defaults.memory_limit_mb",
                "runtime.defaults.memory_limit_mb must be positive",
            ));
        }
        if self.runtime.backend == RuntimeBackend::Docker && self.runtime.docker.binary.trim().is_empty() {
            return Err(TypedError::configuration("runtime.docker.binary", "docker binary is empty")
                .with_hint("Set runtime.docker.binary to \"docker\" or \"podman\"."));
        }

        self.validate_workspace_root()
    }

    fn validate_workspace_root(&self) -> Result<()> {
        let root = &self.workspace_root;
        if !root.is_absolute() {
            return Err(TypedError::configuration(
                "workspace_root",
                format!("workspace_root must be absolute, got {}", root.display()),
            )
            .with_hint("Use an absolute path for workspace_root."));
        }
        if root.exists() {
            if !root.is_dir() {
                return Err(TypedError::configuration(
                    "workspace_root",
                    format!("{} is not a directory", root.display()),
                ));
            }
            return Ok(());
        }
        match root.parent() {
            Some(parent) if parent.is_dir() => Ok(()),
            _ => Err(TypedError::configuration(
                "workspace_root",
                format!("parent directory of {} does not exist", root.display()),
            )
            .with_hint("Create the parent directory or point workspace_root somewhere that exists.")),
        }
    }

    /// Instantiate the configured runtime backend.
    pub fn build_runtime(&self) -> Arc<dyn ContainerRuntime> {
        match self.runtime.backend {
            RuntimeBackend::Local => Arc::new(LocalProcessRuntime::new(&self.workspace_root)),
            RuntimeBackend::Docker => Arc::new(DockerCliRuntime::new(
                self.runtime.docker.clone(),
                &self.workspace_root,
            )),
        }
    }
}
