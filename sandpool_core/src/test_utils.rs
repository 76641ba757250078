//! Test helpers: a scriptable in-memory runtime and pool/executor builders.

use crate::executor::{Executor, ExecutorConfig};
use crate::metrics::MetricsRegistry;
use crate::pool::{PoolConfig, SandboxPool};
use crate::retry::RetryConfig;
use crate::runtime::{
    ContainerRuntime, ExecOutput, ExecRequest, ResourceUsage, RuntimeError, SandboxConstraints,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tempfile::TempDir;

type ExecHandler = dyn Fn(&ExecRequest) -> ExecOutput + Send + Sync;

#[derive(Default)]
struct FakeState {
    workspaces: HashMap<String, PathBuf>,
    unhealthy: HashSet<String>,
    created: Vec<String>,
    destroyed: Vec<String>,
    stopped: Vec<String>,
    exec_calls: Vec<(String, ExecRequest)>,
    peak_live: usize,
    transient_create_failures: u32,
    permanent_create_failure: bool,
    transient_exec_failures: u32,
}

/// In-memory [`ContainerRuntime`] with real workspace directories under a temp dir.
///
/// Exec results come from a handler (default: exit 0, empty output). Creation and
/// execution can be delayed or made to fail, and every call is recorded.
pub struct FakeRuntime {
    root: TempDir,
    state: Mutex<FakeState>,
    handler: Mutex<Arc<ExecHandler>>,
    create_delay: Mutex<Duration>,
    exec_delay: Mutex<Duration>,
    health_check_delay: Mutex<Duration>,
    destroy_delay: Mutex<Duration>,
    usage: Mutex<ResourceUsage>,
}

impl std::fmt::Debug for FakeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeRuntime")
            .field("root", &self.root.path())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Successful exec output with the given stdout.
pub fn exec_ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        exit_code: Some(0),
        signal: None,
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
        truncated: false,
    }
}

/// Exec output with an exit code and both streams.
pub fn exec_exit(code: i32, stdout: &str, stderr: &str) -> ExecOutput {
    ExecOutput {
        exit_code: Some(code),
        signal: None,
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
        truncated: false,
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        let handler: Arc<ExecHandler> = Arc::new(|_: &ExecRequest| exec_ok(""));
        Self {
            root: TempDir::new().expect("failed to create temp dir"),
            state: Mutex::new(FakeState::default()),
            handler: Mutex::new(handler),
            create_delay: Mutex::new(Duration::ZERO),
            exec_delay: Mutex::new(Duration::ZERO),
            health_check_delay: Mutex::new(Duration::ZERO),
            destroy_delay: Mutex::new(Duration::ZERO),
            usage: Mutex::new(ResourceUsage::default()),
        }
    }

    pub fn with_exec_handler(
        self,
        handler: impl Fn(&ExecRequest) -> ExecOutput + Send + Sync + 'static,
    ) -> Self {
        *lock(&self.handler) = Arc::new(handler);
        self
    }

    pub fn with_create_delay(self, delay: Duration) -> Self {
        *lock(&self.create_delay) = delay;
        self
    }

    pub fn with_exec_delay(self, delay: Duration) -> Self {
        *lock(&self.exec_delay) = delay;
        self
    }

    pub fn with_health_check_delay(self, delay: Duration) -> Self {
        *lock(&self.health_check_delay) = delay;
        self
    }

    pub fn with_destroy_delay(self, delay: Duration) -> Self {
        *lock(&self.destroy_delay) = delay;
        self
    }

    pub fn with_memory_usage(self, bytes: u64) -> Self {
        lock(&self.usage).memory_bytes = bytes;
        self
    }

    /// Report a cgroup-style high-water mark alongside the sampled usage.
    pub fn with_peak_memory(self, bytes: u64) -> Self {
        lock(&self.usage).peak_memory_bytes = Some(bytes);
        self
    }

    /// The next `count` creations fail with a retryable error.
    pub fn fail_next_creates(&self, count: u32) {
        lock(&self.state).transient_create_failures = count;
    }

    /// Every creation fails with a permanent (configuration) error.
    pub fn fail_all_creates(&self) {
        lock(&self.state).permanent_create_failure = true;
    }

    /// The next `count` exec calls fail with a retryable error.
    pub fn fail_next_execs(&self, count: u32) {
        lock(&self.state).transient_exec_failures = count;
    }

    pub fn mark_unhealthy(&self, sandbox_id: &str) {
        lock(&self.state).unhealthy.insert(sandbox_id.to_string());
    }

    pub fn created(&self) -> Vec<String> {
        lock(&self.state).created.clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        lock(&self.state).destroyed.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        lock(&self.state).stopped.clone()
    }

    pub fn exec_calls(&self) -> Vec<(String, ExecRequest)> {
        lock(&self.state).exec_calls.clone()
    }

    /// Sandboxes created and not yet destroyed.
    pub fn live(&self) -> usize {
        lock(&self.state).workspaces.len()
    }

    /// Highest number of simultaneously live sandboxes observed.
    pub fn peak_live(&self) -> usize {
        lock(&self.state).peak_live
    }

    pub fn workspace(&self, sandbox_id: &str) -> Option<PathBuf> {
        lock(&self.state).workspaces.get(sandbox_id).cloned()
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create(
        &self,
        sandbox_id: &str,
        _constraints: &SandboxConstraints,
    ) -> Result<PathBuf, RuntimeError> {
        let delay = *lock(&self.create_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        {
            let mut state = lock(&self.state);
            if state.permanent_create_failure {
                return Err(RuntimeError::Command {
                    operation: "create",
                    status: Some(125),
                    stderr: "No such image: missing:latest".to_string(),
                });
            }
            if state.transient_create_failures > 0 {
                state.transient_create_failures -= 1;
                return Err(RuntimeError::Command {
                    operation: "create",
                    status: Some(1),
                    stderr: "resource temporarily unavailable".to_string(),
                });
            }
        }

        let workspace = self.root.path().join(sandbox_id);
        std::fs::create_dir_all(&workspace)?;

        let mut state = lock(&self.state);
        state.workspaces.insert(sandbox_id.to_string(), workspace.clone());
        state.created.push(sandbox_id.to_string());
        state.peak_live = state.peak_live.max(state.workspaces.len());
        Ok(workspace)
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        request: &ExecRequest,
    ) -> Result<ExecOutput, RuntimeError> {
        {
            let mut state = lock(&self.state);
            if !state.workspaces.contains_key(sandbox_id) {
                return Err(RuntimeError::UnknownSandbox(sandbox_id.to_string()));
            }
            state
                .exec_calls
                .push((sandbox_id.to_string(), request.clone()));
            if state.transient_exec_failures > 0 {
                state.transient_exec_failures -= 1;
                return Err(RuntimeError::Command {
                    operation: "exec",
                    status: Some(1),
                    stderr: "connection reset by peer".to_string(),
                });
            }
        }

        let delay = *lock(&self.exec_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let handler = Arc::clone(&*lock(&self.handler));
        Ok(handler(request))
    }

    async fn stop(&self, sandbox_id: &str) -> Result<(), RuntimeError> {
        lock(&self.state).stopped.push(sandbox_id.to_string());
        Ok(())
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<(), RuntimeError> {
        let delay = *lock(&self.destroy_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let workspace = {
            let mut state = lock(&self.state);
            state.destroyed.push(sandbox_id.to_string());
            state.workspaces.remove(sandbox_id)
        };
        if let Some(workspace) = workspace {
            let _ = std::fs::remove_dir_all(workspace);
        }
        Ok(())
    }

    async fn usage(&self, _sandbox_id: &str) -> Result<ResourceUsage, RuntimeError> {
        Ok(*lock(&self.usage))
    }

    async fn health_check(&self, sandbox_id: &str) -> Result<(), RuntimeError> {
        let delay = *lock(&self.health_check_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let state = lock(&self.state);
        if !state.workspaces.contains_key(sandbox_id) {
            return Err(RuntimeError::UnknownSandbox(sandbox_id.to_string()));
        }
        if state.unhealthy.contains(sandbox_id) {
            return Err(RuntimeError::Unhealthy(
                sandbox_id.to_string(),
                "marked unhealthy".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pool settings with short timeouts for tests.
pub fn fast_pool_config(max_size: usize) -> PoolConfig {
    PoolConfig {
        max_size,
        acquire_timeout: Duration::from_secs(2),
        health_check_timeout: Duration::from_secs(1),
        idle_timeout: Duration::from_secs(60),
        cleanup_interval: Duration::from_secs(60),
        create_attempts: 3,
    }
}

/// Retry settings without real waiting.
pub fn fast_retry_config() -> RetryConfig {
    RetryConfig::default()
        .with_max_retries(2)
        .with_initial_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(5))
        .with_jitter(false)
}

/// Pool over `runtime` with test-friendly settings.
pub fn test_pool(runtime: Arc<FakeRuntime>, max_size: usize) -> Arc<SandboxPool> {
    Arc::new(SandboxPool::new(
        runtime,
        fast_pool_config(max_size),
        fast_retry_config(),
        Arc::new(MetricsRegistry::new()),
    ))
}

/// Executor over a fresh pool of `max_size` fake sandboxes.
pub fn test_executor(runtime: Arc<FakeRuntime>, max_size: usize) -> Executor {
    let pool = test_pool(runtime, max_size);
    Executor::new(pool, ExecutorConfig::default(), fast_retry_config())
}
