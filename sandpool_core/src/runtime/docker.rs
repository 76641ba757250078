//! Docker CLI backend: one detached container per sandbox.

use super::{
    CapturedOutput, ContainerRuntime, ExecOutput, ExecRequest, ResourceUsage, RuntimeError,
    SandboxConstraints, capture_output, clear_directory,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Mount point of the workspace inside every container.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Memory high-water mark of the container's own cgroup (v2, then v1).
const PEAK_MEMORY_SCRIPT: &str = "cat /sys/fs/cgroup/memory.peak 2>/dev/null \
    || cat /sys/fs/cgroup/memory/memory.max_usage_in_bytes";

/// Stdout kept from CLI housekeeping commands.
const CLI_OUTPUT_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DockerSettings {
    /// Container CLI binary (`docker`, `podman`).
    pub binary: String,
    /// Value passed to `--network`.
    pub network: String,
    pub pids_limit: u32,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            network: "none".to_string(),
            pids_limit: 128,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DockerCliRuntime {
    settings: DockerSettings,
    /// Host directory holding the bind-mounted workspaces.
    workspace_root: PathBuf,
}

impl DockerCliRuntime {
    pub fn new(settings: DockerSettings, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            workspace_root: workspace_root.into(),
        }
    }

    fn container_name(sandbox_id: &str) -> String {
        format!("sandpool-{}", sandbox_id)
    }

    fn workspace(&self, sandbox_id: &str) -> PathBuf {
        self.workspace_root.join(sandbox_id)
    }

    /// Arguments for `docker run`, without the binary.
    fn run_args(&self, sandbox_id: &str, workspace: &Path, constraints: &SandboxConstraints) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            Self::container_name(sandbox_id),
            format!("--network={}", self.settings.network),
            format!("--pids-limit={}", self.settings.pids_limit),
            "--read-only".to_string(),
            "--tmpfs".to_string(),
            "/tmp:rw,size=64m".to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
        ];
        if let Some(mb) = constraints.memory_limit_mb {
            args.push(format!("--memory={}m", mb));
            args.push(format!("--memory-swap={}m", mb));
        }
        if let Some(cpus) = constraints.cpu_limit {
            args.push(format!("--cpus={}", cpus));
        }
        args.extend([
            "-v".to_string(),
            format!("{}:{}:rw", workspace.display(), CONTAINER_WORKSPACE),
            "-w".to_string(),
            CONTAINER_WORKSPACE.to_string(),
            constraints.image.clone(),
            "sleep".to_string(),
            "infinity".to_string(),
        ]);
        args
    }

    /// Arguments for `docker exec`, without the binary.
    fn exec_args(&self, sandbox_id: &str, request: &ExecRequest) -> Vec<String> {
        let workdir = Path::new(CONTAINER_WORKSPACE).join(&request.working_dir);
        let mut args = vec![
            "exec".to_string(),
            "-w".to_string(),
            workdir.display().to_string(),
        ];
        for (k, v) in &request.env {
            args.extend(["-e".to_string(), format!("{}={}", k, v)]);
        }
        args.push(Self::container_name(sandbox_id));
        args.extend(request.argv.iter().cloned());
        args
    }

    async fn run_cli(&self, args: &[String], cap: Option<usize>) -> Result<CapturedOutput, RuntimeError> {
        let mut command = Command::new(&self.settings.binary);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);

        capture_output(&mut command, cap).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RuntimeError::Unavailable(format!("'{}' not found on PATH", self.settings.binary))
            } else {
                RuntimeError::Io(e)
            }
        })
    }

    async fn run_checked(&self, operation: &'static str, args: &[String]) -> Result<CapturedOutput, RuntimeError> {
        let output = self.run_cli(args, Some(CLI_OUTPUT_LIMIT)).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(RuntimeError::Command {
                operation,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn peak_memory(&self, sandbox_id: &str) -> Option<u64> {
        let args = vec![
            "exec".to_string(),
            Self::container_name(sandbox_id),
            "sh".to_string(),
            "-c".to_string(),
            PEAK_MEMORY_SCRIPT.to_string(),
        ];
        match self.run_checked("docker exec", &args).await {
            Ok(output) => parse_peak(&String::from_utf8_lossy(&output.stdout)),
            Err(e) => {
                debug!("No memory peak for {}: {}", sandbox_id, e);
                None
            }
        }
    }
}

/// Parse the single integer in a cgroup memory peak file.
fn parse_peak(contents: &str) -> Option<u64> {
    contents.trim().parse().ok()
}

/// Parse a `docker stats` size such as `12.5MiB` or `1.2GB` into bytes.
fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier = match unit.trim() {
        "" | "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "kB" | "KB" => 1000.0,
        "MB" => 1000.0 * 1000.0,
        "GB" => 1000.0 * 1000.0 * 1000.0,
        _ => return None,
    };
    Some((number * multiplier) as u64)
}

/// Parse `"<used> / <limit>|<cpu>%"` as produced by the stats format string.
fn parse_stats_line(line: &str) -> Option<ResourceUsage> {
    let (mem, cpu) = line.trim().split_once('|')?;
    let used = mem.split('/').next()?;
    Some(ResourceUsage {
        memory_bytes: parse_size(used)?,
        cpu_percent: cpu.trim().trim_end_matches('%').parse().ok()?,
        peak_memory_bytes: None,
    })
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(
        &self,
        sandbox_id: &str,
        constraints: &SandboxConstraints,
    ) -> Result<PathBuf, RuntimeError> {
        let workspace = self.workspace(sandbox_id);
        tokio::fs::create_dir_all(&workspace).await?;

        let args = self.run_args(sandbox_id, &workspace, constraints);
        if let Err(e) = self.run_checked("docker run", &args).await {
            let _ = tokio::fs::remove_dir_all(&workspace).await;
            return Err(e);
        }

        debug!(
            "Started container {} from image {}",
            Self::container_name(sandbox_id),
            constraints.image
        );
        Ok(workspace)
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        request: &ExecRequest,
    ) -> Result<ExecOutput, RuntimeError> {
        let output = self
            .run_cli(&self.exec_args(sandbox_id, request), request.output_limit)
            .await?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        // 125-127 from `docker exec` itself mean the command never started.
        match output.status.code() {
            Some(125) | Some(126) | Some(127) if stderr.contains("Error response from daemon") || stderr.contains("OCI runtime") => {
                Err(RuntimeError::Command {
                    operation: "docker exec",
                    status: output.status.code(),
                    stderr: stderr.trim().to_string(),
                })
            }
            code => Ok(ExecOutput {
                exit_code: code,
                signal: None,
                stdout: output.stdout,
                stderr: output.stderr,
                truncated: output.truncated,
            }),
        }
    }

    async fn stop(&self, sandbox_id: &str) -> Result<(), RuntimeError> {
        let args = vec!["kill".to_string(), Self::container_name(sandbox_id)];
        self.run_checked("docker kill", &args).await.map(|_| ())
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<(), RuntimeError> {
        let args = vec![
            "rm".to_string(),
            "-f".to_string(),
            Self::container_name(sandbox_id),
        ];
        let removed = self.run_checked("docker rm", &args).await;

        let workspace = self.workspace(sandbox_id);
        if let Err(e) = tokio::fs::remove_dir_all(&workspace).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Failed to remove workspace {:?}: {}", workspace, e);
        }
        removed.map(|_| ())
    }

    async fn usage(&self, sandbox_id: &str) -> Result<ResourceUsage, RuntimeError> {
        let args = vec![
            "stats".to_string(),
            "--no-stream".to_string(),
            "--format".to_string(),
            "{{.MemUsage}}|{{.CPUPerc}}".to_string(),
            Self::container_name(sandbox_id),
        ];
        let output = self.run_checked("docker stats", &args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut usage = parse_stats_line(&stdout).ok_or_else(|| RuntimeError::Command {
            operation: "docker stats",
            status: output.status.code(),
            stderr: format!("unparseable stats line: {}", stdout.trim()),
        })?;
        usage.peak_memory_bytes = self.peak_memory(sandbox_id).await;
        Ok(usage)
    }

    async fn health_check(&self, sandbox_id: &str) -> Result<(), RuntimeError> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Running}}".to_string(),
            Self::container_name(sandbox_id),
        ];
        let output = self.run_checked("docker inspect", &args).await?;
        if String::from_utf8_lossy(&output.stdout).trim() == "true" {
            Ok(())
        } else {
            Err(RuntimeError::Unhealthy(
                sandbox_id.to_string(),
                "container is not running".to_string(),
            ))
        }
    }

    async fn reset_workspace(&self, sandbox_id: &str, workspace: &Path) -> Result<(), RuntimeError> {
        // Files written by the container may not be removable from the host.
        let args = vec![
            "exec".to_string(),
            Self::container_name(sandbox_id),
            "find".to_string(),
            CONTAINER_WORKSPACE.to_string(),
            "-mindepth".to_string(),
            "1".to_string(),
            "-delete".to_string(),
        ];
        self.run_checked("docker exec", &args).await?;
        clear_directory(workspace).await
    }
}
