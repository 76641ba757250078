//! Host-process backend: a directory per sandbox, commands as child processes.

use super::{
    ContainerRuntime, ExecOutput, ExecRequest, ResourceUsage, RuntimeError, SandboxConstraints,
    wait_capped,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::process::Command;
use tracing::debug;

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Runs sandboxed commands directly on the host.
///
/// Each sandbox gets `<root>/<sandbox_id>` as its workspace. Commands start with a cleared
/// environment (only `PATH` and `HOME` are set).
///
/// On unix every command leads its own process group. The whole group is killed with
/// `SIGKILL` when the exec future completes or is dropped, and by [`stop`], so
/// backgrounded grandchildren never outlive the execution that started them.
///
/// [`stop`]: ContainerRuntime::stop
#[derive(Debug)]
pub struct LocalProcessRuntime {
    root: PathBuf,
    path_env: String,
    workspaces: Mutex<HashMap<String, PathBuf>>,
    /// Process groups of commands still running, per sandbox.
    groups: Mutex<HashMap<String, Vec<u32>>>,
}

impl LocalProcessRuntime {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            path_env: std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string()),
            workspaces: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn workspace(&self, sandbox_id: &str) -> Result<PathBuf, RuntimeError> {
        self.workspaces
            .lock()
            .map_err(|_| RuntimeError::Unhealthy(sandbox_id.to_string(), "state lock poisoned".into()))?
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownSandbox(sandbox_id.to_string()))
    }

    fn groups(&self) -> MutexGuard<'_, HashMap<String, Vec<u32>>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track_group(&self, sandbox_id: &str, pgid: u32) -> GroupGuard<'_> {
        self.groups()
            .entry(sandbox_id.to_string())
            .or_default()
            .push(pgid);
        GroupGuard {
            runtime: self,
            sandbox_id: sandbox_id.to_string(),
            pgid,
        }
    }
}

/// Kills a command's process group when the exec that spawned it ends.
struct GroupGuard<'a> {
    runtime: &'a LocalProcessRuntime,
    sandbox_id: String,
    pgid: u32,
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        let mut groups = self.runtime.groups();
        if let Some(pgids) = groups.get_mut(&self.sandbox_id) {
            pgids.retain(|&pgid| pgid != self.pgid);
            if pgids.is_empty() {
                groups.remove(&self.sandbox_id);
            }
        }
        drop(groups);
        kill_process_group(self.pgid);
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // Group 0 would be our own.
    if pgid <= 0 {
        return;
    }
    // SAFETY: killpg only sends a signal; an empty or vanished group yields ESRCH.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        debug!("Killed process group {}", pgid);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[async_trait]
impl ContainerRuntime for LocalProcessRuntime {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create(
        &self,
        sandbox_id: &str,
        _constraints: &SandboxConstraints,
    ) -> Result<PathBuf, RuntimeError> {
        let workspace = self.root.join(sandbox_id);
        tokio::fs::create_dir_all(&workspace).await?;
        let workspace = tokio::fs::canonicalize(&workspace).await?;

        if let Ok(mut workspaces) = self.workspaces.lock() {
            workspaces.insert(sandbox_id.to_string(), workspace.clone());
        }
        debug!("Created local sandbox {} at {:?}", sandbox_id, workspace);
        Ok(workspace)
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        request: &ExecRequest,
    ) -> Result<ExecOutput, RuntimeError> {
        let workspace = self.workspace(sandbox_id)?;
        let Some((program, args)) = request.argv.split_first() else {
            return Err(RuntimeError::Command {
                operation: "exec",
                status: None,
                stderr: "empty argument vector".to_string(),
            });
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(workspace.join(&request.working_dir))
            .env_clear()
            .env("PATH", &self.path_env)
            .env("HOME", &workspace)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn()?;
        let _group = child.id().map(|pgid| self.track_group(sandbox_id, pgid));
        let output = wait_capped(child, request.output_limit).await?;

        Ok(ExecOutput {
            exit_code: output.status.code(),
            signal: exit_signal(&output.status),
            stdout: output.stdout,
            stderr: output.stderr,
            truncated: output.truncated,
        })
    }

    async fn stop(&self, sandbox_id: &str) -> Result<(), RuntimeError> {
        self.workspace(sandbox_id)?;
        let pgids = self.groups().remove(sandbox_id).unwrap_or_default();
        for pgid in pgids {
            kill_process_group(pgid);
        }
        Ok(())
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<(), RuntimeError> {
        if let Some(pgids) = self.groups().remove(sandbox_id) {
            pgids.into_iter().for_each(kill_process_group);
        }

        let removed = self
            .workspaces
            .lock()
            .ok()
            .and_then(|mut workspaces| workspaces.remove(sandbox_id));

        if let Some(workspace) = removed {
            match tokio::fs::remove_dir_all(&workspace).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn usage(&self, sandbox_id: &str) -> Result<ResourceUsage, RuntimeError> {
        self.workspace(sandbox_id)?;
        Ok(ResourceUsage::default())
    }

    async fn health_check(&self, sandbox_id: &str) -> Result<(), RuntimeError> {
        let workspace = self.workspace(sandbox_id)?;
        match tokio::fs::metadata(&workspace).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(RuntimeError::Unhealthy(
                sandbox_id.to_string(),
                "workspace is not a directory".to_string(),
            )),
            Err(e) => Err(RuntimeError::Unhealthy(sandbox_id.to_string(), e.to_string())),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_local_runtime_lifecycle() {
        let temp = TempDir::new().unwrap();
        let runtime = LocalProcessRuntime::new(temp.path());
        let constraints = SandboxConstraints::default();

        let workspace = runtime.create("sbx-1", &constraints).await.unwrap();
        assert!(workspace.is_dir());
        runtime.health_check("sbx-1").await.unwrap();

        let output = runtime
            .exec(
                "sbx-1",
                &ExecRequest::new(argv(&["sh", "-c", "echo out; echo err >&2; pwd"])),
            )
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(0));
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.starts_with("out\n"));
        assert!(stdout.contains(&*workspace.to_string_lossy()));
        assert_eq!(String::from_utf8_lossy(&output.stderr), "err\n");

        runtime.destroy("sbx-1").await.unwrap();
        assert!(!workspace.exists());
        assert!(runtime.health_check("sbx-1").await.is_err());
    }

    #[tokio::test]
    async fn test_local_runtime_clears_environment() {
        let temp = TempDir::new().unwrap();
        let runtime = LocalProcessRuntime::new(temp.path());
        let workspace = runtime
            .create("sbx-env", &SandboxConstraints::default())
            .await
            .unwrap();

        let request = ExecRequest::new(argv(&["sh", "-c", "env | sort"])).with_env("MODE", "test");
        let output = runtime.exec("sbx-env", &request).await.unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let names: Vec<&str> = stdout
            .lines()
            .filter_map(|line| line.split('=').next())
            .filter(|name| !matches!(*name, "PWD" | "SHLVL" | "_" | "OLDPWD"))
            .collect();
        assert_eq!(names, vec!["HOME", "MODE", "PATH"]);
        assert!(stdout.contains(&format!("HOME={}", workspace.display())));
    }

    #[tokio::test]
    async fn test_local_runtime_reports_signal() {
        let temp = TempDir::new().unwrap();
        let runtime = LocalProcessRuntime::new(temp.path());
        runtime
            .create("sbx-sig", &SandboxConstraints::default())
            .await
            .unwrap();

        let output = runtime
            .exec("sbx-sig", &ExecRequest::new(argv(&["sh", "-c", "kill -9 $$"])))
            .await
            .unwrap();
        assert_eq!(output.signal, Some(9));
        assert!(output.crashed());
    }

    #[tokio::test]
    async fn test_timed_out_exec_leaves_no_background_children() {
        let temp = TempDir::new().unwrap();
        let runtime = LocalProcessRuntime::new(temp.path());
        let workspace = runtime
            .create("sbx-bg", &SandboxConstraints::default())
            .await
            .unwrap();

        let request = ExecRequest::new(argv(&[
            "sh",
            "-c",
            "(sleep 1; echo alive > marker) & sleep 30",
        ]));
        let timed_out =
            tokio::time::timeout(Duration::from_millis(300), runtime.exec("sbx-bg", &request)).await;
        assert!(timed_out.is_err());
        runtime.stop("sbx-bg").await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!workspace.join("marker").exists());
        assert!(runtime.groups().is_empty());
    }

    #[tokio::test]
    async fn test_stop_kills_running_command() {
        let temp = TempDir::new().unwrap();
        let runtime = LocalProcessRuntime::new(temp.path());
        runtime
            .create("sbx-stop", &SandboxConstraints::default())
            .await
            .unwrap();

        let request = ExecRequest::new(argv(&["sleep", "30"]));
        let (output, stopped) = tokio::join!(runtime.exec("sbx-stop", &request), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            runtime.stop("sbx-stop").await
        });
        stopped.unwrap();
        let output = output.unwrap();
        assert_eq!(output.signal, Some(libc::SIGKILL));
        assert!(output.crashed());
    }

    #[tokio::test]
    async fn test_output_capped_while_stream_drains() {
        let temp = TempDir::new().unwrap();
        let runtime = LocalProcessRuntime::new(temp.path());
        runtime
            .create("sbx-big", &SandboxConstraints::default())
            .await
            .unwrap();

        let request = ExecRequest::new(argv(&["sh", "-c", "head -c 5000000 /dev/zero; echo done >&2"]))
            .with_output_limit(1024);
        let output = runtime.exec("sbx-big", &request).await.unwrap();
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout.len(), 1024);
        assert_eq!(output.stderr, b"done\n");
        assert!(output.truncated);
    }

    #[tokio::test]
    async fn test_unknown_sandbox() {
        let temp = TempDir::new().unwrap();
        let runtime = LocalProcessRuntime::new(temp.path());
        let err = runtime
            .exec("missing", &ExecRequest::new(argv(&["true"])))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownSandbox(_)));
    }
}
