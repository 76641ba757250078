//! End-to-end scenarios through `Executor::execute`.
//!
//! Most tests use `FakeRuntime`; the local-process tests run real interpreters and are
//! skipped when the interpreter is not installed.

use sandpool_core::config::{RuntimeBackend, SandpoolConfig};
use sandpool_core::error::{ErrorDetails, ErrorKind, ExecutionFailure, format_error_message};
use sandpool_core::executor::{ExecutionRequest, Executor, ExecutorConfig, Language};
use sandpool_core::logging::init_test_logging;
use sandpool_core::test_utils::{FakeRuntime, exec_exit, test_executor};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn on_path(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

fn local_executor(root: &Path) -> Executor {
    let config = SandpoolConfig {
        workspace_root: root.join("workspaces"),
        ..SandpoolConfig::default()
    };
    assert_eq!(config.runtime.backend, RuntimeBackend::Local);
    Executor::from_config(&config).expect("valid config")
}

#[tokio::test]
async fn test_print_one_plus_one_runs_locally() {
    init_test_logging();
    if !on_path("python3") {
        eprintln!("python3 not found; skipping");
        return;
    }
    let temp = TempDir::new().unwrap();
    let executor = local_executor(temp.path());

    let result = executor
        .execute(ExecutionRequest::code("print(1+1)").with_timeout(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "2\n");
    assert!(!result.tainted);
    executor.shutdown().await;
}

#[tokio::test]
async fn test_bash_payload_and_workspace_reset() {
    if !on_path("bash") {
        eprintln!("bash not found; skipping");
        return;
    }
    let temp = TempDir::new().unwrap();
    let executor = local_executor(temp.path());

    let request = ExecutionRequest::code("cat data/input.txt; touch leftover")
        .with_language(Language::Bash)
        .with_file("data/input.txt", "hello from the workspace\n");
    let first = executor.execute(request).await.unwrap();
    assert_eq!(first.stdout, "hello from the workspace\n");

    // The same sandbox is reused with an emptied workspace.
    let second = executor
        .execute(ExecutionRequest::code("ls -A").with_language(Language::Bash))
        .await
        .unwrap();
    assert_eq!(second.sandbox_id, first.sandbox_id);
    assert!(second.reused);
    assert_eq!(second.stdout, "main.sh\n");
    executor.shutdown().await;
}

#[tokio::test]
async fn test_local_timeout_kills_process() {
    if !on_path("bash") {
        eprintln!("bash not found; skipping");
        return;
    }
    let temp = TempDir::new().unwrap();
    let executor = local_executor(temp.path());

    let started = std::time::Instant::now();
    let err = executor
        .execute(
            ExecutionRequest::code("sleep 30")
                .with_language(Language::Bash)
                .with_timeout(Duration::from_millis(300)),
        )
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(err.is_timeout());

    assert!(executor.pool().wait_for_pending_destroys(Duration::from_secs(5)).await);
    assert_eq!(executor.get_pool_stats().sandboxes_destroyed, 1);
    executor.shutdown().await;
}

#[tokio::test]
async fn test_local_timeout_kills_background_children() {
    if !on_path("bash") {
        eprintln!("bash not found; skipping");
        return;
    }
    let temp = TempDir::new().unwrap();
    let executor = local_executor(temp.path());
    let marker = temp.path().join("marker");

    let script = format!("(sleep 1; echo alive > {}) & sleep 30", marker.display());
    let err = executor
        .execute(
            ExecutionRequest::code(script)
                .with_language(Language::Bash)
                .with_timeout(Duration::from_millis(300)),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!marker.exists());
    executor.shutdown().await;
}

#[tokio::test]
async fn test_flooding_output_is_capped_locally() {
    if !on_path("bash") {
        eprintln!("bash not found; skipping");
        return;
    }
    let temp = TempDir::new().unwrap();
    let config = SandpoolConfig {
        workspace_root: temp.path().join("workspaces"),
        executor: ExecutorConfig {
            max_output_bytes: 4096,
            ..ExecutorConfig::default()
        },
        ..SandpoolConfig::default()
    };
    let executor = Executor::from_config(&config).unwrap();

    let result = executor
        .execute(
            ExecutionRequest::code("yes sandpool | head -c 50000000")
                .with_language(Language::Bash)
                .with_timeout(Duration::from_secs(20)),
        )
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert!(result.truncated);
    assert!(result.stdout.len() <= 4096);
    assert!(result.stdout.starts_with("sandpool\n"));
    executor.shutdown().await;
}

#[tokio::test]
async fn test_path_traversal_leaves_pool_untouched() {
    let runtime = Arc::new(FakeRuntime::new());
    let executor = test_executor(Arc::clone(&runtime), 2);

    for target in ["../../etc/passwd", "/etc/passwd", "src/../../secret.py"] {
        let err = executor
            .execute(ExecutionRequest::code("print(1)").with_target_path(target))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathTraversal, "target {target}");
        assert!(format_error_message(&err).contains("Hint:"));
    }

    let stats = executor.get_pool_stats();
    assert_eq!(stats.sandboxes_created, 0);
    assert_eq!(stats.sandboxes_reused, 0);
    assert!(runtime.created().is_empty());
    assert_eq!(executor.get_metrics().count("execution_failures"), 3);
}

#[tokio::test]
async fn test_timeout_increments_destroyed_counter() {
    let runtime = Arc::new(FakeRuntime::new().with_exec_delay(Duration::from_secs(10)));
    let executor = test_executor(Arc::clone(&runtime), 1);

    let err = executor
        .execute(ExecutionRequest::code("import time; time.sleep(60)").with_timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();

    match &err.details {
        ErrorDetails::Execution { reason, .. } => assert_eq!(*reason, ExecutionFailure::Timeout),
        other => panic!("expected an execution error, got {other:?}"),
    }
    assert!(executor.pool().wait_for_pending_destroys(Duration::from_secs(2)).await);
    assert_eq!(executor.get_pool_stats().sandboxes_destroyed, 1);
    assert_eq!(runtime.live(), 0);
}

#[tokio::test]
async fn test_concurrent_executions_share_bounded_pool() {
    let runtime = Arc::new(
        FakeRuntime::new()
            .with_exec_delay(Duration::from_millis(10))
            .with_exec_handler(|req| exec_exit(0, &req.argv.join(" "), "")),
    );
    let executor = Arc::new(test_executor(Arc::clone(&runtime), 2));

    let runs = (0..10).map(|i| {
        let executor = Arc::clone(&executor);
        async move {
            executor
                .execute(ExecutionRequest::code(format!("print({i})")))
                .await
        }
    });
    let results = futures::future::join_all(runs).await;

    assert!(results.iter().all(|r| r.as_ref().is_ok_and(|r| r.stdout == "python3 main.py")));
    assert!(runtime.peak_live() <= 2);
    let stats = executor.get_pool_stats();
    assert_eq!(stats.executions, 10);
    assert_eq!(stats.sandboxes_created + stats.sandboxes_reused, 10);
    assert_eq!(stats.in_use, 0);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_building() {
    let temp = TempDir::new().unwrap();
    let mut config = SandpoolConfig {
        workspace_root: temp.path().join("workspaces"),
        ..SandpoolConfig::default()
    };
    config.pool.max_size = 0;

    let err = Executor::from_config(&config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
