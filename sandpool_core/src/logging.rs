//! # Logging Initialization
//!
//! One entry point, [`init_logging`], sets up the global `tracing` subscriber. It is
//! guarded by a `std::sync::Once`, so repeated calls (from tests, or from the CLI after
//! a library user already initialized logging) are harmless.
//!
//! ## Layers
//!
//! 1.  **Environment Filter (`EnvFilter`)**: verbosity comes from `RUST_LOG`. When it is
//!     unset the filter is `<level>,sandpool_core=debug`.
//!
//! 2.  **File Logging**: with `log_to_file = true`, events go to a daily rolling file in
//!     the user cache directory (via `directories`), written through a non-blocking
//!     `tracing_appender` writer without ANSI colors.
//!
//! 3.  **Stderr Logging**: with `log_to_file = false`, or when the cache directory cannot
//!     be determined or written, events go to stderr with ANSI colors.
//!
//! Audit events (every execution attempt and every surfaced error) use the
//! `sandpool::audit` target, so `RUST_LOG=sandpool::audit=info` isolates them.

use anyhow::Result;
use directories::ProjectDirs;
use std::{io::stderr, path::Path, sync::Once};
use tracing_subscriber::{EnvFilter, fmt::layer, prelude::*};

static INIT: Once = Once::new();

/// File name prefix of the rolling log.
pub const LOG_FILE_NAME: &str = "sandpool.log";

/// Initialize verbose logging for tests.
///
/// This configures a `trace`-level subscriber that logs to stderr.
pub fn init_test_logging() {
    init_logging("trace", false).expect("Failed to initialize test logging");
}

/// Directory holding the rolling log file, if the platform has a cache directory.
pub fn log_directory() -> Option<std::path::PathBuf> {
    ProjectDirs::from("dev", "sandpool", "sandpool").map(|dirs| dirs.cache_dir().to_path_buf())
}

/// Initializes the logging system.
///
/// # Errors
///
/// Currently infallible; the `Result` leaves room for sinks that can fail to open.
pub fn init_logging(log_level: &str, log_to_file: bool) -> Result<()> {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{log_level},sandpool_core=debug")));

        if log_to_file && let Some(log_dir) = log_directory() {
            // tracing_appender::rolling::daily panics on permission errors.
            let file_appender_result = if can_write(&log_dir) {
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME)
                }))
            } else {
                Err(Box::new("Cannot write to log directory") as Box<dyn std::any::Any + Send>)
            };

            if let Ok(file_appender) = file_appender_result {
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(layer().with_writer(non_blocking).with_ansi(false))
                    .init();
                // Leaked so buffered lines are flushed on exit.
                Box::leak(Box::new(guard));
                return;
            }
        }

        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer().with_writer(stderr).with_ansi(true))
            .init();
    });

    Ok(())
}

/// Create `dir` if needed and check that a file can be written into it.
fn can_write(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }

    let check = dir.join(".sandpool_log_write_check");
    match std::fs::write(&check, "check") {
        Ok(()) => {
            let _ = std::fs::remove_file(&check);
            true
        }
        Err(_) => false,
    }
}
