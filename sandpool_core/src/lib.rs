//! # Sandpool Core
//!
//! Sandpool runs untrusted, generated code and test suites inside isolated,
//! resource-bounded sandboxes drawn from a reusable pool.
//!
//! ## Request Flow
//!
//! ```text
//! caller -> Executor -> security (reject early) -> SandboxPool::acquire
//!        -> write payload, run under timeout -> capture output -> metrics
//!        -> SandboxPool::release (reuse or destroy) -> ExecutionResult | TypedError
//! ```
//!
//! ## Key Guarantees
//!
//! - **Validate first**: every path, filename, command and free-text input passes the
//!   [`security`] checks before anything reaches the filesystem or a sandbox.
//! - **Bounded pool**: live sandboxes never exceed `pool.max_size`; a sandbox is leased to
//!   one execution at a time and is always released or destroyed, including on timeout,
//!   error and cancellation.
//! - **Typed failures**: every error is a [`TypedError`] from a closed set of kinds, with a
//!   remediation hint and a pure retry policy ([`retry::should_retry`]).
//!
//! ## Modules
//!
//! - **`executor`**: the public entry point, [`Executor::execute`].
//! - **`pool`**: sandbox lifecycle, reuse and idle eviction.
//! - **`runtime`**: the container runtime boundary and its local and docker backends.
//! - **`security`**: path, command, filename and user input validation.
//! - **`error`** / **`retry`**: error taxonomy and backoff policy.
//! - **`report`**: lenient pytest report parsing.
//! - **`metrics`**: counters and gauges for the pool and executions.
//! - **`config`** / **`logging`**: TOML configuration and `tracing` setup.

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod report;
pub mod retry;
pub mod runtime;
pub mod security;

// Test utilities
pub mod test_utils;

// Re-export main types for easier use
pub use config::SandpoolConfig;
pub use error::{ErrorKind, TypedError};
pub use executor::{ExecutionMode, ExecutionRequest, ExecutionResult, Executor, Language};
pub use pool::SandboxPool;
pub use runtime::{ContainerRuntime, SandboxConstraints};
