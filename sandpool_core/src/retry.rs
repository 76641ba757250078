//! Retry Policy with Exponential Backoff
//!
//! Two pure functions decide whether and when to retry a [`TypedError`]:
//!
//! - [`should_retry`] dispatches on the error kind (and, for `Api` errors, the HTTP status).
//! - [`get_retry_delay`] returns the backoff for a 0-indexed attempt: 1s, 2s, 4s... capped.
//!
//! [`execute_with_retry`] is the explicit loop that consumes them. Callers that need a
//! different schedule build a [`RetryConfig`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sandpool_core::retry::{RetryConfig, execute_with_retry};
//!
//! let config = RetryConfig::default();
//! let handle = execute_with_retry(&config, "create sandbox", || async {
//!     runtime.create(&spec).await.map_err(|e| e.into_typed(SandboxOperation::Create, None))
//! }).await?;
//! ```

use crate::error::{ErrorDetails, TypedError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Unit of the default backoff schedule.
pub const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Ceiling of the default backoff schedule.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// HTTP statuses that indicate a transient upstream failure.
const RETRYABLE_STATUS_CODES: &[u16] = &[429, 503];

/// Retry policy strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Delays grow exponentially: initial_delay * backoff_factor^attempt
    #[default]
    ExponentialBackoff,
    /// Fixed delay between all retries
    FixedDelay,
    /// No delay between retries
    Immediate,
}

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting initial try)
    pub max_retries: u32,
    /// Initial delay before first retry
    #[serde(rename = "initial_delay_ms", with = "millis")]
    pub initial_delay: Duration,
    /// Maximum delay cap (prevents unbounded growth)
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry delay
    pub backoff_factor: f64,
    /// The retry policy to use
    pub policy: RetryPolicy,
    /// Whether to add jitter to delays
    pub jitter_enabled: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: BASE_RETRY_DELAY,
            max_delay: MAX_RETRY_DELAY,
            backoff_factor: 2.0,
            policy: RetryPolicy::ExponentialBackoff,
            jitter_enabled: false,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter_enabled = enabled;
        self
    }

    /// Calculate the delay for a given retry attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = match self.policy {
            RetryPolicy::ExponentialBackoff => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let multiplier = self.backoff_factor.powi(exponent);
                let delay_ms = self.initial_delay.as_millis() as f64 * multiplier;
                // `as` saturates, so an overflowing product lands on the cap below.
                Duration::from_millis(delay_ms as u64)
            }
            RetryPolicy::FixedDelay => self.initial_delay,
            RetryPolicy::Immediate => Duration::ZERO,
        };

        std::cmp::min(delay, self.max_delay)
    }

    /// Calculate delay with optional jitter (±50% of base delay)
    pub fn delay_for_attempt_with_jitter(&self, attempt: u32) -> Duration {
        let base_delay = self.delay_for_attempt(attempt);

        if !self.jitter_enabled || base_delay.is_zero() {
            return base_delay;
        }

        let base_ms = base_delay.as_millis() as f64;
        let jitter_range = base_ms * 0.5;
        let jitter = rand::rng().random_range(-jitter_range..jitter_range);
        let jittered_ms = (base_ms + jitter).max(0.0);

        Duration::from_millis(jittered_ms as u64)
    }
}

/// Decide whether a failure is worth another attempt.
pub fn should_retry(error: &TypedError) -> bool {
    match &error.details {
        ErrorDetails::Api { status: None, .. } => true,
        ErrorDetails::Api {
            status: Some(code), ..
        } => RETRYABLE_STATUS_CODES.contains(code),
        ErrorDetails::Sandbox { .. } => true,
        ErrorDetails::Tool { cause, .. } => should_retry(cause),
        ErrorDetails::Configuration { .. }
        | ErrorDetails::InputValidation { .. }
        | ErrorDetails::PathTraversal { .. }
        | ErrorDetails::CommandInjection { .. }
        | ErrorDetails::Execution { .. }
        | ErrorDetails::KnowledgeBase { .. } => false,
    }
}

/// Default backoff: 1s, 2s, 4s, ... capped at [`MAX_RETRY_DELAY`].
pub fn get_retry_delay(attempt: u32) -> Duration {
    RetryConfig::default().delay_for_attempt(attempt)
}

/// Patterns indicating permanent runtime failures that retrying cannot fix
const PERMANENT_PATTERNS: &[&str] = &[
    "permission denied",
    "access denied",
    "operation not permitted",
    "no such image",
    "pull access denied",
    "manifest unknown",
    "invalid reference format",
    "executable file not found",
    "unknown flag",
    "cannot connect to the docker daemon",
];

/// Whether a raw runtime error message describes a failure that retrying cannot fix.
///
/// Such failures are surfaced as `Configuration` errors instead of retryable `Sandbox` ones.
pub fn is_permanent_runtime_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    PERMANENT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Execute an async operation, retrying while [`should_retry`] allows it.
///
/// # Returns
/// The first success, the first non-retryable error, or the last error once
/// `1 + config.max_retries` attempts have been made.
pub async fn execute_with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, TypedError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, TypedError>>,
{
    execute_with_retry_when(config, operation_name, should_retry, operation).await
}

/// [`execute_with_retry`] with a caller-supplied retry predicate, for call sites that must
/// narrow [`should_retry`].
pub async fn execute_with_retry_when<P, F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    retryable: P,
    operation: F,
) -> Result<T, TypedError>
where
    P: Fn(&TypedError) -> bool,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, TypedError>>,
{
    let total_attempts = 1 + config.max_retries;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                attempt += 1;

                if !retryable(&err) {
                    tracing::debug!(
                        "Non-retryable {} error in {} on attempt {}: {}",
                        err.kind(),
                        operation_name,
                        attempt,
                        err.message
                    );
                    return Err(err.with_attempts(attempt));
                }

                let retries_remaining = total_attempts.saturating_sub(attempt);
                if retries_remaining == 0 {
                    tracing::warn!(
                        "{} failed after {} attempts: {}",
                        operation_name,
                        attempt,
                        err.message
                    );
                    return Err(err.with_attempts(attempt));
                }

                let delay = if config.jitter_enabled {
                    config.delay_for_attempt_with_jitter(attempt - 1)
                } else {
                    config.delay_for_attempt(attempt - 1)
                };

                tracing::debug!(
                    "Retryable error in {} on attempt {} ({}ms delay, {} retries left): {}",
                    operation_name,
                    attempt,
                    delay.as_millis(),
                    retries_remaining,
                    err.message
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxOperation;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_retry_policy_default() {
        assert_eq!(RetryPolicy::default(), RetryPolicy::ExponentialBackoff);
    }

    #[test]
    fn test_default_delays_double_from_one_unit() {
        assert_eq!(get_retry_delay(0), Duration::from_secs(1));
        assert_eq!(get_retry_delay(1), Duration::from_secs(2));
        assert_eq!(get_retry_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn test_delays_are_non_decreasing_and_capped() {
        let mut previous = Duration::ZERO;
        for attempt in 0..80 {
            let delay = get_retry_delay(attempt);
            assert!(delay >= previous, "attempt {attempt} went backwards");
            assert!(delay <= MAX_RETRY_DELAY);
            previous = delay;
        }
        assert_eq!(get_retry_delay(79), MAX_RETRY_DELAY);
    }

    #[test]
    fn test_jitter_stays_within_half_of_base() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(true);
        for _ in 0..50 {
            let delay = config.delay_for_attempt_with_jitter(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_should_retry_api_status_codes() {
        assert!(should_retry(&TypedError::api("llm", Some(429), "slow down")));
        assert!(should_retry(&TypedError::api("llm", Some(503), "unavailable")));
        assert!(should_retry(&TypedError::api("llm", None, "connection reset")));
        assert!(!should_retry(&TypedError::api("llm", Some(401), "unauthorized")));
        assert!(!should_retry(&TypedError::api("llm", Some(403), "forbidden")));
        assert!(!should_retry(&TypedError::api("llm", Some(404), "missing")));
    }

    #[test]
    fn test_should_retry_by_kind() {
        assert!(!should_retry(&TypedError::configuration("api_key", "missing")));
        assert!(should_retry(&TypedError::sandbox(
            SandboxOperation::Create,
            None,
            "daemon busy"
        )));
        assert!(!should_retry(&TypedError::knowledge_base("docs", "empty")));
        assert!(!should_retry(&TypedError::input_validation("name", "too long")));
    }

    #[test]
    fn test_tool_inherits_retryability() {
        let transient = TypedError::tool("deploy", TypedError::api("ci", Some(503), "down"));
        let permanent = TypedError::tool("deploy", TypedError::api("ci", Some(401), "denied"));
        assert!(should_retry(&transient));
        assert!(!should_retry(&permanent));
    }

    #[test]
    fn test_permanent_runtime_failures() {
        assert!(is_permanent_runtime_failure(
            "Error response from daemon: No such image: python:3.99"
        ));
        assert!(is_permanent_runtime_failure("Permission denied while timed out"));
        assert!(!is_permanent_runtime_failure("connection refused"));
        assert!(!is_permanent_runtime_failure(""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let config = RetryConfig::new().with_max_retries(3);

        let result = execute_with_retry(&config, "flaky", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TypedError::sandbox(SandboxOperation::Create, None, "busy"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_non_retryable_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = execute_with_retry(&RetryConfig::default(), "config", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TypedError::configuration("image", "not set"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempts() {
        let config = RetryConfig::new().with_max_retries(2);

        let err = execute_with_retry(&config, "create", || async {
            Err::<(), _>(TypedError::sandbox(SandboxOperation::Create, None, "busy"))
        })
        .await
        .unwrap_err();

        assert!(matches!(err.details, ErrorDetails::Sandbox { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_narrowed_predicate_stops_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let retryable = |err: &TypedError| should_retry(err) && !err.is_acquire_timeout();

        let err = execute_with_retry_when(&RetryConfig::default(), "execution", retryable, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TypedError::sandbox(SandboxOperation::Acquire, None, "pool full"))
            }
        })
        .await
        .unwrap_err();

        assert!(err.is_acquire_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
