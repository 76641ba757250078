//! # Typed Failure Taxonomy
//!
//! Every failure surfaced by this crate is a [`TypedError`]: a human-readable message,
//! a closed set of [`ErrorDetails`] variants (one per kind, each with a fixed schema),
//! an optional remediation hint and the instant it was created.
//!
//! Retry decisions are not made here; see [`crate::retry::should_retry`].
//!
//! ## Kinds
//!
//! | Kind               | Typical trigger                                     |
//! |--------------------|-----------------------------------------------------|
//! | `Configuration`    | missing or invalid settings                         |
//! | `InputValidation`  | rejected filename or free text                      |
//! | `PathTraversal`    | a path resolving outside the workspace              |
//! | `CommandInjection` | shell chaining/substitution or destructive commands |
//! | `Api`              | a dependent network call failed                     |
//! | `Sandbox`          | the isolated environment could not be used          |
//! | `Execution`        | sandboxed code failed, crashed or timed out         |
//! | `KnowledgeBase`    | no content available                                |
//! | `Tool`             | a higher-level operation wrapping another failure   |

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Convenience alias used across the crate's public API.
pub type Result<T, E = TypedError> = std::result::Result<T, E>;

/// Stable, machine-checkable failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Configuration,
    InputValidation,
    PathTraversal,
    CommandInjection,
    Api,
    Sandbox,
    Execution,
    KnowledgeBase,
    Tool,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "Configuration",
            ErrorKind::InputValidation => "InputValidation",
            ErrorKind::PathTraversal => "PathTraversal",
            ErrorKind::CommandInjection => "CommandInjection",
            ErrorKind::Api => "API",
            ErrorKind::Sandbox => "Sandbox",
            ErrorKind::Execution => "Execution",
            ErrorKind::KnowledgeBase => "KnowledgeBase",
            ErrorKind::Tool => "Tool",
        }
    }

    /// Remediation shown when an error carries no hint of its own.
    pub fn default_hint(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "Set the missing setting or credential and restart.",
            ErrorKind::InputValidation => {
                "Remove disallowed characters or shorten the value and try again."
            }
            ErrorKind::PathTraversal => {
                "Use a path relative to the workspace without '..' segments."
            }
            ErrorKind::CommandInjection => {
                "Pass a single command without shell operators such as ';', '&&', '|' or '$(...)'."
            }
            ErrorKind::Api => "Check network connectivity and try again shortly.",
            ErrorKind::Sandbox => {
                "Check that the container runtime is running and has free capacity."
            }
            ErrorKind::Execution => "Inspect the captured stderr, fix the code and run it again.",
            ErrorKind::KnowledgeBase => "Add content to the knowledge base before querying it.",
            ErrorKind::Tool => "See the underlying cause for details.",
        }
    }

    /// Rejections produced by the security validator.
    pub fn is_input_rejection(&self) -> bool {
        matches!(
            self,
            ErrorKind::InputValidation | ErrorKind::PathTraversal | ErrorKind::CommandInjection
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which step of the sandbox lifecycle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxOperation {
    Create,
    Acquire,
    Exec,
    HealthCheck,
    Stop,
    Destroy,
    WorkspaceIo,
}

/// Why a sandboxed program did not complete successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionFailure {
    Timeout,
    NonZeroExit,
    Crashed,
}

/// Kind-specific structured payload of a [`TypedError`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorDetails {
    Configuration {
        setting: String,
    },
    InputValidation {
        field: String,
        reason: String,
    },
    PathTraversal {
        field: String,
        candidate: String,
    },
    CommandInjection {
        field: String,
        pattern: String,
    },
    Api {
        service: String,
        status: Option<u16>,
    },
    Sandbox {
        operation: SandboxOperation,
        sandbox_id: Option<String>,
        attempts: u32,
    },
    Execution {
        sandbox_id: String,
        reason: ExecutionFailure,
        exit_code: Option<i32>,
        stderr: String,
    },
    KnowledgeBase {
        source: String,
    },
    Tool {
        tool: String,
        cause: Box<TypedError>,
    },
}

impl ErrorDetails {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorDetails::Configuration { .. } => ErrorKind::Configuration,
            ErrorDetails::InputValidation { .. } => ErrorKind::InputValidation,
            ErrorDetails::PathTraversal { .. } => ErrorKind::PathTraversal,
            ErrorDetails::CommandInjection { .. } => ErrorKind::CommandInjection,
            ErrorDetails::Api { .. } => ErrorKind::Api,
            ErrorDetails::Sandbox { .. } => ErrorKind::Sandbox,
            ErrorDetails::Execution { .. } => ErrorKind::Execution,
            ErrorDetails::KnowledgeBase { .. } => ErrorKind::KnowledgeBase,
            ErrorDetails::Tool { .. } => ErrorKind::Tool,
        }
    }
}

/// A structured failure value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypedError {
    pub message: String,
    pub details: ErrorDetails,
    pub hint: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TypedError {
    pub fn new(message: impl Into<String>, details: ErrorDetails) -> Self {
        Self {
            message: message.into(),
            details,
            hint: None,
            timestamp: Utc::now(),
        }
    }

    pub fn configuration(setting: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            message,
            ErrorDetails::Configuration {
                setting: setting.into(),
            },
        )
    }

    pub fn input_validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        let field = field.into();
        let reason = reason.into();
        Self::new(
            format!("invalid value for '{field}': {reason}"),
            ErrorDetails::InputValidation { field, reason },
        )
    }

    pub fn path_traversal(
        field: impl Into<String>,
        candidate: impl Into<String>,
        reason: impl fmt::Display,
    ) -> Self {
        let field = field.into();
        Self::new(
            format!("path in '{field}' rejected: {reason}"),
            ErrorDetails::PathTraversal {
                field,
                candidate: candidate.into(),
            },
        )
    }

    pub fn command_injection(
        field: impl Into<String>,
        pattern: impl Into<String>,
        reason: impl fmt::Display,
    ) -> Self {
        let field = field.into();
        Self::new(
            format!("command in '{field}' rejected: {reason}"),
            ErrorDetails::CommandInjection {
                field,
                pattern: pattern.into(),
            },
        )
    }

    pub fn api(service: impl Into<String>, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::new(
            message,
            ErrorDetails::Api {
                service: service.into(),
                status,
            },
        )
    }

    pub fn sandbox(
        operation: SandboxOperation,
        sandbox_id: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            message,
            ErrorDetails::Sandbox {
                operation,
                sandbox_id,
                attempts: 1,
            },
        )
    }

    pub fn execution(
        sandbox_id: impl Into<String>,
        reason: ExecutionFailure,
        exit_code: Option<i32>,
        stderr: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            message,
            ErrorDetails::Execution {
                sandbox_id: sandbox_id.into(),
                reason,
                exit_code,
                stderr: stderr.into(),
            },
        )
    }

    pub fn knowledge_base(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            message,
            ErrorDetails::KnowledgeBase {
                source: source.into(),
            },
        )
    }

    /// Wrap `cause` as the failure of a higher-level operation named `tool`.
    pub fn tool(tool: impl Into<String>, cause: TypedError) -> Self {
        let tool = tool.into();
        Self::new(
            format!("{tool} failed: {}", cause.message),
            ErrorDetails::Tool {
                tool,
                cause: Box::new(cause),
            },
        )
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Record how many attempts were made before a sandbox failure was surfaced.
    pub fn with_attempts(mut self, count: u32) -> Self {
        if let ErrorDetails::Sandbox { attempts, .. } = &mut self.details {
            *attempts = count;
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.details.kind()
    }

    /// The error's own hint, or the default for its kind.
    pub fn hint_or_default(&self) -> &str {
        self.hint
            .as_deref()
            .unwrap_or_else(|| self.kind().default_hint())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self.details,
            ErrorDetails::Execution {
                reason: ExecutionFailure::Timeout,
                ..
            }
        )
    }

    /// No pooled sandbox became available within the pool's acquire timeout.
    pub fn is_acquire_timeout(&self) -> bool {
        matches!(
            self.details,
            ErrorDetails::Sandbox {
                operation: SandboxOperation::Acquire,
                ..
            }
        )
    }

    /// The innermost cause, following `Tool` wrappers.
    pub fn root_cause(&self) -> &TypedError {
        match &self.details {
            ErrorDetails::Tool { cause, .. } => cause.root_cause(),
            _ => self,
        }
    }
}

impl fmt::Display for TypedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message)
    }
}

impl std::error::Error for TypedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.details {
            ErrorDetails::Tool { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }
}

/// Flat, log-friendly rendering of a [`TypedError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Value,
    pub hint: Option<String>,
    pub timestamp: String,
    pub retryable: bool,
}

/// Render a consistent user-facing message: description plus remediation hint.
pub fn format_error_message(error: &TypedError) -> String {
    format!(
        "{}: {}\nHint: {}",
        error.kind(),
        error.message,
        error.hint_or_default()
    )
}

/// Flatten an error into a structured record for logging or API responses.
pub fn to_record(error: &TypedError) -> ErrorRecord {
    let mut details = serde_json::to_value(&error.details).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut details {
        map.remove("kind");
    }

    ErrorRecord {
        kind: error.kind(),
        message: error.message.clone(),
        details,
        hint: error.hint.clone(),
        timestamp: error.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        retryable: crate::retry::should_retry(error),
    }
}

/// Emit a structured audit event for a surfaced error.
pub(crate) fn log_error(error: &TypedError) {
    let record = to_record(error);
    let details = serde_json::to_string(&record.details).unwrap_or_default();
    tracing::warn!(
        target: "sandpool::audit",
        kind = %record.kind,
        retryable = record.retryable,
        timestamp = %record.timestamp,
        details = %details,
        "{}",
        record.message
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_follows_details() {
        let err = TypedError::path_traversal("target_path", "../../etc/passwd", "escapes root");
        assert_eq!(err.kind(), ErrorKind::PathTraversal);
        assert!(err.kind().is_input_rejection());
        assert!(err.message.contains("target_path"));
    }

    #[test]
    fn test_format_uses_default_hint() {
        let err = TypedError::configuration("workspace_root", "workspace_root is not set");
        let rendered = format_error_message(&err);
        assert!(rendered.starts_with("Configuration: workspace_root is not set"));
        assert!(rendered.contains("Hint: Set the missing setting"));
    }

    #[test]
    fn test_format_prefers_explicit_hint() {
        let err = TypedError::api("llm", Some(429), "rate limited").with_hint("slow down");
        assert!(format_error_message(&err).ends_with("Hint: slow down"));
    }

    #[test]
    fn test_record_flattens_details() {
        let err = TypedError::execution(
            "sbx-1",
            ExecutionFailure::Timeout,
            None,
            "",
            "execution exceeded 5s",
        );
        let record = to_record(&err);
        assert_eq!(record.kind, ErrorKind::Execution);
        assert_eq!(record.details["reason"], "timeout");
        assert_eq!(record.details["sandbox_id"], "sbx-1");
        assert!(record.details.get("kind").is_none());
        assert!(!record.retryable);
        assert!(record.timestamp.ends_with('Z'));
    }

    #[test]
    fn test_tool_wraps_cause() {
        let cause = TypedError::sandbox(SandboxOperation::Create, None, "daemon down");
        let err = TypedError::tool("run_tests", cause.clone());
        assert_eq!(err.kind(), ErrorKind::Tool);
        assert_eq!(err.root_cause(), &cause);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_with_attempts_only_touches_sandbox_errors() {
        let err = TypedError::sandbox(SandboxOperation::Create, None, "boom").with_attempts(3);
        assert!(matches!(err.details, ErrorDetails::Sandbox { attempts: 3, .. }));

        let other = TypedError::knowledge_base("docs", "empty").with_attempts(3);
        assert_eq!(other.kind(), ErrorKind::KnowledgeBase);
    }
}
