//! Error types for the orchestration engine.
//!
//! Errors are split by the phase that raises them. Configuration and graph
//! errors stop a run before anything executes; adapter and readiness errors
//! are contained to the resource that raised them.

use std::time::Duration;
use thiserror::Error;

/// Categories of adapter failures for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network timeouts, busy resources (retryable)
    Transient,
    /// Rejected by the target system, auth failures, bad input
    Permanent,
    /// The run was cancelled while the call was pending
    Cancelled,
}

impl ErrorCategory {
    /// Whether this category is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Short label used in logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Configuration rejected before any execution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required desired-state key is absent for the resource kind
    #[error("resource '{id}' ({kind}): missing required field '{field}'")]
    MissingField {
        id: String,
        kind: String,
        field: String,
    },

    /// Kind is not one of the supported variants
    #[error("resource '{id}': unknown kind '{kind}'")]
    UnknownKind { id: String, kind: String },

    /// Two resources share an identifier
    #[error("duplicate resource id '{id}'")]
    DuplicateId { id: String },

    /// A desired-state value has the wrong shape
    #[error("resource '{id}': invalid value for '{field}': {message}")]
    InvalidValue {
        id: String,
        field: String,
        message: String,
    },
}

/// Dependency graph could not be ordered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// The dependency relation contains a cycle
    #[error("dependency cycle detected: {}", .ids.join(" -> "))]
    CycleDetected {
        /// Identifiers on the cycle, in traversal order, first repeated last
        ids: Vec<String>,
    },

    /// A dependency names an unknown resource or the resource itself
    #[error("resource '{id}' has dangling dependency '{dependency}'")]
    DanglingDependency { id: String, dependency: String },

    /// A restriction target names no declared resource
    #[error("unknown resource '{id}'")]
    UnknownTarget { id: String },
}

/// Errors raised while talking to an external system.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    /// Worth retrying: timeouts, connection refused, resource busy
    #[error("transient adapter error: {message}")]
    Transient { message: String },

    /// Not worth retrying: validation rejected, auth failure
    #[error("permanent adapter error: {message}")]
    Permanent { message: String },

    /// The run-scoped cancellation token fired
    #[error("cancelled")]
    Cancelled,
}

impl AdapterError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Get the error category for retry logic.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transient { .. } => ErrorCategory::Transient,
            Self::Permanent { .. } => ErrorCategory::Permanent,
            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Whether this error is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Classify failed command output.
    ///
    /// Analyzes stderr to decide whether the failure is worth retrying.
    pub fn from_command_failure(program: &str, code: Option<i32>, stderr: &str) -> Self {
        let lower = stderr.to_lowercase();

        let transient = lower.contains("timed out")
            || lower.contains("timeout")
            || lower.contains("connection refused")
            || lower.contains("connection reset")
            || lower.contains("temporarily unavailable")
            || lower.contains("resource busy")
            || lower.contains("device or resource busy")
            || lower.contains("try again")
            || lower.contains("could not resolve")
            || lower.contains("tls handshake");

        let message = format!(
            "{} exited with {}: {}",
            program,
            code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
            stderr.trim()
        );

        if transient {
            Self::Transient { message }
        } else {
            Self::Permanent { message }
        }
    }

    /// Classify an HTTP status code returned by a target system.
    pub fn from_http_status(status: u16, url: &str, body: &str) -> Self {
        let message = format!("HTTP {} from {}: {}", status, url, body.trim());
        match status {
            408 | 429 | 500..=599 => Self::Transient { message },
            _ => Self::Permanent { message },
        }
    }
}

/// Readiness not reached.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadinessError {
    /// Timeout elapsed before the probe succeeded
    #[error("not ready after {attempts} attempts in {elapsed:?}: {last_failure}")]
    Timeout {
        attempts: u32,
        elapsed: Duration,
        /// Reason reported by the last failing probe
        last_failure: String,
    },

    /// The run was cancelled while waiting
    #[error("cancelled while waiting for readiness")]
    Cancelled,
}

/// Errors from the secret broker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecretError {
    /// A placeholder names a secret that was never supplied
    #[error("unknown secret '{name}'")]
    UnknownSecret { name: String },
}

/// Why a single resource failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: AdapterError },

    #[error("apply verification failed, still differing: {}", .remaining.join(", "))]
    ApplyVerificationFailed { remaining: Vec<String> },

    #[error(transparent)]
    Readiness(#[from] ReadinessError),

    #[error(transparent)]
    Secret(#[from] SecretError),
}

impl ExecutionError {
    /// Whether the failure came from cancellation rather than the target.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Adapter(AdapterError::Cancelled) | Self::Readiness(ReadinessError::Cancelled)
        )
    }
}

/// Errors that stop a run during planning.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Result type for planning operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_retryable() {
        assert!(ErrorCategory::Transient.is_retryable());
        assert!(!ErrorCategory::Permanent.is_retryable());
        assert!(!ErrorCategory::Cancelled.is_retryable());
    }

    #[test]
    fn test_command_failure_network() {
        let err = AdapterError::from_command_failure(
            "docker",
            Some(1),
            "Error response from daemon: Get https://registry-1.docker.io/v2/: net/http: TLS handshake timeout",
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_command_failure_rejected() {
        let err = AdapterError::from_command_failure(
            "docker",
            Some(125),
            "docker: invalid reference format.",
        );
        assert_eq!(err.category(), ErrorCategory::Permanent);
        assert!(err.to_string().contains("exited with 125"));
    }

    #[test]
    fn test_http_status_classification() {
        assert!(AdapterError::from_http_status(503, "http://x", "").is_retryable());
        assert!(AdapterError::from_http_status(429, "http://x", "").is_retryable());
        assert!(!AdapterError::from_http_status(401, "http://x", "bad credentials").is_retryable());
        assert!(!AdapterError::from_http_status(422, "http://x", "").is_retryable());
    }

    #[test]
    fn test_cycle_message_names_ids() {
        let err = GraphError::CycleDetected {
            ids: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
    }
}
