//! Error types for every failure mode of a sandboxed execution
//!
//! Errors are grouped by the component that raises them. Sandbox, channel and
//! configuration errors stay internal to the runtime; the Runner folds them into
//! an [`ExecutionError`], which is the only error a caller of `run` ever sees.
//! Its messages distinguish runtime availability problems from script logic
//! errors and from resource limit violations, since each is fixed differently.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ScriptError;

/// Failure raised by an isolation backend.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Sandbox failed to start: {0}")]
    Startup(String),
    #[error("Memory usage unavailable: {0}")]
    Monitor(String),
    #[error("Sandbox teardown failed: {0}")]
    Teardown(String),
    #[error("Docker operation failed: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("I/O error in sandbox backend: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure raised by the control channel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("Control channel unable to connect (timeout={timeout_ms}ms)")]
    ConnectTimeout { timeout_ms: u64 },
    #[error("Disconnected")]
    Disconnected,
    #[error("Control channel request error: {0}")]
    Transport(String),
    #[error("Control channel response error: {0}")]
    Decode(String),
}

/// User argument validation failure. Raised before any sandbox is started.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("SchemaError: Missing user arg '{key}'")]
    MissingArgument { key: String },
    #[error("SchemaError: Invalid number value '{value}' for user arg '{key}'")]
    InvalidNumber { key: String, value: String },
    #[error("SchemaError: Unrecognized type '{declared}' for user arg '{key}'")]
    UnrecognizedType { key: String, declared: String },
    #[error("Parsing {value} to {target} failed. \n{reason}")]
    Parse {
        value: String,
        target: String,
        reason: String,
    },
    #[error("Invalid user arg '{0}', expected format: key:value")]
    InvalidPair(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Read { path: String, message: String },
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Terminal failure of one execution, carried by a failed `ExecutionOutcome`.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionError {
    #[error("Resolver failed to start sandbox: {message}")]
    Startup { message: String },
    #[error(
        "Resolver start-up timeout ({}s): {reason}\nMake sure you registered your resolver function correctly in your script.",
        secs(.timeout_ms)
    )]
    Connect { timeout_ms: u64, reason: String },
    #[error("Resolver exceeded execution timeout ({}s)", secs(.timeout_ms))]
    ExecutionTimeout { timeout_ms: u64 },
    #[error("Resolver sandbox exited with code={code}")]
    AbnormalExit { code: i64 },
    #[error("Resolver exited without returning result")]
    ExitedWithoutResult,
    #[error("Resolver error: {error}")]
    Script { error: ScriptError },
    #[error("Resolver execution was cancelled")]
    Cancelled,
}

fn secs(ms: &u64) -> f64 {
    *ms as f64 / 1000.0
}

impl ExecutionError {
    /// True when the failure comes from the sandbox runtime rather than the
    /// script or its limits.
    pub fn is_runtime_failure(&self) -> bool {
        matches!(
            self,
            ExecutionError::Startup { .. } | ExecutionError::Connect { .. }
        )
    }

    pub fn is_limit_violation(&self) -> bool {
        matches!(self, ExecutionError::ExecutionTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_carries_registration_hint() {
        let err = ExecutionError::Connect {
            timeout_ms: 10_000,
            reason: ChannelError::ConnectTimeout { timeout_ms: 10_000 }.to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("start-up timeout (10s)"));
        assert!(message.contains("registered your resolver function"));
        assert!(err.is_runtime_failure());
    }

    #[test]
    fn test_execution_error_serializes_with_kind_tag() {
        let err = ExecutionError::AbnormalExit { code: 7 };
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "abnormal_exit");
        assert_eq!(value["code"], 7);

        let decoded: ExecutionError = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, err);
    }

    #[test]
    fn test_timeout_message_in_seconds() {
        let err = ExecutionError::ExecutionTimeout { timeout_ms: 1500 };
        assert_eq!(err.to_string(), "Resolver exceeded execution timeout (1.5s)");
        assert!(err.is_limit_violation());
        assert!(!err.is_runtime_failure());
    }
}
