//! Data model shared by the host and the sandboxed script
//!
//! Everything here crosses the process boundary as JSON, so field names follow
//! the camelCase wire convention of the control channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::errors::ExecutionError;
use crate::schema::ResolverSchema;

/// Typed user arguments, produced by `validate_user_args`.
pub type UserArgs = BTreeMap<String, Value>;

/// Key-value mapping where a key may be present without a value.
pub type OptionalStringMap = BTreeMap<String, Option<String>>;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Blockchain arguments delivered to every execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainArgs {
    pub chain_id: u64,
    /// Block timestamp in seconds.
    pub block_time: u64,
    pub gas_price: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// Immutable payload shipped once into the sandbox with the `start` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub chain_args: ChainArgs,
    #[serde(default)]
    pub user_args: UserArgs,
    #[serde(default)]
    pub secrets: OptionalStringMap,
    #[serde(default)]
    pub storage: OptionalStringMap,
}

impl ExecutionContext {
    pub fn new(chain_args: ChainArgs) -> Self {
        Self {
            chain_args,
            user_args: UserArgs::new(),
            secrets: OptionalStringMap::new(),
            storage: OptionalStringMap::new(),
        }
    }

    pub fn with_user_args(mut self, user_args: UserArgs) -> Self {
        self.user_args = user_args;
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        self.secrets.insert(key.into(), value);
        self
    }

    pub fn with_storage(mut self, storage: OptionalStringMap) -> Self {
        self.storage = storage;
        self
    }
}

/// Isolation backend selected for an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    #[serde(alias = "docker")]
    Container,
    Thread,
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeKind::Container => write!(f, "container"),
            RuntimeKind::Thread => write!(f, "thread"),
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "container" | "docker" => Ok(RuntimeKind::Container),
            "thread" => Ok(RuntimeKind::Thread),
            other => Err(format!("Unknown runtime '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOptions {
    /// Memory ceiling in bytes handed to the isolation backend.
    pub memory: u64,
    /// Execution deadline in milliseconds.
    pub timeout: u64,
    #[serde(default)]
    pub runtime: RuntimeKind,
    #[serde(default)]
    pub show_logs: bool,
    /// Control port; an ephemeral port is leased when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
}

impl ExecutionOptions {
    pub fn new(runtime: RuntimeKind, memory: u64, timeout: Duration) -> Self {
        Self {
            memory,
            timeout: timeout.as_millis() as u64,
            runtime,
            show_logs: false,
            server_port: None,
        }
    }

    /// Limits taken from a built resolver's schema (megabytes and seconds).
    pub fn from_schema(schema: &ResolverSchema, runtime: RuntimeKind) -> Self {
        Self::new(
            runtime,
            schema.memory * 1024 * 1024,
            Duration::from_secs(schema.timeout),
        )
    }

    pub fn with_show_logs(mut self, show_logs: bool) -> Self {
        self.show_logs = show_logs;
        self
    }

    pub fn with_server_port(mut self, port: u16) -> Self {
        self.server_port = Some(port);
        self
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

/// Input to `Runner::run`: the built script handle, its context and limits.
#[derive(Debug, Clone)]
pub struct RunnerPayload {
    pub script: String,
    pub context: ExecutionContext,
    pub options: ExecutionOptions,
}

impl RunnerPayload {
    pub fn new(script: impl Into<String>, context: ExecutionContext, options: ExecutionOptions) -> Self {
        Self {
            script: script.into(),
            context,
            options,
        }
    }
}

/// Structured error reported by the script through an `error` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub message: String,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", name, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageState {
    /// Storage left untouched by the script.
    #[default]
    Last,
    Updated,
}

/// Storage as reported back by the script in its `result` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StorageUpdate {
    pub state: StorageState,
    #[serde(default)]
    pub storage: OptionalStringMap,
}

impl StorageUpdate {
    pub fn unchanged(storage: OptionalStringMap) -> Self {
        Self {
            state: StorageState::Last,
            storage,
        }
    }

    pub fn updated(storage: OptionalStringMap) -> Self {
        Self {
            state: StorageState::Updated,
            storage,
        }
    }
}

/// RPC call counters reported by the provider proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RpcCallStats {
    pub total: u64,
    pub throttled: u64,
}

/// Terminal result of one `run`, with its telemetry.
///
/// Exactly one of `result` and `error` is populated; `duration` (seconds) and
/// `memory` (megabytes) are always present.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ExecutionError>,
    pub duration: f64,
    pub memory: f64,
    pub logs: Vec<String>,
    pub storage: StorageUpdate,
    pub rpc_calls: RpcCallStats,
}

impl ExecutionOutcome {
    pub fn success(result: Value, duration: Duration, peak_memory_bytes: u64) -> Self {
        Self::build(Some(result), None, duration, peak_memory_bytes)
    }

    pub fn failure(error: ExecutionError, duration: Duration, peak_memory_bytes: u64) -> Self {
        Self::build(None, Some(error), duration, peak_memory_bytes)
    }

    fn build(
        result: Option<Value>,
        error: Option<ExecutionError>,
        duration: Duration,
        peak_memory_bytes: u64,
    ) -> Self {
        Self {
            success: error.is_none(),
            result,
            error,
            duration: duration.as_secs_f64(),
            memory: peak_memory_bytes as f64 / BYTES_PER_MB,
            logs: Vec::new(),
            storage: StorageUpdate::default(),
            rpc_calls: RpcCallStats::default(),
        }
    }

    pub fn with_logs(mut self, logs: Vec<String>) -> Self {
        self.logs = logs;
        self
    }

    pub fn with_storage(mut self, storage: StorageUpdate) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_rpc_calls(mut self, rpc_calls: RpcCallStats) -> Self {
        self.rpc_calls = rpc_calls;
        self
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&ExecutionError> {
        self.error.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain_args() -> ChainArgs {
        ChainArgs {
            chain_id: 5,
            block_time: 1_700_000_000,
            gas_price: "10".to_string(),
            task_id: None,
        }
    }

    #[test]
    fn test_context_wire_format_is_camel_case() {
        let context = ExecutionContext::new(chain_args())
            .with_secret("API_KEY", Some("secret".to_string()))
            .with_secret("EMPTY", None);
        let value = serde_json::to_value(&context).unwrap();

        assert_eq!(value["chainArgs"]["chainId"], 5);
        assert_eq!(value["chainArgs"]["gasPrice"], "10");
        assert!(value["chainArgs"].get("taskId").is_none());
        assert_eq!(value["secrets"]["API_KEY"], "secret");
        assert!(value["secrets"]["EMPTY"].is_null());
    }

    #[test]
    fn test_runtime_kind_accepts_docker_alias() {
        let kind: RuntimeKind = serde_json::from_value(json!("docker")).unwrap();
        assert_eq!(kind, RuntimeKind::Container);
        assert_eq!("thread".parse::<RuntimeKind>().unwrap(), RuntimeKind::Thread);
        assert!("vm".parse::<RuntimeKind>().is_err());
    }

    #[test]
    fn test_options_from_schema_converts_units() {
        let schema = ResolverSchema {
            memory: 128,
            timeout: 30,
            user_args: Default::default(),
            rpc_limit: None,
        };
        let options = ExecutionOptions::from_schema(&schema, RuntimeKind::Thread);
        assert_eq!(options.memory, 128 * 1024 * 1024);
        assert_eq!(options.timeout, 30_000);
        assert_eq!(options.timeout_duration(), Duration::from_secs(30));
        assert!(options.server_port.is_none());
    }

    #[test]
    fn test_outcome_populates_exactly_one_side() {
        let ok = ExecutionOutcome::success(json!({"canExec": true}), Duration::from_millis(1500), 2 * 1024 * 1024);
        assert!(ok.is_success());
        assert!(ok.result().is_some() && ok.error().is_none());
        assert_eq!(ok.duration, 1.5);
        assert_eq!(ok.memory, 2.0);

        let ko = ExecutionOutcome::failure(ExecutionError::ExitedWithoutResult, Duration::ZERO, 0);
        assert!(!ko.is_success());
        assert!(ko.result().is_none() && ko.error().is_some());

        let value = serde_json::to_value(&ko).unwrap();
        assert_eq!(value["success"], false);
        assert!(value.get("result").is_none());
        assert_eq!(value["error"]["kind"], "exited_without_result");
        assert_eq!(value["rpcCalls"]["total"], 0);
    }
}
