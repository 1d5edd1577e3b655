//! Events exchanged over the control channel
//!
//! On the wire every event is `{"action": <tag>, "data": {...}}`. Decoding goes
//! through [`WireEvent`] first so that an unrecognised action can be reported
//! and skipped instead of failing the whole exchange.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ExecutionContext, RpcCallStats, ScriptError, StorageUpdate};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "lowercase")]
pub enum IpcEvent {
    /// Host to sandbox: begin execution with this context.
    Start { context: ExecutionContext },
    /// Sandbox to host: the script returned a value.
    #[serde(rename_all = "camelCase")]
    Result {
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        storage: Option<StorageUpdate>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rpc_calls: Option<RpcCallStats>,
    },
    /// Sandbox to host: the script failed.
    Error { error: ScriptError },
}

impl IpcEvent {
    pub fn start(context: ExecutionContext) -> Self {
        IpcEvent::Start { context }
    }

    pub fn result(result: Value) -> Self {
        IpcEvent::Result {
            result,
            storage: None,
            rpc_calls: None,
        }
    }

    pub fn error(error: ScriptError) -> Self {
        IpcEvent::Error { error }
    }

    pub fn action(&self) -> &'static str {
        match self {
            IpcEvent::Start { .. } => "start",
            IpcEvent::Result { .. } => "result",
            IpcEvent::Error { .. } => "error",
        }
    }
}

/// Untyped envelope of an inbound event.
#[derive(Debug, Clone, Deserialize)]
pub struct WireEvent {
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

/// Outcome of decoding one inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(IpcEvent),
    Unknown(String),
}

const KNOWN_ACTIONS: [&str; 3] = ["start", "result", "error"];

pub fn decode_event(body: &[u8]) -> Result<Decoded, serde_json::Error> {
    let wire: WireEvent = serde_json::from_slice(body)?;
    if !KNOWN_ACTIONS.contains(&wire.action.as_str()) {
        return Ok(Decoded::Unknown(wire.action));
    }
    let event = serde_json::from_value(serde_json::json!({
        "action": wire.action,
        "data": wire.data,
    }))?;
    Ok(Decoded::Event(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChainArgs, StorageState};
    use serde_json::json;

    #[test]
    fn test_start_event_wire_shape() {
        let context = ExecutionContext::new(ChainArgs {
            chain_id: 1,
            block_time: 10,
            gas_price: "1".to_string(),
            task_id: Some("0xabc".to_string()),
        });
        let value = serde_json::to_value(IpcEvent::start(context)).unwrap();
        assert_eq!(value["action"], "start");
        assert_eq!(value["data"]["context"]["chainArgs"]["taskId"], "0xabc");
    }

    #[test]
    fn test_decode_result_with_telemetry() {
        let body = json!({
            "action": "result",
            "data": {
                "result": {"canExec": false, "message": "Waiting..."},
                "storage": {"state": "updated", "storage": {"count": "2"}},
                "rpcCalls": {"total": 4, "throttled": 1}
            }
        });
        let decoded = decode_event(body.to_string().as_bytes()).unwrap();
        let Decoded::Event(IpcEvent::Result { result, storage, rpc_calls }) = decoded else {
            panic!("expected result event, got {:?}", decoded);
        };
        assert_eq!(result["message"], "Waiting...");
        let storage = storage.unwrap();
        assert_eq!(storage.state, StorageState::Updated);
        assert_eq!(storage.storage["count"].as_deref(), Some("2"));
        assert_eq!(rpc_calls, Some(RpcCallStats { total: 4, throttled: 1 }));
    }

    #[test]
    fn test_decode_error_event() {
        let body = br#"{"action": "error", "data": {"error": {"name": "TypeError", "message": "boom"}}}"#;
        let decoded = decode_event(body).unwrap();
        assert_eq!(
            decoded,
            Decoded::Event(IpcEvent::Error {
                error: ScriptError {
                    name: Some("TypeError".to_string()),
                    message: "boom".to_string()
                }
            })
        );
    }

    #[test]
    fn test_unknown_action_is_not_an_error() {
        let decoded = decode_event(br#"{"action": "log", "data": {"line": "hi"}}"#).unwrap();
        assert_eq!(decoded, Decoded::Unknown("log".to_string()));
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        assert!(decode_event(b"not json").is_err());
        assert!(decode_event(br#"{"action": "result", "data": {}}"#).is_err());
    }
}
