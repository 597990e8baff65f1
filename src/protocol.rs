//! JSON-RPC 2.0 wire types for the XBMC API.
//!
//! Outgoing traffic is always a request with an `id`. Incoming traffic is
//! either a reply (carries the `id` of a request) or a server-pushed
//! notification (carries a `method`, never an `id`):
//!
//! ```text
//! -> {"jsonrpc":"2.0","method":"JSONRPC.Ping","params":{},"id":7}
//! <- {"jsonrpc":"2.0","id":7,"result":"pong"}
//! <- {"jsonrpc":"2.0","method":"Player.OnPlay","params":{"data":{...},"sender":"xbmc"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Protocol version sent with every request.
pub const JSONRPC_VERSION: &str = "2.0";

/// Reserved no-op method used as the liveness probe.
pub const PING_METHOD: &str = "JSONRPC.Ping";

/// Expected result of [`PING_METHOD`].
pub const PING_REPLY: &str = "pong";

/// Method-catalogue discovery call.
pub const INTROSPECT_METHOD: &str = "JSONRPC.introspect";

/// Property query used to emulate volume notifications over HTTP.
pub const GET_PROPERTIES_METHOD: &str = "Application.GetProperties";

/// Notification raised when volume or mute state changes.
pub const VOLUME_CHANGED: &str = "Application.OnVolumeChanged";

/// An outgoing JSON-RPC 2.0 request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }

    /// Serialize to the text frame sent over the transport.
    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// The error object of a failed reply, propagated verbatim to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Reply to a request we sent.
    Reply {
        id: u64,
        outcome: Result<Value, JsonRpcError>,
    },
    /// Server-pushed event, dispatched by name.
    Notification { method: String, data: Value },
}

/// Wire-level failures. Inbound ones never reach a caller because they
/// cannot be correlated to a request.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Failed to encode request: {0}")]
    Encode(String),
}

/// Decode one inbound text frame.
///
/// A frame with an `id` is a reply; an `error` object takes precedence over
/// `result`. A frame with a `method` and no `id` is a notification whose
/// payload is `params.data`.
pub fn parse_incoming(frame: &str) -> Result<Incoming, ProtocolError> {
    let json: Value =
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    if !json.is_object() {
        return Err(ProtocolError::Malformed("frame is not an object".to_string()));
    }

    match json.get("id") {
        Some(Value::Null) | None => {}
        Some(id_value) => {
            let id = id_value
                .as_u64()
                .ok_or_else(|| ProtocolError::Malformed(format!("unusable id {}", id_value)))?;

            let outcome = match json.get("error") {
                Some(error) if error.is_object() => {
                    let error: JsonRpcError = serde_json::from_value(error.clone())
                        .unwrap_or_else(|_| JsonRpcError {
                            code: error.get("code").and_then(Value::as_i64).unwrap_or(-1),
                            message: error
                                .get("message")
                                .and_then(Value::as_str)
                                .unwrap_or("Unknown error")
                                .to_string(),
                            data: error.get("data").cloned(),
                        });
                    Err(error)
                }
                _ => Ok(json.get("result").cloned().unwrap_or(Value::Null)),
            };

            return Ok(Incoming::Reply { id, outcome });
        }
    }

    if let Some(method) = json.get("method").and_then(Value::as_str) {
        let data = json
            .get("params")
            .and_then(|p| p.get("data"))
            .cloned()
            .unwrap_or(Value::Null);
        return Ok(Incoming::Notification {
            method: method.to_string(),
            data,
        });
    }

    Err(ProtocolError::Malformed(
        "frame has neither id nor method".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_frame_shape() {
        let request = JsonRpcRequest::new("Foo.Bar", json!({"x": 1}), 3);
        let frame: Value = serde_json::from_str(&request.to_frame().unwrap()).unwrap();
        assert_eq!(
            frame,
            json!({"jsonrpc": "2.0", "method": "Foo.Bar", "params": {"x": 1}, "id": 3})
        );
    }

    #[test]
    fn test_parse_success_reply() {
        let incoming = parse_incoming(r#"{"jsonrpc":"2.0","id":4,"result":42}"#).unwrap();
        assert_eq!(
            incoming,
            Incoming::Reply {
                id: 4,
                outcome: Ok(json!(42))
            }
        );
    }

    #[test]
    fn test_parse_error_reply_wins_over_result() {
        let incoming = parse_incoming(
            r#"{"id":9,"result":1,"error":{"code":-32601,"message":"Method not found."}}"#,
        )
        .unwrap();
        match incoming {
            Incoming::Reply { id, outcome } => {
                assert_eq!(id, 9);
                let err = outcome.unwrap_err();
                assert_eq!(err.code, -32601);
                assert_eq!(err.message, "Method not found.");
                assert!(err.data.is_none());
            }
            other => panic!("Expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_reply_with_partial_object() {
        let incoming = parse_incoming(r#"{"id":2,"error":{"message":"boom"}}"#).unwrap();
        match incoming {
            Incoming::Reply { outcome, .. } => {
                let err = outcome.unwrap_err();
                assert_eq!(err.code, -1);
                assert_eq!(err.message, "boom");
            }
            other => panic!("Expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_reply_without_result_is_null() {
        let incoming = parse_incoming(r#"{"id":5}"#).unwrap();
        assert_eq!(
            incoming,
            Incoming::Reply {
                id: 5,
                outcome: Ok(Value::Null)
            }
        );
    }

    #[test]
    fn test_parse_notification_extracts_data() {
        let incoming = parse_incoming(
            r#"{"jsonrpc":"2.0","method":"Player.OnPlay","params":{"data":{"item":{}},"sender":"xbmc"}}"#,
        )
        .unwrap();
        assert_eq!(
            incoming,
            Incoming::Notification {
                method: "Player.OnPlay".to_string(),
                data: json!({"item": {}}),
            }
        );
    }

    #[test]
    fn test_parse_notification_without_params() {
        let incoming = parse_incoming(r#"{"method":"System.OnQuit"}"#).unwrap();
        assert_eq!(
            incoming,
            Incoming::Notification {
                method: "System.OnQuit".to_string(),
                data: Value::Null,
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_incoming("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            parse_incoming("[1,2]"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            parse_incoming(r#"{"result":1}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            parse_incoming(r#"{"id":"abc","result":1}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
