//! Stratum v1 wire messages.
//!
//! Stratum predates JSON-RPC 2.0: there is no version field, notifications
//! carry `"id": null`, and errors are `[code, message, data]` arrays. Miners
//! are loose about ids (numbers, strings, null), so ids are kept as raw JSON
//! values and echoed back unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::share::RejectReason;

/// Error code for malformed requests and unknown methods.
pub const ERROR_OTHER: i64 = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request from a miner, or notification from the server
    Request {
        #[serde(default)]
        id: Value,
        method: String,
        #[serde(default)]
        params: Value,
    },

    /// Response; both fields are always written, one of them null
    Response {
        id: Value,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Value,
    },
}

impl JsonRpcMessage {
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: json!(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: Value::Null,
            method: method.into(),
            params,
        }
    }

    pub fn ok(id: Value, result: Value) -> Self {
        JsonRpcMessage::Response {
            id,
            result,
            error: Value::Null,
        }
    }

    pub fn error(id: Value, code: i64, message: &str) -> Self {
        JsonRpcMessage::Response {
            id,
            result: Value::Null,
            error: json!([code, message, null]),
        }
    }

    pub fn rejected(id: Value, reason: RejectReason) -> Self {
        Self::error(id, reason.error_code(), reason.as_ref())
    }

    pub fn id(&self) -> &Value {
        match self {
            JsonRpcMessage::Request { id, .. } | JsonRpcMessage::Response { id, .. } => id,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request { method, .. } => Some(method),
            JsonRpcMessage::Response { .. } => None,
        }
    }
}

/// Server-to-miner notification: difficulty.
pub fn set_difficulty(difficulty: f64) -> JsonRpcMessage {
    JsonRpcMessage::notification("mining.set_difficulty", json!([difficulty]))
}

/// A request decoded from a miner line.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRequest {
    pub id: Value,
    pub method: String,
    pub params: Vec<Value>,
}

impl ClientRequest {
    /// Decode one line. `None` when it is not a request object.
    pub fn parse(line: &str) -> Option<Self> {
        match serde_json::from_str::<JsonRpcMessage>(line).ok()? {
            JsonRpcMessage::Request { id, method, params } => {
                let params = match params {
                    Value::Array(values) => values,
                    Value::Null => Vec::new(),
                    other => vec![other],
                };
                Some(ClientRequest { id, method, params })
            }
            JsonRpcMessage::Response { .. } => None,
        }
    }

    /// Positional string parameter.
    pub fn str_param(&self, index: usize) -> Option<&str> {
        self.params.get(index).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_writes_result_and_error() {
        let msg = JsonRpcMessage::ok(json!(1), json!(true));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"id": 1, "result": true, "error": null})
        );

        let msg = JsonRpcMessage::rejected(json!("a"), RejectReason::DuplicateShare);
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"id": "a", "result": null, "error": [22, "duplicate_share", null]})
        );
    }

    #[test]
    fn test_notification_has_null_id() {
        let msg = set_difficulty(512.0);
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"id": null, "method": "mining.set_difficulty", "params": [512.0]})
        );
    }

    #[test]
    fn test_parse_request_with_any_id() {
        let req = ClientRequest::parse(
            r#"{"id":"7","method":"mining.subscribe","params":["cgminer/4.11"]}"#,
        )
        .unwrap();
        assert_eq!(req.id, json!("7"));
        assert_eq!(req.method, "mining.subscribe");
        assert_eq!(req.str_param(0), Some("cgminer/4.11"));

        let req = ClientRequest::parse(r#"{"id":3,"method":"mining.extranonce.subscribe"}"#)
            .unwrap();
        assert!(req.params.is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ClientRequest::parse("not json").is_none());
        assert!(ClientRequest::parse(r#"{"id":1,"result":true,"error":null}"#).is_none());
        assert!(ClientRequest::parse("[1,2,3]").is_none());
    }

    #[test]
    fn test_client_side_decodes_response() {
        let msg: JsonRpcMessage =
            serde_json::from_str(r#"{"id":2,"result":null,"error":[23,"low_difficulty_share",null]}"#)
                .unwrap();
        match msg {
            JsonRpcMessage::Response { id, error, .. } => {
                assert_eq!(id, json!(2));
                assert_eq!(error[0], json!(23));
            }
            other => panic!("expected response, got {:?}", other),
        }
    }
}
