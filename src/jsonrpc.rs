//! JSON-RPC 2.0 message model: classification, ids, error objects and
//! response builders.
//!
//! The proxy never interprets method payloads; it routes whole messages. This
//! module therefore works on pre-parsed `serde_json::Value` trees and only
//! extracts the envelope fields (`jsonrpc`, `id`, `method`).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

/// Error codes used on the wire.
///
/// The -327xx range is standard JSON-RPC 2.0; the -320xx range is
/// proxy-specific.
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const UNAUTHORIZED: i32 = -32001;
pub const RATE_LIMITED: i32 = -32002;
pub const UPSTREAM_TRANSPORT_ERROR: i32 = -32010;
pub const UPSTREAM_TIMEOUT: i32 = -32011;

/// JSON-RPC 2.0 request id.
///
/// Ids are either strings or integers. The original type must be preserved
/// end to end: a client that sends `"id": 1` must get a response with
/// `"id": 1`, never `"id": "1"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JsonRpcId {
    Number(i64),
    String(String),
}

impl JsonRpcId {
    /// Render the id as a JSON value for embedding in a response object.
    pub fn to_value(&self) -> Value {
        match self {
            JsonRpcId::Number(n) => json!(n),
            JsonRpcId::String(s) => json!(s),
        }
    }
}

impl std::fmt::Display for JsonRpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JsonRpcId::Number(n) => write!(f, "{n}"),
            JsonRpcId::String(s) => write!(f, "{s}"),
        }
    }
}

impl Serialize for JsonRpcId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JsonRpcId::Number(n) => serializer.serialize_i64(*n),
            JsonRpcId::String(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        parse_id(&value).ok_or_else(|| {
            serde::de::Error::custom("JSON-RPC id must be a string or an integer")
        })
    }
}

/// Message classification, determined by presence of `id` and `method`:
/// request has both, response has only `id`, notification has only `method`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Request { id: JsonRpcId, method: String },
    Response { id: JsonRpcId },
    Notification { method: String },
}

/// Errors from [`classify`].
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    /// The `jsonrpc` field is missing or not `"2.0"`.
    #[error("missing or invalid jsonrpc version field")]
    InvalidVersion,
    /// The `id` field is present but not a string or integer.
    #[error("invalid id field")]
    InvalidId,
    /// Neither `id` nor `method` is present.
    #[error("message has neither id nor method")]
    Unclassifiable,
}

/// Classify a parsed JSON-RPC value without taking ownership.
pub fn classify(value: &Value) -> Result<MessageKind, ClassifyError> {
    let version = value.get("jsonrpc").and_then(Value::as_str);
    if version != Some("2.0") {
        return Err(ClassifyError::InvalidVersion);
    }

    let id = match value.get("id") {
        Some(raw) => Some(parse_id(raw).ok_or(ClassifyError::InvalidId)?),
        None => None,
    };
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .map(String::from);

    match (id, method) {
        (Some(id), Some(method)) => Ok(MessageKind::Request { id, method }),
        (Some(id), None) => Ok(MessageKind::Response { id }),
        (None, Some(method)) => Ok(MessageKind::Notification { method }),
        (None, None) => Err(ClassifyError::Unclassifiable),
    }
}

/// Best-effort id extraction from a raw value, for error replies to messages
/// that failed classification.
pub fn raw_id(value: &Value) -> Option<JsonRpcId> {
    value.get("id").and_then(parse_id)
}

fn parse_id(value: &Value) -> Option<JsonRpcId> {
    match value {
        // Float ids are invalid per JSON-RPC 2.0.
        Value::Number(n) => n.as_i64().map(JsonRpcId::Number),
        Value::String(s) => Some(JsonRpcId::String(s.clone())),
        _ => None,
    }
}

/// JSON-RPC 2.0 error object as carried in a response.
///
/// Upstream-produced errors are relayed through this type verbatim,
/// including their `data` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Parse an upstream `error` value, falling back to a generic shape when
    /// the object is malformed.
    pub fn from_wire(error: &Value) -> Self {
        let code = error
            .get("code")
            .and_then(Value::as_i64)
            .map_or(INTERNAL_ERROR, |c| c as i32);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Upstream error")
            .to_string();
        Self {
            code,
            message,
            data: error.get("data").cloned(),
        }
    }

    fn to_wire(&self) -> Value {
        let mut obj = json!({"code": self.code, "message": self.message});
        if let Some(data) = &self.data {
            obj["data"] = data.clone();
        }
        obj
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Build a success response echoing the request id.
pub fn result_response(id: &JsonRpcId, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id.to_value(), "result": result})
}

/// Build an error response. A `None` id serializes as `"id": null`, used
/// when the offending message could not be parsed far enough to recover one.
pub fn error_response(id: Option<&JsonRpcId>, error: &RpcError) -> Value {
    let id_value = id.map_or(Value::Null, JsonRpcId::to_value);
    json!({"jsonrpc": "2.0", "id": id_value, "error": error.to_wire()})
}

/// Build a request with an integer id, as allocated per upstream.
pub fn request_message(id: i64, method: &str, params: Option<Value>) -> Value {
    let mut message = json!({"jsonrpc": "2.0", "id": id, "method": method});
    if let Some(params) = params {
        message["params"] = params;
    }
    message
}

/// Build a notification (no id, no response expected).
pub fn notification_message(method: &str, params: Option<Value>) -> Value {
    let mut message = json!({"jsonrpc": "2.0", "method": method});
    if let Some(params) = params {
        message["params"] = params;
    }
    message
}
