//! JSON-RPC frame construction and classification.
//!
//! The agent server speaks a JSON-RPC dialect without the `"jsonrpc"`
//! member: requests are `{id, method, params?}`, responses `{id, result}`
//! or `{id, error}`, notifications `{method, params?}`. Ids issued by the
//! client are positive integers.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::control::{ControlMessage, ControlProbe, probe_control};

/// Numeric request identifier.
pub type RequestId = u64;

/// Error code: the receiver does not handle the requested method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Error code: the handler failed while serving a server-initiated request.
pub const SERVER_ERROR: i64 = -32000;

/// Errors produced while classifying an incoming frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The text is not JSON.
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    /// The JSON is not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,
    /// The frame carries the control key but no known control message.
    #[error("malformed control message: {0}")]
    MalformedControl(String),
    /// An object that is neither a response, request nor notification.
    #[error("unrecognised frame shape")]
    Unrecognised,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A classified incoming frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// `__bridge` control message.
    Control(ControlMessage),
    /// Response to a request this side issued.
    Response {
        id: RequestId,
        outcome: Result<Value, RpcErrorObject>,
    },
    /// Request initiated by the peer; must be answered with the same id.
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    /// Fire-and-forget message from the peer.
    Notification {
        method: String,
        params: Option<Value>,
    },
}

/// Classifies one text frame.
///
/// Priority: control envelope, then response (`id` plus `result` or
/// `error`), then server request (`id` plus `method`), then notification
/// (`method` only).
///
/// # Errors
///
/// Returns a [`FrameError`] for text that is not JSON, not an object, a
/// malformed control envelope, or an object of no known shape.
pub fn classify(text: &str) -> Result<Incoming, FrameError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
    match probe_control(&value) {
        ControlProbe::Message(message) => return Ok(Incoming::Control(message)),
        ControlProbe::Malformed(reason) => return Err(FrameError::MalformedControl(reason)),
        ControlProbe::Absent => {}
    }
    let Value::Object(mut obj) = value else {
        return Err(FrameError::NotAnObject);
    };

    let id = obj.get("id").and_then(Value::as_u64);
    let method = obj
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let has_result = obj.contains_key("result");
    let has_error = obj.contains_key("error");

    if let Some(id) = id {
        if has_result || has_error {
            let outcome = if let Some(error) = obj.remove("error").filter(|_| !has_result) {
                Err(parse_error_object(error))
            } else {
                Ok(obj.remove("result").unwrap_or(Value::Null))
            };
            return Ok(Incoming::Response { id, outcome });
        }
        if let Some(method) = method {
            return Ok(Incoming::Request {
                id,
                method,
                params: obj.remove("params"),
            });
        }
    }
    match method {
        Some(method) => Ok(Incoming::Notification {
            method,
            params: obj.remove("params"),
        }),
        None => Err(FrameError::Unrecognised),
    }
}

fn parse_error_object(error: Value) -> RpcErrorObject {
    match serde_json::from_value::<RpcErrorObject>(error.clone()) {
        Ok(parsed) => parsed,
        Err(_) => RpcErrorObject {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(SERVER_ERROR),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), str::to_owned),
            data: None,
        },
    }
}

fn frame(entries: impl IntoIterator<Item = (&'static str, Value)>) -> String {
    let obj: Map<String, Value> = entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    Value::Object(obj).to_string()
}

/// Encodes a request frame.
#[must_use]
pub fn request_text(id: RequestId, method: &str, params: Option<Value>) -> String {
    let mut entries = vec![("id", Value::from(id)), ("method", Value::from(method))];
    if let Some(params) = params {
        entries.push(("params", params));
    }
    frame(entries)
}

/// Encodes a notification frame.
#[must_use]
pub fn notification_text(method: &str, params: Option<Value>) -> String {
    let mut entries = vec![("method", Value::from(method))];
    if let Some(params) = params {
        entries.push(("params", params));
    }
    frame(entries)
}

/// Encodes a successful response frame.
#[must_use]
pub fn result_text(id: RequestId, result: Value) -> String {
    frame([("id", Value::from(id)), ("result", result)])
}

/// Encodes an error response frame.
#[must_use]
pub fn error_text(id: RequestId, code: i64, message: &str) -> String {
    let error = serde_json::json!({ "code": code, "message": message });
    frame([("id", Value::from(id)), ("error", error)])
}
