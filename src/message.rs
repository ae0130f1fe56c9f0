//! JSON-RPC 2.0 envelope model.
//!
//! This layer is pure data transformation: encode and decode between wire
//! frames and typed messages, with no I/O and no retry policy. A frame is
//! either a single message object or a batch array; batches decode to an
//! ordered sequence and an empty batch is a decode error.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Client-generated correlation token, unique per in-flight request on one
/// connection. Integers and strings are both legal on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Integer(id) => write!(f, "{id}"),
            RequestId::String(id) => write!(f, "{id}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Integer(id)
    }
}

impl From<i32> for RequestId {
    fn from(id: i32) -> Self {
        RequestId::Integer(id.into())
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

/// Structured error carried inside a response in place of a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MCP error {}: {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            let details = data
                .get("details")
                .and_then(|value| value.as_str())
                .map(|value| value.to_string())
                .or_else(|| data.as_str().map(|value| value.to_string()));
            if let Some(details) = details {
                if !details.is_empty() {
                    write!(f, " ({details})")?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Result<Value, RpcError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    pub fn response_ok(id: impl Into<RequestId>, result: Value) -> Self {
        Message::Response(Response {
            id: id.into(),
            outcome: Ok(result),
        })
    }

    pub fn response_err(id: impl Into<RequestId>, error: RpcError) -> Self {
        Message::Response(Response {
            id: id.into(),
            outcome: Err(error),
        })
    }

    fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("jsonrpc".to_string(), Value::String(JSONRPC_VERSION.to_string()));
        match self {
            Message::Request(request) => {
                map.insert("id".to_string(), id_value(&request.id));
                map.insert("method".to_string(), Value::String(request.method.clone()));
                if let Some(params) = &request.params {
                    map.insert("params".to_string(), params.clone());
                }
            }
            Message::Notification(notification) => {
                map.insert("method".to_string(), Value::String(notification.method.clone()));
                if let Some(params) = &notification.params {
                    map.insert("params".to_string(), params.clone());
                }
            }
            Message::Response(response) => {
                map.insert("id".to_string(), id_value(&response.id));
                match &response.outcome {
                    Ok(result) => {
                        map.insert("result".to_string(), result.clone());
                    }
                    Err(error) => {
                        let mut error_map = Map::new();
                        error_map.insert("code".to_string(), Value::from(error.code));
                        error_map.insert("message".to_string(), Value::String(error.message.clone()));
                        if let Some(data) = &error.data {
                            error_map.insert("data".to_string(), data.clone());
                        }
                        map.insert("error".to_string(), Value::Object(error_map));
                    }
                }
            }
        }
        Value::Object(map)
    }
}

fn id_value(id: &RequestId) -> Value {
    match id {
        RequestId::Integer(id) => Value::from(*id),
        RequestId::String(id) => Value::String(id.clone()),
    }
}

/// Serializes one message into its canonical single-line wire frame.
///
/// Field presence is deterministic: a response carries exactly one of
/// `result`/`error`, and a notification never carries `id`.
pub fn encode(message: &Message) -> String {
    message.to_value().to_string()
}

/// Serializes an ordered batch into one array frame.
pub fn encode_batch(messages: &[Message]) -> String {
    Value::Array(messages.iter().map(Message::to_value).collect()).to_string()
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("missing or mismatched jsonrpc version field")]
    VersionMismatch,
    #[error("message carries both result and error")]
    ConflictingOutcome,
    #[error("response carries no id")]
    MissingId,
    #[error("request id must be an integer or a string")]
    InvalidId,
    #[error("message is neither a request, a response, nor a notification")]
    UnknownShape,
    #[error("batch payload is empty")]
    EmptyBatch,
    #[error("failed to encode message payload: {0}")]
    Payload(String),
}

/// Decodes one wire frame into an ordered sequence of messages.
///
/// A single object yields a one-element sequence; a batch array preserves
/// array order. Decoding is deterministic and side-effect free.
pub fn decode(input: &str) -> Result<Vec<Message>, DecodeError> {
    let value: Value =
        serde_json::from_str(input).map_err(|err| DecodeError::InvalidJson(err.to_string()))?;
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(DecodeError::EmptyBatch);
            }
            items.into_iter().map(decode_object).collect()
        }
        other => Ok(vec![decode_object(other)?]),
    }
}

fn decode_object(value: Value) -> Result<Message, DecodeError> {
    let Value::Object(map) = value else {
        return Err(DecodeError::UnknownShape);
    };

    match map.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        _ => return Err(DecodeError::VersionMismatch),
    }

    let id = match map.get("id") {
        None | Some(Value::Null) => None,
        Some(value) => Some(decode_id(value)?),
    };

    if let Some(method) = map.get("method").and_then(Value::as_str) {
        let params = map.get("params").cloned();
        return Ok(match id {
            Some(id) => Message::Request(Request {
                id,
                method: method.to_string(),
                params,
            }),
            None => Message::Notification(Notification {
                method: method.to_string(),
                params,
            }),
        });
    }

    let has_result = map.contains_key("result");
    let error = map.get("error");
    if has_result && error.is_some() {
        return Err(DecodeError::ConflictingOutcome);
    }
    if has_result || error.is_some() {
        let id = id.ok_or(DecodeError::MissingId)?;
        let outcome = match error {
            Some(error) => Err(serde_json::from_value::<RpcError>(error.clone())
                .map_err(|err| DecodeError::InvalidJson(err.to_string()))?),
            None => Ok(map.get("result").cloned().unwrap_or(Value::Null)),
        };
        return Ok(Message::Response(Response { id, outcome }));
    }

    Err(DecodeError::UnknownShape)
}

fn decode_id(value: &Value) -> Result<RequestId, DecodeError> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .map(RequestId::Integer)
            .ok_or(DecodeError::InvalidId),
        Value::String(id) => Ok(RequestId::String(id.clone())),
        _ => Err(DecodeError::InvalidId),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(message: Message) {
        let frame = encode(&message);
        let decoded = decode(&frame).expect("frame should decode");
        assert_eq!(decoded, vec![message]);
    }

    #[test]
    fn round_trips_every_message_variant() {
        round_trip(Message::request(
            7,
            "tools/call",
            Some(json!({"name": "echo", "arguments": {"text": "hi"}})),
        ));
        round_trip(Message::request("req-1", "tools/list", None));
        round_trip(Message::response_ok(7, json!({"tools": []})));
        round_trip(Message::response_err(
            "req-1",
            RpcError::new(METHOD_NOT_FOUND, "Method not found: nope").with_data(json!({"details": "x"})),
        ));
        round_trip(Message::notification(
            "notifications/tools/list_changed",
            None,
        ));
        round_trip(Message::notification("notifications/progress", Some(json!({"progress": 3}))));
    }

    #[test]
    fn batch_round_trip_preserves_order() {
        let messages = vec![
            Message::request(1, "ping", None),
            Message::notification("notifications/initialized", None),
            Message::response_ok(0, json!({})),
        ];
        let frame = encode_batch(&messages);
        let decoded = decode(&frame).expect("batch should decode");
        assert_eq!(decoded, messages);
    }

    #[test]
    fn rejects_empty_batch() {
        assert_eq!(decode("[]"), Err(DecodeError::EmptyBatch));
    }

    #[test]
    fn rejects_result_and_error_together() {
        let frame = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {},
            "error": {"code": -32000, "message": "boom"}
        })
        .to_string();
        assert_eq!(decode(&frame), Err(DecodeError::ConflictingOutcome));
    }

    #[test]
    fn rejects_response_without_id() {
        let frame = json!({"jsonrpc": "2.0", "result": {}}).to_string();
        assert_eq!(decode(&frame), Err(DecodeError::MissingId));
        let frame = json!({"jsonrpc": "2.0", "id": null, "result": {}}).to_string();
        assert_eq!(decode(&frame), Err(DecodeError::MissingId));
    }

    #[test]
    fn rejects_missing_or_wrong_version() {
        let frame = json!({"id": 1, "method": "ping"}).to_string();
        assert_eq!(decode(&frame), Err(DecodeError::VersionMismatch));
        let frame = json!({"jsonrpc": "1.0", "id": 1, "method": "ping"}).to_string();
        assert_eq!(decode(&frame), Err(DecodeError::VersionMismatch));
    }

    #[test]
    fn rejects_invalid_json_and_shapes() {
        assert!(matches!(decode("not json"), Err(DecodeError::InvalidJson(_))));
        assert_eq!(decode("3"), Err(DecodeError::UnknownShape));
        let frame = json!({"jsonrpc": "2.0", "id": 1}).to_string();
        assert_eq!(decode(&frame), Err(DecodeError::UnknownShape));
        let frame = json!({"jsonrpc": "2.0", "id": 1.5, "method": "ping"}).to_string();
        assert_eq!(decode(&frame), Err(DecodeError::InvalidId));
    }

    #[test]
    fn notification_frame_never_carries_id() {
        let frame = encode(&Message::notification("notifications/initialized", None));
        let value: Value = serde_json::from_str(&frame).expect("frame is JSON");
        assert!(value.get("id").is_none());
    }

    #[test]
    fn null_result_decodes_as_success() {
        let frame = json!({"jsonrpc": "2.0", "id": 4, "result": null}).to_string();
        let decoded = decode(&frame).expect("frame should decode");
        assert_eq!(decoded, vec![Message::response_ok(4, Value::Null)]);
    }
}
