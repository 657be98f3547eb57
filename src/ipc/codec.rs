//! JSON-RPC message codec.
//!
//! Incoming frames are classified by shape rather than by a type tag:
//!
//! | `id` | `method` | variant        |
//! |------|----------|----------------|
//! | yes  | yes      | `Request`      |
//! | yes  | no       | `Response`     |
//! | no   | yes      | `Notification` |
//!
//! Payloads stay schema-less (`serde_json::Value`); interpreting them is the
//! job of whoever registered for the method.

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::framing::{frame_body, truncate, Frame};

/// Correlation id linking a request to its response.
pub type RequestId = i64;

/// Longest payload excerpt carried by a [`DecodeError`].
pub const PREVIEW_LEN: usize = 200;

const JSONRPC_VERSION: &str = "2.0";

/// Error object returned by the backend in place of a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("RPC error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: Self::METHOD_NOT_FOUND,
            message: "Method not found".to_string(),
            data: Some(serde_json::json!({ "method": method })),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Outcome of a request as reported by the backend.
pub type Reply = Result<Value, RpcError>;

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    Response {
        id: RequestId,
        result: Reply,
    },
    Notification {
        method: String,
        params: Value,
    },
}

impl Message {
    pub fn request(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Message::Request {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Message::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn response(id: RequestId, result: Reply) -> Self {
        Message::Response { id, result }
    }

    pub fn id(&self) -> Option<RequestId> {
        match self {
            Message::Request { id, .. } | Message::Response { id, .. } => Some(*id),
            Message::Notification { .. } => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => {
                Some(method.as_str())
            }
            Message::Response { .. } => None,
        }
    }
}

/// What was wrong with an undecodable frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// Not a JSON object, or a field has the wrong type.
    Malformed,
    /// `id` is present but not an integer.
    InvalidId,
    /// Neither `id` nor `method` is present.
    Unclassifiable,
    /// A response carries both `result` and `error`.
    AmbiguousOutcome,
    /// A response carries neither `result` nor `error`.
    MissingOutcome,
}

/// A frame that could not be decoded. The engine drops it and moves on.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{reason} (payload: {preview:?})")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub reason: String,
    /// Leading part of the offending payload, at most [`PREVIEW_LEN`] chars.
    pub preview: String,
}

impl DecodeError {
    fn new(kind: DecodeErrorKind, reason: impl Into<String>, payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload);
        Self {
            kind,
            reason: reason.into(),
            preview: truncate(&text, PREVIEW_LEN).to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A successful result did not have the shape the caller asked for.
    #[error("Unexpected result for {method}: {source}")]
    ResultShape {
        method: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Incoming wire shape. `id` and `result` keep an explicit `null` as
/// `Some(Value::Null)` so presence can be told apart from absence.
#[derive(Deserialize)]
struct RawMessage {
    #[serde(default, deserialize_with = "present")]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Serialize)]
struct WireMessage<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a RpcError>,
}

impl<'a> From<&'a Message> for WireMessage<'a> {
    fn from(message: &'a Message) -> Self {
        let mut wire = WireMessage {
            jsonrpc: JSONRPC_VERSION,
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        };
        match message {
            Message::Request { id, method, params } => {
                wire.id = Some(*id);
                wire.method = Some(method.as_str());
                wire.params = Some(params).filter(|p| !p.is_null());
            }
            Message::Response { id, result } => {
                wire.id = Some(*id);
                match result {
                    Ok(value) => wire.result = Some(value),
                    Err(error) => wire.error = Some(error),
                }
            }
            Message::Notification { method, params } => {
                wire.method = Some(method.as_str());
                wire.params = Some(params).filter(|p| !p.is_null());
            }
        }
        wire
    }
}

/// Decode one frame body into a [`Message`].
pub fn decode(frame: &Frame) -> Result<Message, DecodeError> {
    let payload = frame.as_bytes();
    let raw: RawMessage = serde_json::from_slice(payload).map_err(|e| {
        DecodeError::new(
            DecodeErrorKind::Malformed,
            format!("invalid message: {}", e),
            payload,
        )
    })?;

    let id = match raw.id {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.as_i64().ok_or_else(|| {
            DecodeError::new(
                DecodeErrorKind::InvalidId,
                format!("id is not an integer: {}", value),
                payload,
            )
        })?),
    };
    let params = raw.params.unwrap_or(Value::Null);

    match (id, raw.method) {
        (Some(id), Some(method)) => Ok(Message::Request { id, method, params }),
        (None, Some(method)) => Ok(Message::Notification { method, params }),
        (Some(id), None) => {
            let result = match (raw.result, raw.error) {
                (Some(value), None) => Ok(value),
                (None, Some(error)) => Err(error),
                (Some(_), Some(_)) => {
                    return Err(DecodeError::new(
                        DecodeErrorKind::AmbiguousOutcome,
                        format!("response {} has both result and error", id),
                        payload,
                    ))
                }
                (None, None) => {
                    return Err(DecodeError::new(
                        DecodeErrorKind::MissingOutcome,
                        format!("response {} has neither result nor error", id),
                        payload,
                    ))
                }
            };
            Ok(Message::Response { id, result })
        }
        (None, None) => Err(DecodeError::new(
            DecodeErrorKind::Unclassifiable,
            "message has neither id nor method",
            payload,
        )),
    }
}

/// Serialize `message` and wrap it in its Content-Length header.
pub fn encode(message: &Message) -> Result<Bytes, CodecError> {
    let body = serde_json::to_vec(&WireMessage::from(message))?;
    Ok(frame_body(&body))
}
