//! JSON-RPC 2.0 message model.
//!
//! Parsing a frame payload into a [`Message`] is a pure step separate from
//! framing: the codec only guarantees byte boundaries, this module checks the
//! JSON-RPC shape.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::Frame;
use crate::error::LspError;

const JSONRPC_VERSION: &str = "2.0";

/// Request identifier. Clients in this crate always issue numbers; servers
/// often use strings for their own requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

/// JSON-RPC error object reported by the server, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("server error {code}: {message}")]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RemoteError {
    /// JSON-RPC "method not found".
    pub const METHOD_NOT_FOUND: i64 = -32601;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Exactly one of `result` or `error`.
///
/// A `null` result is kept as `Value::Null`, distinct from an empty array.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Result(Value),
    Error(RemoteError),
}

impl ResponsePayload {
    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self {
            Self::Result(value) => Ok(value),
            Self::Error(err) => Err(err),
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

/// `id` is `None` only when the server answered with `"id": null`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Option<RequestId>,
    pub payload: ResponsePayload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// A decoded JSON-RPC unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

#[derive(Serialize)]
struct WireRequest<'a> {
    jsonrpc: &'static str,
    id: &'a RequestId,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

#[derive(Serialize)]
struct WireNotification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

#[derive(Serialize)]
struct WireResponse<'a> {
    jsonrpc: &'static str,
    id: Option<&'a RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a RemoteError>,
}

impl Message {
    pub fn request(
        id: impl Into<RequestId>,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Self {
        Self::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    pub fn response(id: RequestId, payload: ResponsePayload) -> Self {
        Self::Response(Response {
            id: Some(id),
            payload,
        })
    }

    /// Parse a frame payload.
    pub fn parse(payload: &[u8]) -> Result<Self, LspError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| LspError::InvalidPayload(format!("not JSON: {e}")))?;
        let Value::Object(obj) = value else {
            return Err(LspError::InvalidPayload(
                "expected a JSON object".to_string(),
            ));
        };
        Self::from_object(obj)
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, LspError> {
        Self::parse(frame.payload())
    }

    fn from_object(mut obj: Map<String, Value>) -> Result<Self, LspError> {
        match obj.get("jsonrpc") {
            Some(Value::String(version)) if version == JSONRPC_VERSION => {}
            Some(other) => {
                return Err(LspError::InvalidPayload(format!(
                    "unsupported jsonrpc version {other}"
                )));
            }
            None => return Err(LspError::InvalidPayload("missing `jsonrpc`".to_string())),
        }

        let id = obj.remove("id");
        let method = obj.remove("method");
        let params = obj.remove("params");

        match (method, id) {
            (Some(method), Some(id)) => Ok(Self::Request(Request {
                id: parse_id(id)?,
                method: parse_method(method)?,
                params,
            })),
            (Some(method), None) => Ok(Self::Notification(Notification {
                method: parse_method(method)?,
                params,
            })),
            (None, Some(id)) => {
                let id = match id {
                    Value::Null => None,
                    other => Some(parse_id(other)?),
                };
                let payload = match (obj.remove("result"), obj.remove("error")) {
                    (Some(result), None) => ResponsePayload::Result(result),
                    (None, Some(error)) => {
                        ResponsePayload::Error(serde_json::from_value(error).map_err(|e| {
                            LspError::InvalidPayload(format!("bad error object: {e}"))
                        })?)
                    }
                    (Some(_), Some(_)) => {
                        return Err(LspError::InvalidPayload(
                            "response carries both `result` and `error`".to_string(),
                        ));
                    }
                    (None, None) => {
                        return Err(LspError::InvalidPayload(
                            "response carries neither `result` nor `error`".to_string(),
                        ));
                    }
                };
                Ok(Self::Response(Response { id, payload }))
            }
            (None, None) => Err(LspError::InvalidPayload(
                "missing both `id` and `method`".to_string(),
            )),
        }
    }

    /// Serialize to the JSON-RPC 2.0 wire shape.
    pub fn to_bytes(&self) -> Result<Vec<u8>, LspError> {
        let encoded = match self {
            Self::Request(req) => serde_json::to_vec(&WireRequest {
                jsonrpc: JSONRPC_VERSION,
                id: &req.id,
                method: &req.method,
                params: req.params.as_ref(),
            }),
            Self::Notification(notif) => serde_json::to_vec(&WireNotification {
                jsonrpc: JSONRPC_VERSION,
                method: &notif.method,
                params: notif.params.as_ref(),
            }),
            Self::Response(resp) => {
                let (result, error) = match &resp.payload {
                    ResponsePayload::Result(value) => (Some(value), None),
                    ResponsePayload::Error(err) => (None, Some(err)),
                };
                serde_json::to_vec(&WireResponse {
                    jsonrpc: JSONRPC_VERSION,
                    id: resp.id.as_ref(),
                    result,
                    error,
                })
            }
        };
        encoded.map_err(|e| LspError::InvalidPayload(format!("serializing message: {e}")))
    }

    pub fn to_frame(&self) -> Result<Frame, LspError> {
        Ok(Frame::new(self.to_bytes()?))
    }

    /// Method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.method),
            Self::Notification(notif) => Some(&notif.method),
            Self::Response(_) => None,
        }
    }
}

fn parse_id(value: Value) -> Result<RequestId, LspError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(RequestId::Number)
            .ok_or_else(|| LspError::InvalidPayload(format!("non-integer id {n}"))),
        Value::String(s) => Ok(RequestId::String(s)),
        other => Err(LspError::InvalidPayload(format!("invalid id {other}"))),
    }
}

fn parse_method(value: Value) -> Result<String, LspError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(LspError::InvalidPayload(format!("invalid method {other}"))),
    }
}
