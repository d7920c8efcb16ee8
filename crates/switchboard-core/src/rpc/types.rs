//! Wire types for the line-delimited JSON-RPC protocol.
//!
//! # Message classes
//!
//! There is no version envelope. Which fields are present decides what a
//! message is:
//!
//! | `id` | `method` | class                                       |
//! |------|----------|---------------------------------------------|
//! | yes  | yes      | server-initiated request (we must respond)  |
//! | yes  | no       | response to one of our requests             |
//! | no   | yes      | notification                                |
//! | no   | no       | meaningless, dropped                        |
//!
//! Unlike an untagged serde enum, [`RpcMessage`] is parsed as one flat struct
//! and classified afterwards, so the order of checks is explicit in
//! [`RpcMessage::classify`] instead of depending on variant order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProviderError;

/// A JSON-RPC id. Requests we send always use integers; ids on
/// server-initiated requests are echoed back exactly as received.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Integer(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<RpcErrorObject> for ProviderError {
    fn from(err: RpcErrorObject) -> Self {
        ProviderError::Rpc {
            code: err.code,
            message: err
                .message
                .unwrap_or_else(|| "Unknown JSON-RPC error".to_string()),
            data: err.data,
        }
    }
}

/// Any message on the wire, before classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

/// A notification (method, no id). No response is expected.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcNotification {
    pub method: String,
    pub params: Option<Value>,
}

impl RpcNotification {
    /// String field from `params`, if present.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.as_ref()?.get(key)?.as_str()
    }
}

/// A request sent by the server (id AND method). Answer it with
/// `respond()` using the same id or the server will wait forever.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcServerRequest {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

/// A classified incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    ServerRequest(RpcServerRequest),
    Response {
        id: RequestId,
        outcome: Result<Value, RpcErrorObject>,
    },
    Notification(RpcNotification),
}

impl RpcMessage {
    pub fn request(id: i64, method: &str, params: Option<Value>) -> Self {
        Self {
            id: Some(RequestId::Integer(id)),
            method: Some(method.to_string()),
            params,
            ..Self::default()
        }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            method: Some(method.to_string()),
            params,
            ..Self::default()
        }
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn error_response(id: RequestId, error: RpcErrorObject) -> Self {
        Self {
            id: Some(id),
            error: Some(error),
            ..Self::default()
        }
    }

    /// Decide the message class from field presence alone.
    pub fn classify(self) -> Option<IncomingMessage> {
        match (self.id, self.method) {
            (Some(id), Some(method)) => Some(IncomingMessage::ServerRequest(RpcServerRequest {
                id,
                method,
                params: self.params,
            })),
            (Some(id), None) => {
                let outcome = match self.error {
                    Some(error) => Err(error),
                    None => Ok(self.result.unwrap_or(Value::Null)),
                };
                Some(IncomingMessage::Response { id, outcome })
            }
            (None, Some(method)) => Some(IncomingMessage::Notification(RpcNotification {
                method,
                params: self.params,
            })),
            (None, None) => None,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
