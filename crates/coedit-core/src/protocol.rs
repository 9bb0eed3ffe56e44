//! WebSocket protocol: JSON-RPC style
//!
//! Wire format:
//!
//! Client → Server (RPC request):
//!   { "id": "req-1", "method": "locks.acquire", "params": { "documentId": "d1", "blockIds": ["b1"] } }
//!
//! Server → Client (RPC response):
//!   { "id": "req-1", "result": { "granted": [...], "denied": [...] } }
//!   { "id": "req-1", "error": { "code": -32004, "message": "session not found: s1" } }
//!
//! Server → Client (Event push, no id):
//!   { "event": "lock:expired", "data": { "type": "lock:expired", "lock": { ... } } }
//!   { "event": "analysis", "data": { "type": "progress", "pipeline": "tableau", ... } }

use crate::event::{AnalysisEvent, CoordinationEvent};
use crate::Error;
use serde::{Deserialize, Serialize};

pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const NOT_FOUND: i32 = -32004;
pub const CONFLICT: i32 = -32009;
pub const UNSUPPORTED: i32 = -32010;

// ---------------------------------------------------------------------------
// Client → Server: JSON-RPC style
// ---------------------------------------------------------------------------

/// RPC request from client.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Server → Client: RPC response
// ---------------------------------------------------------------------------

/// RPC response to client.
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Successful response with a result value.
    pub fn ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Error response.
    pub fn err(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Shorthand for a method-not-found error.
    pub fn method_not_found(id: impl Into<String>, method: &str) -> Self {
        Self::err(id, METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }
}

/// RPC error detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl From<&Error> for RpcError {
    fn from(error: &Error) -> Self {
        let code = match error {
            e if e.is_not_found() => NOT_FOUND,
            Error::SessionBusy(_) => CONFLICT,
            Error::Unsupported(_) => UNSUPPORTED,
            Error::InvalidMessage(_) | Error::Json(_) => INVALID_PARAMS,
            _ => INTERNAL_ERROR,
        };
        Self {
            code,
            message: error.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Server → Client: Event push
// ---------------------------------------------------------------------------

/// Server-pushed event (no id, no request correlation).
#[derive(Debug, Clone, Serialize)]
pub struct EventMessage {
    pub event: String,
    pub data: serde_json::Value,
}

impl EventMessage {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Lock/intent event, named by its wire name.
    pub fn coordination(event: &CoordinationEvent) -> Self {
        Self::new(
            event.name(),
            serde_json::to_value(event).unwrap_or_default(),
        )
    }

    /// Analysis stream event; the `type` field inside `data` names the step.
    pub fn analysis(event: &AnalysisEvent) -> Self {
        Self::new(
            "analysis",
            serde_json::to_value(event).unwrap_or_default(),
        )
    }

    /// Info event (sent on connection).
    pub fn info(version: &str, session: &str) -> Self {
        Self::new(
            "info",
            serde_json::json!({ "version": version, "session": session }),
        )
    }

    /// Pong event.
    pub fn pong() -> Self {
        Self::new("pong", serde_json::json!({}))
    }
}
