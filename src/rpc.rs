//! JSON-RPC bridge behind the script `jeth` object.
//!
//! Requests are forwarded one at a time to the host transport. Batches are
//! split and their responses collected in order. Every failure is turned
//! into a JSON-RPC error response so script always receives a well-formed
//! reply.

use crate::error::Result;
use serde_json::{json, Value};
use std::sync::Arc;

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;
/// Internal JSON-RPC error, used for transport failures.
pub const INTERNAL_ERROR: i64 = -32603;

/// Host transport for raw JSON-RPC messages.
pub trait RpcClient: Send + Sync {
    /// Send one raw request and return the raw response.
    fn call_raw(&self, request: &str) -> Result<String>;

    fn is_connected(&self) -> bool;
}

/// Build a JSON-RPC 2.0 error response.
pub fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message,
        },
    })
}

#[derive(Clone, Default)]
pub struct RpcBridge {
    client: Option<Arc<dyn RpcClient>>,
}

impl RpcBridge {
    pub fn new(client: Option<Arc<dyn RpcClient>>) -> Self {
        Self { client }
    }

    pub fn is_connected(&self) -> bool {
        self.client
            .as_ref()
            .is_some_and(|client| client.is_connected())
    }

    /// Forward a single request or a batch given as JSON text.
    pub fn send(&self, payload: &str) -> Value {
        let parsed: Value = match serde_json::from_str(payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::debug!(error = %err, "rejecting unparsable RPC payload");
                return error_response(Value::Null, PARSE_ERROR, &format!("parse error: {err}"));
            }
        };

        match parsed {
            Value::Array(requests) => Value::Array(
                requests
                    .into_iter()
                    .map(|request| self.send_one(request))
                    .collect(),
            ),
            request => self.send_one(request),
        }
    }

    fn send_one(&self, request: Value) -> Value {
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let Some(client) = &self.client else {
            return error_response(id, INTERNAL_ERROR, "RPC client is unavailable");
        };

        match client.call_raw(&request.to_string()) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                error_response(id, INTERNAL_ERROR, &format!("invalid RPC response: {err}"))
            }),
            Err(err) => {
                tracing::debug!(id = %id, error = %err, "RPC transport failed");
                error_response(id, INTERNAL_ERROR, &err.to_string())
            }
        }
    }
}
