//! JSON-RPC message model.
//!
//! The relay never validates payloads against the language server protocol
//! schema; it only needs to tell requests, responses and notifications apart
//! and to read/write ids. Everything else stays an opaque `Value`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol-reserved method used to tell the server a request was abandoned.
pub const CANCEL_METHOD: &str = "$/cancelRequest";

/// Error code reported when a proxy-originated request outlives its deadline.
pub const REQUEST_TIMEOUT_CODE: i32 = -32803;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: Value, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }

    /// The `$/cancelRequest` notification for an abandoned request id.
    pub fn cancel(id: &Value) -> Self {
        Self::new(CANCEL_METHOD, Some(json!({ "id": id })))
    }
}

impl JsonRpcError {
    pub fn request_timeout(timeout: Duration) -> Self {
        Self {
            code: REQUEST_TIMEOUT_CODE,
            message: format!("request timed out after {}ms", timeout.as_millis()),
            data: None,
        }
    }
}

impl JsonRpcMessage {
    /// The id carried by this message, if any.
    pub fn id(&self) -> Option<&Value> {
        match self {
            JsonRpcMessage::Request(req) => Some(&req.id),
            JsonRpcMessage::Response(resp) => Some(&resp.id),
            JsonRpcMessage::Notification(_) => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(req) => Some(&req.method),
            JsonRpcMessage::Notification(notif) => Some(&notif.method),
            JsonRpcMessage::Response(_) => None,
        }
    }
}
