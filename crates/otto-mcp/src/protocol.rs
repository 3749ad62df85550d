// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! JSON-RPC 2.0 message types for the MCP wire protocol.
//!
//! Messages travel as newline-delimited JSON.  Supported requests:
//! `initialize`, `tools/list`, `tools/call`; supported notification:
//! `notifications/initialized`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// Standard JSON-RPC error codes.
pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// An outgoing request or notification.  Notifications carry no `id` and
/// receive no response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn ok(id: Option<u64>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<u64>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ─── MCP payloads ─────────────────────────────────────────────────────────────

/// A tool exposed by a server, as reported by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the arguments object.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
    #[serde(default)]
    pub capabilities: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsListResult {
    pub tools: Vec<ToolDescriptor>,
}

/// One content item in a `tools/call` result.  Only text content is used on
/// this surface; structured results travel as JSON text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Text { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsCallResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolsCallResult {
    /// Wrap a JSON value as a single text content item.
    pub fn from_value(v: &Value, is_error: bool) -> Self {
        let text = match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            content: vec![ToolContent::Text { text }],
            is_error,
        }
    }

    /// Concatenated text of all content items, parsed back into JSON when
    /// possible so structured results round-trip through the text surface.
    pub fn to_value(&self) -> Value {
        let text = self
            .content
            .iter()
            .map(|c| match c {
                ToolContent::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n");
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_with_id_before_method() {
        let r = JsonRpcRequest::new(7, "tools/list", None);
        let s = serde_json::to_string(&r).unwrap();
        assert_eq!(s, r#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#);
    }

    #[test]
    fn notification_has_no_id() {
        let n = JsonRpcRequest::notification("notifications/initialized", None);
        assert!(n.is_notification());
        let s = serde_json::to_string(&n).unwrap();
        assert!(!s.contains("\"id\""));
    }

    #[test]
    fn response_round_trip() {
        let r = JsonRpcResponse::ok(Some(3), json!({"tools": []}));
        let s = serde_json::to_string(&r).unwrap();
        let back: JsonRpcResponse = serde_json::from_str(&s).unwrap();
        assert_eq!(back.id, Some(3));
        assert!(back.error.is_none());
    }

    #[test]
    fn error_response_carries_code() {
        let r = JsonRpcResponse::err(Some(1), METHOD_NOT_FOUND, "unknown tool");
        let e = r.error.unwrap();
        assert_eq!(e.code, -32601);
        assert_eq!(e.message, "unknown tool");
    }

    #[test]
    fn tool_descriptor_uses_camel_case_schema_key() {
        let d = ToolDescriptor {
            name: "add".into(),
            description: "adds".into(),
            input_schema: json!({"type": "object"}),
        };
        let s = serde_json::to_string(&d).unwrap();
        assert!(s.contains("inputSchema"));
    }

    #[test]
    fn call_result_value_round_trip() {
        let v = json!({"sum": 3});
        let r = ToolsCallResult::from_value(&v, false);
        assert_eq!(r.to_value(), v);
    }

    #[test]
    fn call_result_plain_text_stays_text() {
        let r = ToolsCallResult::from_value(&json!("not json"), false);
        assert_eq!(r.to_value(), json!("not json"));
    }
}
