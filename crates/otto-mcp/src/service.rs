// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::Value;

use crate::protocol::ToolDescriptor;

/// Error returned by an in-process service tool call.
///
/// The first two variants map onto the JSON-RPC error codes the wire
/// protocol mandates (`-32601`, `-32602`); execution failures are not
/// protocol errors — they travel inside the call result with
/// `isError = true` so the model can recover.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Execution(String),
}

impl ServiceError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArguments(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }
}

/// An in-process MCP server: a named collection of typed tools.
///
/// Implementations are plain structs; the dispatch loop in
/// [`crate::server`] gives them the same NDJSON JSON-RPC surface a
/// subprocess server has, so the pool treats both identically.
#[async_trait]
pub trait McpService: Send + Sync {
    /// Server name reported in the `initialize` handshake.
    fn name(&self) -> &str;

    /// Descriptors for every tool this service exposes.
    async fn list_tools(&self) -> Vec<ToolDescriptor>;

    /// Execute a tool and return its JSON result.
    async fn call_tool(&self, tool: &str, args: Value) -> Result<Value, ServiceError>;
}

/// Extract a required string argument from a tool's argument object.
pub fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ServiceError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ServiceError::invalid(format!("missing required string field '{key}'")))
}

/// Extract an optional string argument.
pub fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn require_str_present() {
        let args = json!({"path": "a.txt"});
        assert_eq!(require_str(&args, "path").unwrap(), "a.txt");
    }

    #[test]
    fn require_str_missing_is_invalid_arguments() {
        let args = json!({});
        let err = require_str(&args, "path").unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArguments(_)));
    }

    #[test]
    fn require_str_wrong_type_is_invalid_arguments() {
        let args = json!({"path": 42});
        assert!(require_str(&args, "path").is_err());
    }
}
