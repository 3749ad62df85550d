// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Server-side JSON-RPC dispatch for in-process MCP services.
//!
//! [`serve`] runs one service over one transport until EOF.  The loop is
//! the only place that knows the wire protocol; services implement the
//! typed [`McpService`] trait and never see JSON-RPC envelopes.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::{
    InitializeResult, JsonRpcRequest, JsonRpcResponse, ServerInfo, ToolsCallResult,
    ToolsListResult, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR,
    PROTOCOL_VERSION,
};
use crate::service::{McpService, ServiceError};
use crate::transport::Transport;

/// Serve `service` over `transport` on a background task.
///
/// The task ends when the peer closes its side.  The returned handle may be
/// used to await or abort the loop; dropping it detaches the task.
pub fn serve(service: Arc<dyn McpService>, transport: Transport) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (sender, mut incoming, _child) = transport.split();
        while let Some(line) = incoming.recv().await {
            let reply = handle_line(&service, &line).await;
            if let Some(resp) = reply {
                let Ok(text) = serde_json::to_string(&resp) else {
                    warn!("failed to serialize MCP response");
                    continue;
                };
                if sender.send(text).await.is_err() {
                    break;
                }
            }
        }
        debug!(service = %service.name(), "MCP service loop ended");
    })
}

/// Handle one incoming frame.  Notifications produce no reply.
async fn handle_line(service: &Arc<dyn McpService>, line: &str) -> Option<JsonRpcResponse> {
    let req: JsonRpcRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            return Some(JsonRpcResponse::err(
                None,
                PARSE_ERROR,
                format!("parse error: {e}"),
            ));
        }
    };

    match req.method.as_str() {
        "initialize" => Some(JsonRpcResponse::ok(
            req.id,
            serde_json::to_value(InitializeResult {
                protocol_version: PROTOCOL_VERSION.into(),
                server_info: ServerInfo {
                    name: service.name().to_string(),
                    version: env!("CARGO_PKG_VERSION").into(),
                },
                capabilities: json!({ "tools": {} }),
            })
            .unwrap_or(Value::Null),
        )),
        "notifications/initialized" => None,
        "tools/list" => {
            let tools = service.list_tools().await;
            Some(JsonRpcResponse::ok(
                req.id,
                serde_json::to_value(ToolsListResult { tools }).unwrap_or(Value::Null),
            ))
        }
        "tools/call" => {
            let params = req.params.unwrap_or(Value::Null);
            let Some(name) = params.get("name").and_then(|v| v.as_str()) else {
                return Some(JsonRpcResponse::err(
                    req.id,
                    INVALID_PARAMS,
                    "tools/call requires a 'name' parameter",
                ));
            };
            let args = params.get("arguments").cloned().unwrap_or(json!({}));
            match service.call_tool(name, args).await {
                Ok(result) => Some(JsonRpcResponse::ok(
                    req.id,
                    serde_json::to_value(ToolsCallResult::from_value(&result, false))
                        .unwrap_or(Value::Null),
                )),
                Err(ServiceError::UnknownTool(t)) => Some(JsonRpcResponse::err(
                    req.id,
                    METHOD_NOT_FOUND,
                    format!("unknown tool: {t}"),
                )),
                Err(ServiceError::InvalidArguments(m)) => {
                    Some(JsonRpcResponse::err(req.id, INVALID_PARAMS, m))
                }
                // Execution failures are tool results, not protocol errors:
                // the model is expected to see them and recover.
                Err(ServiceError::Execution(m)) => Some(JsonRpcResponse::ok(
                    req.id,
                    serde_json::to_value(ToolsCallResult::from_value(&json!(m), true))
                        .unwrap_or(Value::Null),
                )),
            }
        }
        other => Some(JsonRpcResponse::err(
            req.id,
            METHOD_NOT_FOUND,
            format!("unsupported method: {other}"),
        )),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ToolDescriptor;
    use async_trait::async_trait;

    struct EchoService;

    #[async_trait]
    impl McpService for EchoService {
        fn name(&self) -> &str {
            "echo"
        }

        async fn list_tools(&self) -> Vec<ToolDescriptor> {
            vec![ToolDescriptor {
                name: "echo".into(),
                description: "echoes its arguments".into(),
                input_schema: json!({"type": "object"}),
            }]
        }

        async fn call_tool(&self, tool: &str, args: Value) -> Result<Value, ServiceError> {
            match tool {
                "echo" => Ok(args),
                "boom" => Err(ServiceError::execution("exploded")),
                other => Err(ServiceError::UnknownTool(other.into())),
            }
        }
    }

    fn svc() -> Arc<dyn McpService> {
        Arc::new(EchoService)
    }

    #[tokio::test]
    async fn initialize_reports_server_info() {
        let resp = handle_line(&svc(), r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#)
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "echo");
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn initialized_notification_gets_no_reply() {
        let resp = handle_line(
            &svc(),
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        )
        .await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn tools_list_returns_descriptors() {
        let resp = handle_line(&svc(), r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["tools"][0]["name"], "echo");
    }

    #[tokio::test]
    async fn tools_call_round_trips_arguments() {
        let resp = handle_line(
            &svc(),
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"echo","arguments":{"x":1}}}"#,
        )
        .await
        .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], false);
        assert_eq!(result["content"][0]["text"], r#"{"x":1}"#);
    }

    #[tokio::test]
    async fn unknown_tool_is_method_not_found() {
        let resp = handle_line(
            &svc(),
            r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"nope"}}"#,
        )
        .await
        .unwrap();
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_name_is_invalid_params() {
        let resp = handle_line(
            &svc(),
            r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{}}"#,
        )
        .await
        .unwrap();
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn execution_failure_is_an_error_result_not_protocol_error() {
        let resp = handle_line(
            &svc(),
            r#"{"jsonrpc":"2.0","id":6,"method":"tools/call","params":{"name":"boom"}}"#,
        )
        .await
        .unwrap();
        assert!(resp.error.is_none());
        assert_eq!(resp.result.unwrap()["isError"], true);
    }

    #[tokio::test]
    async fn unparseable_line_is_parse_error() {
        let resp = handle_line(&svc(), "{garbage").await.unwrap();
        assert_eq!(resp.error.unwrap().code, PARSE_ERROR);
    }

    #[tokio::test]
    async fn unsupported_method_is_method_not_found() {
        let resp = handle_line(&svc(), r#"{"jsonrpc":"2.0","id":9,"method":"resources/list"}"#)
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn serve_loop_answers_over_in_process_pair() {
        let (client, server_side) = Transport::in_process_pair();
        let _handle = serve(svc(), server_side);

        client
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#.into())
            .await
            .unwrap();
        let (_, mut rx, _) = client.split();
        let line = rx.recv().await.expect("reply expected");
        let resp: JsonRpcResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(resp.id, Some(1));
    }
}
