// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-session tool pool: owns every MCP server attached to one session,
//! aggregates their tools under qualified names, and routes calls.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::warn;

use crate::client::{ConnectFn, ServerConnection, ServerState};
use crate::protocol::ToolDescriptor;
use crate::server::serve;
use crate::service::McpService;
use crate::transport::Transport;

/// Separator between the server prefix and the tool name in a qualified
/// tool name (`<server>__<tool>`).
pub const QUALIFIER: &str = "__";

/// Declaration of one tool server attached to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolServerSpec {
    Subprocess {
        name: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    InProcess {
        name: String,
        service_type: String,
        #[serde(default)]
        config: Value,
    },
}

impl ToolServerSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::Subprocess { name, .. } | Self::InProcess { name, .. } => name,
        }
    }
}

/// Result of one routed tool call, as presented to the model.
///
/// The pool never fails a call at the type level: routing errors,
/// unavailable servers, timeouts, and tool errors all collapse into
/// `ok = false` with the message in both `result` and `error`, because the
/// model consumes failures the same way it consumes successes.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub ok: bool,
    pub result: Value,
    pub error: Option<String>,
}

impl ToolCallOutcome {
    fn failure(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        Self {
            ok: false,
            result: json!(msg),
            error: Some(msg),
        }
    }
}

/// Timeouts governing the pool's I/O.
#[derive(Debug, Clone, Copy)]
pub struct PoolTimeouts {
    pub tool_call: Duration,
    pub startup: Duration,
    pub shutdown_grace: Duration,
}

impl Default for PoolTimeouts {
    fn default() -> Self {
        Self {
            tool_call: Duration::from_secs(30),
            startup: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

/// All MCP servers owned by one session.
///
/// Server order is registration order: tool-name collisions resolve
/// first-registered-wins, and subprocess handles are never shared between
/// pools.
pub struct ToolPool {
    servers: RwLock<Vec<Arc<ServerConnection>>>,
    timeouts: PoolTimeouts,
}

impl ToolPool {
    pub fn new(timeouts: PoolTimeouts) -> Self {
        Self {
            servers: RwLock::new(Vec::new()),
            timeouts,
        }
    }

    /// Register a subprocess server.  The connection is created but not
    /// started; call [`ToolPool::start`] to bring all servers up.
    pub async fn add_subprocess(
        &self,
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Arc<ServerConnection> {
        let command = command.into();
        let connect: ConnectFn = Arc::new(move || {
            Transport::spawn_subprocess(&command, &args, &env)
        });
        self.add_connection(name, connect).await
    }

    /// Register an in-process service.  Reconnects re-serve the same
    /// service instance over a fresh channel pair.
    pub async fn add_in_process(
        &self,
        name: impl Into<String>,
        service: Arc<dyn McpService>,
    ) -> Arc<ServerConnection> {
        let connect: ConnectFn = Arc::new(move || {
            let (client_side, server_side) = Transport::in_process_pair();
            serve(Arc::clone(&service), server_side);
            Ok(client_side)
        });
        self.add_connection(name, connect).await
    }

    async fn add_connection(
        &self,
        name: impl Into<String>,
        connect: ConnectFn,
    ) -> Arc<ServerConnection> {
        let conn = Arc::new(ServerConnection::new(name, connect, self.timeouts.startup));
        self.servers.write().await.push(Arc::clone(&conn));
        conn
    }

    /// Start every registered server that has not been started yet.
    ///
    /// A server that fails its whole startup budget is left `Dead` and
    /// reported in the returned list; the pool itself stays usable.
    pub async fn start(&self) -> Vec<(String, String)> {
        let servers = self.servers.read().await.clone();
        let mut failures = Vec::new();
        for conn in servers {
            if conn.state() != ServerState::Spawning {
                continue;
            }
            if let Err(e) = conn.start().await {
                failures.push((conn.name().to_string(), e.to_string()));
            }
        }
        failures
    }

    /// Start one just-registered server (used when a service is created at
    /// runtime by the service manager).
    pub async fn start_server(&self, name: &str) -> anyhow::Result<()> {
        let conn = self
            .find(name)
            .await
            .ok_or_else(|| anyhow::anyhow!("no such tool server: {name}"))?;
        conn.start().await
    }

    async fn find(&self, name: &str) -> Option<Arc<ServerConnection>> {
        self.servers
            .read()
            .await
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Remove a server from the pool and shut it down.
    pub async fn remove(&self, name: &str) -> bool {
        let conn = {
            let mut servers = self.servers.write().await;
            match servers.iter().position(|c| c.name() == name) {
                Some(idx) => servers.remove(idx),
                None => return false,
            }
        };
        conn.shutdown(self.timeouts.shutdown_grace).await;
        true
    }

    /// Names of all registered servers, in registration order.
    pub async fn server_names(&self) -> Vec<String> {
        self.servers
            .read()
            .await
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// State of one server, if registered.
    pub async fn server_state(&self, name: &str) -> Option<ServerState> {
        self.find(name).await.map(|c| c.state())
    }

    /// Cached descriptors of one server's tools (unqualified names).
    pub async fn server_tools(&self, name: &str) -> Option<Vec<ToolDescriptor>> {
        self.find(name).await.map(|c| c.cached_tools())
    }

    /// Aggregate tool descriptors across all servers.
    ///
    /// Each tool name is prefixed with `<server>__`.  On a qualified-name
    /// collision the first-registered server wins and the loser is logged.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        let servers = self.servers.read().await.clone();
        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for conn in servers {
            for tool in conn.cached_tools() {
                let qualified = format!("{}{}{}", conn.name(), QUALIFIER, tool.name);
                if !seen.insert(qualified.clone()) {
                    warn!(tool = %qualified, "duplicate qualified tool name; first registration wins");
                    continue;
                }
                out.push(ToolDescriptor {
                    name: qualified,
                    description: tool.description,
                    input_schema: tool.input_schema,
                });
            }
        }
        out
    }

    /// Route a call by its qualified name and return the outcome.
    pub async fn call(&self, qualified: &str, arguments: Value) -> ToolCallOutcome {
        self.call_with_timeout(qualified, arguments, self.timeouts.tool_call)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        qualified: &str,
        arguments: Value,
        timeout: Duration,
    ) -> ToolCallOutcome {
        let Some((server, tool)) = qualified.split_once(QUALIFIER) else {
            return ToolCallOutcome::failure(format!(
                "malformed tool name '{qualified}' (expected <server>__<tool>)"
            ));
        };
        let Some(conn) = self.find(server).await else {
            return ToolCallOutcome::failure(format!("unknown tool server '{server}'"));
        };
        match conn.call(tool, arguments, timeout).await {
            Ok(result) => {
                let is_error = result.is_error;
                ToolCallOutcome {
                    ok: !is_error,
                    error: is_error.then(|| result.to_value().to_string()),
                    result: result.to_value(),
                }
            }
            Err(e) => ToolCallOutcome::failure(e.to_string()),
        }
    }

    /// Shut down every server: EOF, grace period, then force kill.
    pub async fn shutdown(&self) {
        let servers = {
            let mut guard = self.servers.write().await;
            std::mem::take(&mut *guard)
        };
        for conn in servers {
            conn.shutdown(self.timeouts.shutdown_grace).await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
