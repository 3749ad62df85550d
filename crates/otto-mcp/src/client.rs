// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Client session for one MCP server.
//!
//! Each connection runs one writer (the transport's forwarding task) and one
//! reader task that demultiplexes responses by request id into single-shot
//! completion slots.  A supervisor task owns the
//! `Ready → Reconnecting → {Ready, Dead}` transitions; callers only ever
//! observe the state snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::Rng;
use serde_json::json;
use tokio::process::Child;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::protocol::{
    InitializeResult, JsonRpcRequest, JsonRpcResponse, ToolDescriptor, ToolsCallResult,
    ToolsListResult, PROTOCOL_VERSION,
};
use crate::transport::{Transport, TransportSender};

/// Reconnect budget: attempts and backoff shape.
pub const RECONNECT_ATTEMPTS: u32 = 3;
pub const BACKOFF_BASE: Duration = Duration::from_millis(100);
pub const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Lifecycle of one server connection.  A connection is in exactly one
/// state at any moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Spawning,
    Initializing,
    Ready,
    Reconnecting,
    Dead,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Spawning => "spawning",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Failure modes of a single request on a connection.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("tool server '{server}' unavailable ({state})")]
    Unavailable { server: String, state: ServerState },
    #[error("tool call timed out after {0:?}")]
    Timeout(Duration),
    #[error("tool server error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Factory that (re)establishes the transport for this connection.
/// Subprocess connections respawn the child; in-process connections create
/// a fresh channel pair and re-serve the same service instance.
pub type ConnectFn = Arc<dyn Fn() -> anyhow::Result<Transport> + Send + Sync>;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

pub struct ServerConnection {
    name: String,
    connect: ConnectFn,
    startup_timeout: Duration,
    state: StdMutex<ServerState>,
    next_id: AtomicU64,
    pending: PendingMap,
    sender: Mutex<Option<TransportSender>>,
    child: Mutex<Option<Child>>,
    tools: StdMutex<Vec<ToolDescriptor>>,
    disconnected: Arc<Notify>,
    shutting_down: AtomicBool,
    /// Incremented on every connect.  A reader whose generation is stale
    /// (its transport was already replaced) must not trigger a reconnect.
    generation: Arc<AtomicU64>,
}

impl ServerConnection {
    pub fn new(name: impl Into<String>, connect: ConnectFn, startup_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            connect,
            startup_timeout,
            state: StdMutex::new(ServerState::Spawning),
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            sender: Mutex::new(None),
            child: Mutex::new(None),
            tools: StdMutex::new(Vec::new()),
            disconnected: Arc::new(Notify::new()),
            shutting_down: AtomicBool::new(false),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, s: ServerState) {
        *self.state.lock().expect("state lock poisoned") = s;
    }

    /// Cached tool list, refreshed on every `Ready` transition.
    pub fn cached_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.lock().expect("tools lock poisoned").clone()
    }

    /// Establish the connection and spawn the reconnect supervisor.
    ///
    /// On initial-connect failure the connection goes through the same
    /// backoff budget as a runtime disconnect before being declared dead.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let result = self.connect_once().await;
        if let Err(e) = &result {
            warn!(server = %self.name, error = %e, "initial tool server connect failed; retrying");
            let recovered = self.clone().reconnect_with_backoff().await;
            if !recovered {
                self.set_state(ServerState::Dead);
                anyhow::bail!("tool server '{}' failed to start: {e}", self.name);
            }
        }
        let conn = self.clone();
        tokio::spawn(async move { conn.supervise().await });
        Ok(())
    }

    /// One connect + handshake cycle: spawn transport, `initialize`,
    /// `notifications/initialized`, `tools/list`, then `Ready`.
    async fn connect_once(self: &Arc<Self>) -> anyhow::Result<()> {
        self.set_state(ServerState::Spawning);
        let transport = (self.connect)()?;
        let (sender, mut incoming, child) = transport.split();
        *self.sender.lock().await = Some(sender);
        *self.child.lock().await = child;

        // Reader task: demux responses by id until EOF.  On EOF every
        // pending slot is dropped (callers observe a closed channel) and the
        // supervisor is notified — unless this reader's transport has
        // already been replaced by a newer connect.
        {
            let pending = Arc::clone(&self.pending);
            let disconnected = Arc::clone(&self.disconnected);
            let name = self.name.clone();
            let generation = Arc::clone(&self.generation);
            let my_gen = generation.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::spawn(async move {
                while let Some(line) = incoming.recv().await {
                    let resp: JsonRpcResponse = match serde_json::from_str(&line) {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(server = %name, error = %e, "discarding unparseable frame");
                            continue;
                        }
                    };
                    let Some(id) = resp.id else {
                        debug!(server = %name, "ignoring response without id");
                        continue;
                    };
                    let slot = pending.lock().await.remove(&id);
                    match slot {
                        Some(tx) => {
                            let _ = tx.send(resp);
                        }
                        None => debug!(server = %name, id, "response for unknown request id"),
                    }
                }
                if generation.load(Ordering::SeqCst) == my_gen {
                    pending.lock().await.clear();
                    disconnected.notify_one();
                }
            });
        }

        self.set_state(ServerState::Initializing);
        let init: InitializeResult = {
            let resp = self
                .request(
                    "initialize",
                    Some(json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "clientInfo": { "name": "otto", "version": env!("CARGO_PKG_VERSION") },
                        "capabilities": {},
                    })),
                    self.startup_timeout,
                )
                .await
                .map_err(|e| anyhow::anyhow!("initialize failed: {e}"))?;
            serde_json::from_value(resp).map_err(|e| anyhow::anyhow!("bad initialize result: {e}"))?
        };
        debug!(server = %self.name, peer = %init.server_info.name, "tool server initialized");

        self.notify("notifications/initialized", None).await?;

        let listed: ToolsListResult = {
            let resp = self
                .request("tools/list", None, self.startup_timeout)
                .await
                .map_err(|e| anyhow::anyhow!("tools/list failed: {e}"))?;
            serde_json::from_value(resp).map_err(|e| anyhow::anyhow!("bad tools/list result: {e}"))?
        };
        *self.tools.lock().expect("tools lock poisoned") = listed.tools;

        self.set_state(ServerState::Ready);
        info!(server = %self.name, tools = self.cached_tools().len(), "tool server ready");
        Ok(())
    }

    /// Supervisor: waits for disconnect notifications and drives the
    /// backoff loop.  Ends when the connection dies or shuts down.
    async fn supervise(self: Arc<Self>) {
        loop {
            self.disconnected.notified().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            warn!(server = %self.name, "tool server disconnected");
            self.set_state(ServerState::Reconnecting);
            if !self.clone().reconnect_with_backoff().await {
                self.set_state(ServerState::Dead);
                warn!(server = %self.name, "reconnect budget exhausted; server is dead");
                return;
            }
        }
    }

    /// Attempt up to [`RECONNECT_ATTEMPTS`] reconnects with exponential
    /// backoff and jitter.  Returns whether a connect succeeded.
    async fn reconnect_with_backoff(self: Arc<Self>) -> bool {
        for attempt in 1..=RECONNECT_ATTEMPTS {
            let exp = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt - 1));
            let delay = exp.min(BACKOFF_CAP);
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..50));
            tokio::time::sleep(delay + jitter).await;

            if self.shutting_down.load(Ordering::SeqCst) {
                return false;
            }
            match self.connect_once().await {
                Ok(()) => {
                    info!(server = %self.name, attempt, "tool server reconnected");
                    return true;
                }
                Err(e) => {
                    warn!(server = %self.name, attempt, error = %e, "reconnect attempt failed");
                }
            }
        }
        false
    }

    /// Send a request and await its matching response with a timeout.
    /// Returns the `result` payload; JSON-RPC errors map to [`CallError::Rpc`].
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, CallError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let req = JsonRpcRequest::new(id, method, params);
        let line = serde_json::to_string(&req)
            .map_err(|e| CallError::Protocol(format!("serialize: {e}")))?;

        let sender = self.sender.lock().await.clone();
        let Some(sender) = sender else {
            self.pending.lock().await.remove(&id);
            return Err(self.unavailable());
        };
        if sender.send(line).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(self.unavailable());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => {
                if let Some(err) = resp.error {
                    return Err(CallError::Rpc {
                        code: err.code,
                        message: err.message,
                    });
                }
                Ok(resp.result.unwrap_or(serde_json::Value::Null))
            }
            // Slot dropped: the reader hit EOF while this call was in flight.
            Ok(Err(_)) => Err(self.unavailable()),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(CallError::Timeout(timeout))
            }
        }
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> anyhow::Result<()> {
        let req = JsonRpcRequest::notification(method, params);
        let line = serde_json::to_string(&req)?;
        let sender = self.sender.lock().await.clone();
        match sender {
            Some(s) => s.send(line).await,
            None => anyhow::bail!("transport closed"),
        }
    }

    fn unavailable(&self) -> CallError {
        CallError::Unavailable {
            server: self.name.clone(),
            state: self.state(),
        }
    }

    /// Invoke `tools/call` for one tool on this server.
    ///
    /// Calls are rejected immediately unless the connection is `Ready`;
    /// multiple calls may be in flight concurrently and are demuxed by id.
    pub async fn call(
        &self,
        tool: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<ToolsCallResult, CallError> {
        if self.state() != ServerState::Ready {
            return Err(self.unavailable());
        }
        let result = self
            .request(
                "tools/call",
                Some(json!({ "name": tool, "arguments": arguments })),
                timeout,
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|e| CallError::Protocol(format!("bad tools/call result: {e}")))
    }

    /// Graceful shutdown: close stdin (EOF), wait up to `grace` for the
    /// child to exit, then kill stragglers.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.set_state(ServerState::Dead);
        // Dropping the sender ends the writer task, which closes stdin.
        self.sender.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(_) => debug!(server = %self.name, "tool server exited on EOF"),
                Err(_) => {
                    warn!(server = %self.name, "tool server ignored EOF; killing");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
