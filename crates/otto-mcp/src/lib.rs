// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! MCP plumbing: newline-delimited JSON-RPC 2.0 over subprocess stdio or
//! in-process channel pairs, client session state machines, and the
//! per-session tool pool.

pub mod protocol;
pub mod server;

mod client;
mod pool;
mod service;
mod transport;

pub use client::{CallError, ConnectFn, ServerConnection, ServerState};
pub use pool::{PoolTimeouts, ToolCallOutcome, ToolPool, ToolServerSpec, QUALIFIER};
pub use protocol::ToolDescriptor;
pub use service::{optional_str, require_str, McpService, ServiceError};
pub use transport::{Transport, TransportSender};
