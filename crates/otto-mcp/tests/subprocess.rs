// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Integration tests for the subprocess transport and the per-server state
//! machine, driven by a scripted POSIX-shell MCP server so no extra binary
//! needs to be built.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use otto_mcp::{PoolTimeouts, ServerState, ToolPool};

/// A minimal well-behaved MCP server: answers initialize, tools/list, and
/// tools/call, echoing the request id back.
const WELL_BEHAVED: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"fake","version":"0.0"},"capabilities":{"tools":{}}}}\n' "$id" ;;
    *'"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"ping","description":"replies pong","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}],"isError":false}}\n' "$id" ;;
  esac
done
"#;

/// Same handshake, but the process dies the moment a call arrives.
const DIES_ON_CALL: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"fake","version":"0.0"},"capabilities":{"tools":{}}}}\n' "$id" ;;
    *'"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"ping","description":"","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"tools/call"'*)
      exit 1 ;;
  esac
done
"#;

fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, body).expect("writing fixture script");
    path
}

fn test_timeouts() -> PoolTimeouts {
    PoolTimeouts {
        tool_call: Duration::from_secs(5),
        startup: Duration::from_secs(3),
        shutdown_grace: Duration::from_secs(1),
    }
}

async fn pool_with_script(script: PathBuf) -> ToolPool {
    let pool = ToolPool::new(test_timeouts());
    pool.add_subprocess(
        "fake",
        "sh",
        vec![script.to_string_lossy().into_owned()],
        HashMap::new(),
    )
    .await;
    let failures = pool.start().await;
    assert!(failures.is_empty(), "startup failures: {failures:?}");
    pool
}

#[tokio::test]
async fn subprocess_server_full_round_trip() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "server.sh", WELL_BEHAVED);
    let pool = pool_with_script(script).await;

    let tools = pool.list_tools().await;
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "fake__ping");

    let out = pool.call("fake__ping", json!({})).await;
    assert!(out.ok, "error: {:?}", out.error);
    assert_eq!(out.result, json!("pong"));

    pool.shutdown().await;
}

#[tokio::test]
async fn calls_interleave_on_one_connection() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "server.sh", WELL_BEHAVED);
    let pool = pool_with_script(script).await;

    let (a, b, c) = tokio::join!(
        pool.call("fake__ping", json!({"n": 1})),
        pool.call("fake__ping", json!({"n": 2})),
        pool.call("fake__ping", json!({"n": 3})),
    );
    assert!(a.ok && b.ok && c.ok);

    pool.shutdown().await;
}

#[tokio::test]
async fn death_mid_call_reports_error_and_reconnects() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "dies.sh", DIES_ON_CALL);
    let pool = pool_with_script(script).await;
    assert_eq!(pool.server_state("fake").await, Some(ServerState::Ready));

    // The in-flight call is not replayed: it fails once the child exits.
    let out = pool.call("fake__ping", json!({})).await;
    assert!(!out.ok);

    // The supervisor respawns the script, which comes up clean again.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if pool.server_state("fake").await == Some(ServerState::Ready) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "server never returned to Ready; state = {:?}",
            pool.server_state("fake").await
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn unstartable_server_exhausts_budget_and_dies() {
    let pool = ToolPool::new(PoolTimeouts {
        startup: Duration::from_millis(500),
        ..test_timeouts()
    });
    // `sh -c 'exit 0'` exits immediately: EOF before any handshake reply.
    pool.add_subprocess(
        "ghost",
        "sh",
        vec!["-c".into(), "exit 0".into()],
        HashMap::new(),
    )
    .await;

    let failures = pool.start().await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "ghost");
    assert_eq!(pool.server_state("ghost").await, Some(ServerState::Dead));

    // Calls to a dead server fail fast with an error outcome.
    let out = pool.call("ghost__anything", json!({})).await;
    assert!(!out.ok);
}
