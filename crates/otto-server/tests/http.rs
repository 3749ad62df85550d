// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end tests over real HTTP: session CRUD, buffered chat, and the
//! SSE stream framing.

use std::sync::Arc;

use otto_config::Config;
use otto_core::{Engine, SessionManager};
use otto_server::serve;
use otto_services::ServiceCatalog;
use serde_json::{json, Value};

struct TestServer {
    _dir: tempfile::TempDir,
    base: String,
    client: reqwest::Client,
}

async fn start_server() -> TestServer {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = Config::default();
    config.runtime.data_root = Some(dir.path().to_path_buf());
    let manager = SessionManager::new(&config, Arc::new(ServiceCatalog::standard())).unwrap();
    let engine = Arc::new(Engine::new(Arc::new(manager), 4));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = serve(listener, engine).await;
    });

    TestServer {
        _dir: dir,
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
    }
}

fn mock_session(id: &str) -> Value {
    json!({
        "id": id,
        "display_name": "Test session",
        "provider": { "provider": "mock", "model": "mock-model" },
    })
}

#[tokio::test]
async fn health_endpoints_report_ok() {
    let s = start_server().await;
    for path in ["/health", "/api/v1/chat/health"] {
        let resp = s.client.get(format!("{}{path}", s.base)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }
}

#[tokio::test]
async fn session_crud_over_http() {
    let s = start_server().await;

    // Create
    let resp = s
        .client
        .post(format!("{}/api/v1/sessions/", s.base))
        .json(&mock_session("crud-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    // Duplicate → 409
    let resp = s
        .client
        .post(format!("{}/api/v1/sessions/", s.base))
        .json(&mock_session("crud-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    // Get
    let resp = s
        .client
        .get(format!("{}/api/v1/sessions/crud-1", s.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["id"], "crud-1");
    assert_eq!(body["model"], "mock-model");

    // Update
    let resp = s
        .client
        .put(format!("{}/api/v1/sessions/crud-1", s.base))
        .json(&json!({ "display_name": "Renamed" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["display_name"], "Renamed");

    // List
    let resp = s
        .client
        .get(format!("{}/api/v1/sessions/?source=all", s.base))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["sessions"].as_array().unwrap().len(), 1);

    // Delete (idempotent)
    for _ in 0..2 {
        let resp = s
            .client
            .delete(format!("{}/api/v1/sessions/crud-1", s.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    let resp = s
        .client
        .get(format!("{}/api/v1/sessions/crud-1", s.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn bad_list_source_is_400() {
    let s = start_server().await;
    let resp = s
        .client
        .get(format!("{}/api/v1/sessions/?source=bogus", s.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn buffered_chat_returns_final_response() {
    let s = start_server().await;
    s.client
        .post(format!("{}/api/v1/sessions/", s.base))
        .json(&mock_session("chat-1"))
        .send()
        .await
        .unwrap();

    let resp = s
        .client
        .post(format!("{}/api/v1/chat/completions", s.base))
        .json(&json!({ "session_id": "chat-1", "message": "hi", "stream": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["session_id"], "chat-1");
    assert_eq!(body["iterations"], 1);
    assert!(body["response"].as_str().unwrap().contains("MOCK: hi"));
}

#[tokio::test]
async fn chat_on_unknown_session_is_404() {
    let s = start_server().await;
    let resp = s
        .client
        .post(format!("{}/api/v1/chat/completions", s.base))
        .json(&json!({ "session_id": "nope", "message": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn streaming_chat_frames_events_as_sse() {
    let s = start_server().await;
    s.client
        .post(format!("{}/api/v1/sessions/", s.base))
        .json(&mock_session("sse-1"))
        .send()
        .await
        .unwrap();

    let resp = s
        .client
        .post(format!("{}/api/v1/chat/completions", s.base))
        .json(&json!({ "session_id": "sse-1", "message": "ping", "stream": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let text = resp.text().await.unwrap();
    let payloads: Vec<&str> = text
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .collect();

    assert_eq!(*payloads.last().unwrap(), "[DONE]");
    let events: Vec<Value> = payloads[..payloads.len() - 1]
        .iter()
        .map(|p| serde_json::from_str(p).unwrap())
        .collect();
    assert_eq!(events.first().unwrap()["type"], "iteration");
    assert!(events.iter().any(|e| e["type"] == "content"));
    let complete = events.last().unwrap();
    assert_eq!(complete["type"], "complete");
    assert!(complete["final_response"]
        .as_str()
        .unwrap()
        .contains("MOCK: ping"));
}

#[tokio::test]
async fn concurrent_chat_on_same_session_is_409() {
    let s = start_server().await;
    s.client
        .post(format!("{}/api/v1/sessions/", s.base))
        .json(&mock_session("busy-1"))
        .send()
        .await
        .unwrap();

    // The mock adapter answers quickly, so race two requests and accept
    // either ordering: one of them may well finish before the other lands.
    let (a, b) = tokio::join!(
        s.client
            .post(format!("{}/api/v1/chat/completions", s.base))
            .json(&json!({ "session_id": "busy-1", "message": "one" }))
            .send(),
        s.client
            .post(format!("{}/api/v1/chat/completions", s.base))
            .json(&json!({ "session_id": "busy-1", "message": "two" }))
            .send(),
    );
    let codes = [a.unwrap().status().as_u16(), b.unwrap().status().as_u16()];
    assert!(codes.iter().all(|c| *c == 200 || *c == 409), "{codes:?}");
    assert!(codes.contains(&200), "at least one turn must run: {codes:?}");
}
