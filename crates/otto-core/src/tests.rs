// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Scenario tests for the iteration engine.
///
/// Uses ScriptedMockAdapter so every scenario is deterministic and
/// requires no network access.
#[cfg(test)]
mod engine_tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use otto_config::{Config, ProviderSettings};
    use otto_mcp::{McpService, ServiceError, ToolDescriptor};
    use otto_model::{
        ChatRequest, Message, ModelAdapter, ProviderEvent, ProviderStream, ScriptedMockAdapter,
    };
    use otto_services::ServiceCatalog;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use crate::{CoreError, Engine, RunOptions, SessionManager, SessionSpec, TurnEvent};

    // ── Helpers ───────────────────────────────────────────────────────────────

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: Engine,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.runtime.data_root = Some(dir.path().to_path_buf());
        let manager =
            SessionManager::new(&config, Arc::new(ServiceCatalog::standard())).unwrap();
        Fixture {
            _dir: dir,
            engine: Engine::new(Arc::new(manager), 8),
        }
    }

    fn mock_spec(id: &str) -> SessionSpec {
        SessionSpec {
            id: id.into(),
            provider: Some(ProviderSettings {
                provider: "mock".into(),
                model: "mock-model".into(),
                api_key_env: None,
                api_key: None,
                base_url: None,
                max_tokens: None,
                temperature: None,
            }),
            ..Default::default()
        }
    }

    /// Create a session and install a scripted adapter on its handle.
    async fn scripted_session(f: &Fixture, id: &str, adapter: ScriptedMockAdapter) {
        f.engine.manager().create(mock_spec(id)).await.unwrap();
        let handle = f.engine.manager().handle(id).await.unwrap();
        assert!(handle.preset_adapter(Arc::new(adapter)));
    }

    /// Drain the receiver until the terminal event.
    async fn collect(mut rx: mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            let terminal = ev.is_terminal();
            events.push(ev);
            if terminal {
                break;
            }
        }
        events
    }

    fn tool_call_script(id: &str, name: &str, args: &str) -> Vec<ProviderEvent> {
        vec![
            ProviderEvent::ToolCallBegin {
                id: id.into(),
                name: name.into(),
            },
            ProviderEvent::ToolCallArgumentsDelta {
                id: id.into(),
                delta: args.into(),
            },
            ProviderEvent::ToolCallEnd { id: id.into() },
            ProviderEvent::Done,
        ]
    }

    /// A `calc` service with an `add` tool and a deliberately failing one.
    struct CalcService;

    #[async_trait]
    impl McpService for CalcService {
        fn name(&self) -> &str {
            "calc"
        }
        async fn list_tools(&self) -> Vec<ToolDescriptor> {
            vec![ToolDescriptor {
                name: "add".into(),
                description: "adds a and b".into(),
                input_schema: json!({"type": "object"}),
            }]
        }
        async fn call_tool(&self, tool: &str, args: Value) -> Result<Value, ServiceError> {
            match tool {
                "add" => {
                    let a = args["a"].as_i64().unwrap_or(0);
                    let b = args["b"].as_i64().unwrap_or(0);
                    Ok(json!({"sum": a + b}))
                }
                "boom" => Err(ServiceError::execution("tool exploded")),
                other => Err(ServiceError::UnknownTool(other.into())),
            }
        }
    }

    async fn attach_calc(f: &Fixture, id: &str) {
        let handle = f.engine.manager().handle(id).await.unwrap();
        handle.pool().add_in_process("calc", Arc::new(CalcService)).await;
    }

    // ── Scenario 1: echo turn ─────────────────────────────────────────────────

    #[tokio::test]
    async fn echo_turn_streams_deltas_then_completes() {
        let f = fixture();
        scripted_session(
            &f,
            "echo",
            ScriptedMockAdapter::new(vec![vec![
                ProviderEvent::ContentDelta("hello ".into()),
                ProviderEvent::ContentDelta("world".into()),
                ProviderEvent::Done,
            ]]),
        )
        .await;

        let rx = f.engine.run("echo", "hi", RunOptions::default()).await.unwrap();
        let events = collect(rx).await;

        assert_eq!(
            events,
            vec![
                TurnEvent::Iteration { current: 1, max: 10 },
                TurnEvent::Content { content: "hello ".into() },
                TurnEvent::Content { content: "world".into() },
                TurnEvent::Complete {
                    final_response: "hello world".into(),
                    iterations: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn turn_appends_user_and_assistant_to_context() {
        let f = fixture();
        scripted_session(&f, "ctx", ScriptedMockAdapter::always_text("reply")).await;

        let rx = f.engine.run("ctx", "my question", RunOptions::default()).await.unwrap();
        collect(rx).await;

        let handle = f.engine.manager().handle("ctx").await.unwrap();
        let messages = handle.context().lock().await.snapshot();
        assert!(messages
            .iter()
            .any(|m| matches!(m, Message::User { content, .. } if content == "my question")));
        assert!(messages
            .iter()
            .any(|m| matches!(m, Message::Assistant { content, .. } if content == "reply")));
    }

    // ── Scenario 2: one tool round-trip ───────────────────────────────────────

    #[tokio::test]
    async fn tool_round_trip_interleaves_events_in_order() {
        let f = fixture();
        scripted_session(
            &f,
            "tools",
            ScriptedMockAdapter::new(vec![
                tool_call_script("c1", "calc__add", r#"{"a":1,"b":2}"#),
                vec![ProviderEvent::ContentDelta("3".into()), ProviderEvent::Done],
            ]),
        )
        .await;
        attach_calc(&f, "tools").await;

        let rx = f.engine.run("tools", "1+2", RunOptions::default()).await.unwrap();
        let events = collect(rx).await;

        assert_eq!(
            events,
            vec![
                TurnEvent::Iteration { current: 1, max: 10 },
                TurnEvent::ToolCall {
                    tool: "calc__add".into(),
                    arguments: json!({"a": 1, "b": 2}),
                },
                TurnEvent::ToolResult {
                    tool: "calc__add".into(),
                    success: true,
                    result: json!({"sum": 3}),
                },
                TurnEvent::Iteration { current: 2, max: 10 },
                TurnEvent::Content { content: "3".into() },
                TurnEvent::Complete {
                    final_response: "3".into(),
                    iterations: 2
                },
            ]
        );
    }

    #[tokio::test]
    async fn assistant_message_stores_content_and_calls_together() {
        let f = fixture();
        scripted_session(
            &f,
            "both",
            ScriptedMockAdapter::new(vec![
                vec![
                    ProviderEvent::ContentDelta("let me compute that".into()),
                    ProviderEvent::ToolCallBegin {
                        id: "c1".into(),
                        name: "calc__add".into(),
                    },
                    ProviderEvent::ToolCallArgumentsDelta {
                        id: "c1".into(),
                        delta: r#"{"a":2,"b":2}"#.into(),
                    },
                    ProviderEvent::ToolCallEnd { id: "c1".into() },
                    ProviderEvent::Done,
                ],
                vec![ProviderEvent::ContentDelta("4".into()), ProviderEvent::Done],
            ]),
        )
        .await;
        attach_calc(&f, "both").await;

        let rx = f.engine.run("both", "2+2", RunOptions::default()).await.unwrap();
        collect(rx).await;

        let handle = f.engine.manager().handle("both").await.unwrap();
        let messages = handle.context().lock().await.snapshot();
        let assistant = messages
            .iter()
            .find_map(|m| match m {
                Message::Assistant {
                    content,
                    tool_calls,
                    ..
                } if !tool_calls.is_empty() => Some((content.clone(), tool_calls.len())),
                _ => None,
            })
            .expect("assistant message with tool calls");
        assert_eq!(assistant, ("let me compute that".into(), 1));
    }

    // ── Scenario 3: tool error recovery ───────────────────────────────────────

    #[tokio::test]
    async fn tool_failure_feeds_model_and_turn_completes() {
        let f = fixture();
        scripted_session(
            &f,
            "recover",
            ScriptedMockAdapter::new(vec![
                tool_call_script("c1", "calc__boom", "{}"),
                vec![
                    ProviderEvent::ContentDelta("sorry, the tool failed".into()),
                    ProviderEvent::Done,
                ],
            ]),
        )
        .await;
        attach_calc(&f, "recover").await;

        let rx = f.engine.run("recover", "go", RunOptions::default()).await.unwrap();
        let events = collect(rx).await;

        assert!(events.iter().any(|e| matches!(
            e,
            TurnEvent::ToolResult { success: false, .. }
        )));
        assert!(matches!(
            events.last(),
            Some(TurnEvent::Complete { iterations: 2, .. })
        ));

        // The failure is recorded for the model as an error-flagged reply.
        let handle = f.engine.manager().handle("recover").await.unwrap();
        let messages = handle.context().lock().await.snapshot();
        assert!(messages
            .iter()
            .any(|m| matches!(m, Message::Tool { is_error: true, .. })));
    }

    #[tokio::test]
    async fn call_to_unknown_server_is_error_result_not_turn_failure() {
        let f = fixture();
        scripted_session(
            &f,
            "noserver",
            ScriptedMockAdapter::new(vec![
                tool_call_script("c1", "ghost__tool", "{}"),
                vec![ProviderEvent::ContentDelta("ok".into()), ProviderEvent::Done],
            ]),
        )
        .await;

        let rx = f.engine.run("noserver", "go", RunOptions::default()).await.unwrap();
        let events = collect(rx).await;
        assert!(events.iter().any(|e| matches!(
            e,
            TurnEvent::ToolResult { success: false, .. }
        )));
        assert!(matches!(events.last(), Some(TurnEvent::Complete { .. })));
    }

    // ── Scenario 4: max iterations ────────────────────────────────────────────

    #[tokio::test]
    async fn iteration_bound_ends_with_last_assistant_content() {
        let f = fixture();
        // Three rounds, each requesting another tool call.
        scripted_session(
            &f,
            "bounded",
            ScriptedMockAdapter::new(vec![
                tool_call_script("c1", "calc__add", r#"{"a":1,"b":1}"#),
                tool_call_script("c2", "calc__add", r#"{"a":2,"b":2}"#),
                tool_call_script("c3", "calc__add", r#"{"a":3,"b":3}"#),
            ]),
        )
        .await;
        attach_calc(&f, "bounded").await;

        let rx = f
            .engine
            .run(
                "bounded",
                "loop forever",
                RunOptions {
                    max_iterations: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let events = collect(rx).await;

        let iterations = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::Iteration { .. }))
            .count();
        let calls = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::ToolCall { .. }))
            .count();
        let results = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::ToolResult { .. }))
            .count();
        assert_eq!((iterations, calls, results), (3, 3, 3));
        assert!(matches!(
            events.last(),
            Some(TurnEvent::Complete { iterations: 3, .. })
        ));
    }

    #[tokio::test]
    async fn max_iterations_one_with_tool_calls_still_completes() {
        let f = fixture();
        scripted_session(
            &f,
            "one",
            ScriptedMockAdapter::new(vec![vec![
                ProviderEvent::ContentDelta("thinking".into()),
                ProviderEvent::ToolCallBegin {
                    id: "c1".into(),
                    name: "calc__add".into(),
                },
                ProviderEvent::ToolCallEnd { id: "c1".into() },
                ProviderEvent::Done,
            ]]),
        )
        .await;
        attach_calc(&f, "one").await;

        let rx = f
            .engine
            .run(
                "one",
                "go",
                RunOptions {
                    max_iterations: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let events = collect(rx).await;
        assert!(matches!(
            events.last(),
            Some(TurnEvent::Complete { final_response, iterations: 1 })
                if final_response == "thinking"
        ));
    }

    #[tokio::test]
    async fn override_is_clamped_to_session_bound() {
        let f = fixture();
        scripted_session(&f, "clamp", ScriptedMockAdapter::always_text("hi")).await;
        let rx = f
            .engine
            .run(
                "clamp",
                "go",
                RunOptions {
                    max_iterations: Some(10_000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let events = collect(rx).await;
        // The session default (10) wins over the oversized override.
        assert!(matches!(
            events.first(),
            Some(TurnEvent::Iteration { max: 10, .. })
        ));
    }

    // ── Scenario 5: concurrent run rejected ───────────────────────────────────

    /// Adapter that stalls long enough for a second run to collide.
    #[derive(Debug)]
    struct StallAdapter;

    #[async_trait]
    impl ModelAdapter for StallAdapter {
        fn name(&self) -> &str {
            "stall"
        }
        fn model_name(&self) -> &str {
            "stall"
        }
        async fn chat_stream(&self, _req: ChatRequest) -> anyhow::Result<ProviderStream> {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            Ok(Box::pin(futures::stream::iter(vec![
                Ok(ProviderEvent::ContentDelta("late".into())),
                Ok(ProviderEvent::Done),
            ])))
        }
    }

    #[tokio::test]
    async fn concurrent_run_on_same_session_is_busy() {
        let f = fixture();
        f.engine.manager().create(mock_spec("busy")).await.unwrap();
        let handle = f.engine.manager().handle("busy").await.unwrap();
        assert!(handle.preset_adapter(Arc::new(StallAdapter)));

        let rx1 = f.engine.run("busy", "first", RunOptions::default()).await.unwrap();
        let err = f
            .engine
            .run("busy", "second", RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Busy(_)));

        collect(rx1).await;
        // The rejected run did not touch the context.
        let messages = handle.context().lock().await.snapshot();
        let users = messages
            .iter()
            .filter(|m| matches!(m, Message::User { .. }))
            .count();
        assert_eq!(users, 1);

        // After the first turn finishes, the session accepts runs again.
        let rx2 = f.engine.run("busy", "third", RunOptions::default()).await.unwrap();
        collect(rx2).await;
    }

    #[tokio::test]
    async fn distinct_sessions_run_in_parallel() {
        let f = fixture();
        for id in ["par-a", "par-b"] {
            f.engine.manager().create(mock_spec(id)).await.unwrap();
            let handle = f.engine.manager().handle(id).await.unwrap();
            assert!(handle.preset_adapter(Arc::new(StallAdapter)));
        }
        let rx_a = f.engine.run("par-a", "go", RunOptions::default()).await.unwrap();
        let rx_b = f.engine.run("par-b", "go", RunOptions::default()).await.unwrap();
        let (a, b) = tokio::join!(collect(rx_a), collect(rx_b));
        assert!(matches!(a.last(), Some(TurnEvent::Complete { .. })));
        assert!(matches!(b.last(), Some(TurnEvent::Complete { .. })));
    }

    // ── Failure semantics ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn provider_error_emits_error_and_keeps_user_message() {
        let f = fixture();
        scripted_session(
            &f,
            "perr",
            ScriptedMockAdapter::always_text("never sent").fail_next(),
        )
        .await;

        let rx = f.engine.run("perr", "hello", RunOptions::default()).await.unwrap();
        let events = collect(rx).await;
        assert!(matches!(events.last(), Some(TurnEvent::Error { .. })));

        let handle = f.engine.manager().handle("perr").await.unwrap();
        let messages = handle.context().lock().await.snapshot();
        assert!(messages
            .iter()
            .any(|m| matches!(m, Message::User { content, .. } if content == "hello")));
        assert!(!messages.iter().any(|m| matches!(m, Message::Assistant { .. })));
    }

    /// Adapter whose stream announces one full tool call, then fails.
    #[derive(Debug)]
    struct DiesAfterToolCallAdapter;

    #[async_trait]
    impl ModelAdapter for DiesAfterToolCallAdapter {
        fn name(&self) -> &str {
            "broken-stream"
        }
        fn model_name(&self) -> &str {
            "broken-stream"
        }
        async fn chat_stream(&self, _req: ChatRequest) -> anyhow::Result<ProviderStream> {
            Ok(Box::pin(futures::stream::iter(vec![
                Ok(ProviderEvent::ToolCallBegin {
                    id: "c1".into(),
                    name: "calc__add".into(),
                }),
                Ok(ProviderEvent::ToolCallArgumentsDelta {
                    id: "c1".into(),
                    delta: r#"{"a":1,"b":2}"#.into(),
                }),
                Ok(ProviderEvent::ToolCallEnd { id: "c1".into() }),
                Err(anyhow::anyhow!("connection reset mid-stream")),
            ])))
        }
    }

    #[tokio::test]
    async fn stream_error_after_announced_call_closes_it_out() {
        let f = fixture();
        f.engine.manager().create(mock_spec("midstream")).await.unwrap();
        let handle = f.engine.manager().handle("midstream").await.unwrap();
        assert!(handle.preset_adapter(Arc::new(DiesAfterToolCallAdapter)));
        attach_calc(&f, "midstream").await;

        let rx = f.engine.run("midstream", "go", RunOptions::default()).await.unwrap();
        let events = collect(rx).await;

        // The announced call got a failed result, so call/result counts
        // match even though the turn ends in Error.
        let calls = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::ToolCall { .. }))
            .count();
        let results = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::ToolResult { .. }))
            .count();
        assert_eq!((calls, results), (1, 1), "events: {events:#?}");
        assert!(events.iter().any(|e| matches!(
            e,
            TurnEvent::ToolResult { success: false, .. }
        )));
        assert!(matches!(
            events.last(),
            Some(TurnEvent::Error { error }) if error.contains("connection reset")
        ));

        // The history pairs the call with an error-flagged reply rather
        // than leaving the assistant's call id dangling.
        let messages = handle.context().lock().await.snapshot();
        let announced = messages
            .iter()
            .find_map(|m| match m {
                Message::Assistant { tool_calls, .. } if !tool_calls.is_empty() => {
                    Some(tool_calls[0].id.clone())
                }
                _ => None,
            })
            .expect("assistant message with the announced call");
        assert!(messages.iter().any(|m| matches!(
            m,
            Message::Tool { call_id, is_error: true, .. } if *call_id == announced
        )));
    }

    #[tokio::test]
    async fn empty_input_is_invalid() {
        let f = fixture();
        scripted_session(&f, "empty", ScriptedMockAdapter::always_text("x")).await;
        for input in ["", "   "] {
            let err = f.engine.run("empty", input, RunOptions::default()).await.unwrap_err();
            assert!(matches!(err, CoreError::InvalidInput(_)));
        }
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let f = fixture();
        let err = f.engine.run("ghost", "hi", RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn pre_cancelled_turn_errors_but_persists_user_message() {
        let f = fixture();
        scripted_session(&f, "cancel", ScriptedMockAdapter::always_text("x")).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let rx = f
            .engine
            .run(
                "cancel",
                "hi",
                RunOptions {
                    max_iterations: None,
                    cancel,
                },
            )
            .await
            .unwrap();
        let events = collect(rx).await;
        assert!(matches!(
            events.last(),
            Some(TurnEvent::Error { error }) if error == "cancelled"
        ));
        let handle = f.engine.manager().handle("cancel").await.unwrap();
        assert!(handle
            .context()
            .lock()
            .await
            .snapshot()
            .iter()
            .any(|m| matches!(m, Message::User { .. })));
    }

    // ── Event stream invariants ───────────────────────────────────────────────

    #[tokio::test]
    async fn every_turn_has_exactly_one_terminal_event() {
        let f = fixture();
        scripted_session(
            &f,
            "terminal",
            ScriptedMockAdapter::new(vec![
                tool_call_script("c1", "calc__add", r#"{"a":1,"b":2}"#),
                vec![ProviderEvent::ContentDelta("done".into()), ProviderEvent::Done],
            ]),
        )
        .await;
        attach_calc(&f, "terminal").await;

        let rx = f.engine.run("terminal", "go", RunOptions::default()).await.unwrap();
        let events = collect(rx).await;
        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn tool_results_follow_their_calls_in_order() {
        let f = fixture();
        scripted_session(
            &f,
            "order",
            ScriptedMockAdapter::new(vec![
                vec![
                    ProviderEvent::ToolCallBegin { id: "a".into(), name: "calc__add".into() },
                    ProviderEvent::ToolCallArgumentsDelta {
                        id: "a".into(),
                        delta: r#"{"a":1,"b":0}"#.into(),
                    },
                    ProviderEvent::ToolCallBegin { id: "b".into(), name: "calc__add".into() },
                    ProviderEvent::ToolCallArgumentsDelta {
                        id: "b".into(),
                        delta: r#"{"a":2,"b":0}"#.into(),
                    },
                    ProviderEvent::ToolCallEnd { id: "a".into() },
                    ProviderEvent::ToolCallEnd { id: "b".into() },
                    ProviderEvent::Done,
                ],
                vec![ProviderEvent::ContentDelta("ok".into()), ProviderEvent::Done],
            ]),
        )
        .await;
        attach_calc(&f, "order").await;

        let rx = f.engine.run("order", "go", RunOptions::default()).await.unwrap();
        let events = collect(rx).await;

        let sums: Vec<i64> = events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::ToolResult { result, .. } => result["sum"].as_i64(),
                _ => None,
            })
            .collect();
        assert_eq!(sums, vec![1, 2], "results follow presentation order");
    }

    #[tokio::test]
    async fn turn_log_is_written() {
        let f = fixture();
        scripted_session(&f, "logged", ScriptedMockAdapter::always_text("hi")).await;
        let rx = f.engine.run("logged", "go", RunOptions::default()).await.unwrap();
        collect(rx).await;

        // The spawned turn task appends the log after the stream closes;
        // poll briefly for it.
        let handle = f.engine.manager().handle("logged").await.unwrap();
        let path = handle.dir().join("logs").join("turns.jsonl");
        for _ in 0..50 {
            if path.is_file() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.lines().any(|l| l.contains(r#""type":"complete""#)));
    }
}
