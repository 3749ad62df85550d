// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{adapter::ProviderStream, ChatRequest, Message, ProviderEvent};

/// Deterministic mock adapter for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default, Debug)]
pub struct MockAdapter;

#[async_trait]
impl crate::ModelAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<ProviderStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find_map(|m| match m {
                Message::User { content, .. } => Some(content.clone()),
                _ => None,
            })
            .unwrap_or_else(|| "[no input]".into());

        let events: Vec<anyhow::Result<ProviderEvent>> = vec![
            Ok(ProviderEvent::ContentDelta(format!("MOCK: {reply}"))),
            Ok(ProviderEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted mock adapter.  Each call to `chat_stream` pops the next
/// response script from the front of the queue.  This lets tests specify
/// exact event sequences — including tool calls — without network access.
#[derive(Debug)]
pub struct ScriptedMockAdapter {
    scripts: Arc<Mutex<Vec<Vec<ProviderEvent>>>>,
    /// Error injected before any script is served (provider failure path).
    fail_first: Arc<Mutex<bool>>,
    /// The last [`ChatRequest`] seen by this adapter.
    /// Written on each `chat_stream` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<ChatRequest>>>,
}

impl ScriptedMockAdapter {
    /// Build an adapter from a list of response scripts.
    /// The outer `Vec` is the ordered list of calls; the inner `Vec` is the
    /// sequence of [`ProviderEvent`]s emitted for that call.
    pub fn new(scripts: Vec<Vec<ProviderEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            fail_first: Arc::new(Mutex::new(false)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: adapter that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![
            ProviderEvent::ContentDelta(reply.into()),
            ProviderEvent::Done,
        ]])
    }

    /// Convenience: adapter that emits a tool call, then a text reply on the
    /// next round.
    pub fn tool_then_text(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        let id = call_id.into();
        Self::new(vec![
            // Round 1 — model emits a tool call
            vec![
                ProviderEvent::ToolCallBegin {
                    id: id.clone(),
                    name: tool_name.into(),
                },
                ProviderEvent::ToolCallArgumentsDelta {
                    id: id.clone(),
                    delta: args_json.into(),
                },
                ProviderEvent::ToolCallEnd { id },
                ProviderEvent::Done,
            ],
            // Round 2 — model responds after the tool result
            vec![
                ProviderEvent::ContentDelta(final_text.into()),
                ProviderEvent::Done,
            ],
        ])
    }

    /// Make the next `chat_stream` call fail with a provider error.
    pub fn fail_next(self) -> Self {
        *self.fail_first.lock().unwrap() = true;
        self
    }
}

#[async_trait]
impl crate::ModelAdapter for ScriptedMockAdapter {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<ProviderStream> {
        *self.last_request.lock().unwrap() = Some(req);
        {
            let mut fail = self.fail_first.lock().unwrap();
            if *fail {
                *fail = false;
                anyhow::bail!("scripted provider failure");
            }
        }
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                vec![
                    ProviderEvent::ContentDelta("[no more scripts]".into()),
                    ProviderEvent::Done,
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<ProviderEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
