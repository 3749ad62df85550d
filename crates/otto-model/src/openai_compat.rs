// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI-compatible chat-completions driver.
//!
//! Covers the hosted OpenAI API and every server that speaks the same wire
//! format (gateways, Ollama, vLLM, llama.cpp).  The driver owns two
//! conversions: internal [`Message`]/[`ToolSchema`] records → request JSON,
//! and streamed SSE chunks → [`ProviderEvent`]s.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    adapter::ProviderStream, sse::data_lines, ChatRequest, Message, ProviderEvent, ToolSchema,
};

#[derive(Debug)]
pub struct OpenAiCompatAdapter {
    driver_id: String,
    model: String,
    api_key: Option<String>,
    chat_url: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl OpenAiCompatAdapter {
    pub fn new(
        driver_id: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        base_url: impl Into<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        let base = base_url.into();
        Self {
            driver_id: driver_id.into(),
            model: model.into(),
            api_key,
            chat_url: format!("{}/chat/completions", base.trim_end_matches('/')),
            max_tokens,
            temperature,
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": build_openai_messages(&req.messages),
            "stream": true,
        });
        if let Some(mt) = self.max_tokens {
            body["max_tokens"] = json!(mt);
        }
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        if !req.tools.is_empty() {
            body["tools"] = json!(build_openai_tools(&req.tools));
        }
        body
    }
}

#[async_trait]
impl crate::ModelAdapter for OpenAiCompatAdapter {
    fn name(&self) -> &str {
        &self.driver_id
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<ProviderStream> {
        let body = self.build_body(&req);
        debug!(driver = %self.driver_id, model = %self.model, tools = req.tools.len(),
               "sending chat completion request");

        let mut request = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let resp = request
            .send()
            .await
            .with_context(|| format!("{} request failed", self.driver_id))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.driver_id);
        }

        let lines = data_lines(resp.bytes_stream());
        let events = lines
            .scan(ToolCallTracker::default(), |tracker, line| {
                let out = match line {
                    Ok(data) => tracker.feed(&data),
                    Err(e) => vec![Err(e)],
                };
                futures::future::ready(Some(out))
            })
            .flat_map(futures::stream::iter);
        Ok(Box::pin(events))
    }
}

// ─── Stream chunk → event conversion ──────────────────────────────────────────

/// Per-response state for converting chat-completion chunks into events.
///
/// OpenAI carries each tool call's id and name only in its first chunk and
/// keys subsequent argument fragments by array `index`, so the tracker keeps
/// an index → id map and remembers which calls are still open.  Calls are
/// closed either by the `finish_reason` chunk or, for servers that skip it,
/// by the terminal `[DONE]` record.
#[derive(Default)]
struct ToolCallTracker {
    /// index → id for calls that have begun and not yet ended.
    open: Vec<(u64, String)>,
    done_sent: bool,
}

impl ToolCallTracker {
    fn feed(&mut self, data: &str) -> Vec<anyhow::Result<ProviderEvent>> {
        if data == "[DONE]" {
            let mut out = self.close_all();
            if !self.done_sent {
                self.done_sent = true;
                out.push(Ok(ProviderEvent::Done));
            }
            return out;
        }
        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            // Tolerate non-JSON keepalive records.
            Err(_) => return vec![],
        };
        let Some(choice) = v["choices"].get(0) else {
            return vec![];
        };

        let mut out: Vec<anyhow::Result<ProviderEvent>> = Vec::new();
        let delta = &choice["delta"];

        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                out.push(Ok(ProviderEvent::ContentDelta(text.to_string())));
            }
        }

        if let Some(tcs) = delta["tool_calls"].as_array() {
            for tc in tcs {
                let index = tc["index"].as_u64().unwrap_or(0);
                let id = tc["id"].as_str().unwrap_or("");
                let name = tc["function"]["name"].as_str().unwrap_or("");
                if !id.is_empty() || !name.is_empty() {
                    if !self.open.iter().any(|(i, _)| *i == index) {
                        let id = if id.is_empty() {
                            // Servers that omit ids get a synthetic stable one.
                            format!("call_{index}")
                        } else {
                            id.to_string()
                        };
                        self.open.push((index, id.clone()));
                        out.push(Ok(ProviderEvent::ToolCallBegin {
                            id,
                            name: name.to_string(),
                        }));
                    }
                }
                if let Some(args) = tc["function"]["arguments"].as_str() {
                    if !args.is_empty() {
                        if let Some((_, id)) = self.open.iter().find(|(i, _)| *i == index) {
                            out.push(Ok(ProviderEvent::ToolCallArgumentsDelta {
                                id: id.clone(),
                                delta: args.to_string(),
                            }));
                        }
                    }
                }
            }
        }

        if choice["finish_reason"].as_str().is_some() {
            out.extend(self.close_all());
        }
        out
    }

    fn close_all(&mut self) -> Vec<anyhow::Result<ProviderEvent>> {
        let mut open = std::mem::take(&mut self.open);
        open.sort_by_key(|(i, _)| *i);
        open.into_iter()
            .map(|(_, id)| Ok(ProviderEvent::ToolCallEnd { id }))
            .collect()
    }
}

// ─── Message → wire conversion ────────────────────────────────────────────────

pub(crate) fn build_openai_messages(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        match m {
            Message::System { content } => {
                out.push(json!({ "role": "system", "content": content }));
            }
            Message::User { content, .. } => {
                out.push(json!({ "role": "user", "content": content }));
            }
            Message::Assistant {
                content,
                tool_calls,
                ..
            } => {
                let mut msg = json!({ "role": "assistant", "content": content });
                if !tool_calls.is_empty() {
                    let calls: Vec<Value> = tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.arguments.to_string(),
                                }
                            })
                        })
                        .collect();
                    msg["tool_calls"] = json!(calls);
                }
                out.push(msg);
            }
            Message::Tool {
                call_id, result, ..
            } => {
                let content = match result {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": content,
                }));
            }
        }
    }
    out
}

pub(crate) fn build_openai_tools(tools: &[ToolSchema]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
