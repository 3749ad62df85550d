// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    adapter::ProviderStream, sse::data_lines, ChatRequest, Message, ProviderEvent, ToolSchema,
};

#[derive(Debug)]
pub struct AnthropicAdapter {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(
        model: impl Into<String>,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        Self {
            model: model.into(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let (system_text, messages) = build_anthropic_messages(&req.messages);
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": true,
        });
        if !system_text.is_empty() {
            body["system"] = json!(system_text);
        }
        if !req.tools.is_empty() {
            body["tools"] = json!(build_anthropic_tools(&req.tools));
        }
        body
    }
}

#[async_trait]
impl crate::ModelAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<ProviderStream> {
        let key = self
            .api_key
            .as_deref()
            .context("ANTHROPIC_API_KEY not set")?;
        let body = self.build_body(&req);
        debug!(model = %self.model, tools = req.tools.len(), "sending anthropic request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("Anthropic request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Anthropic error {status}: {text}");
        }

        let lines = data_lines(resp.bytes_stream());
        let events = lines
            .scan(BlockTracker::default(), |tracker, line| {
                let out = match line {
                    Ok(data) => match serde_json::from_str::<Value>(&data) {
                        Ok(v) => tracker.feed(&v),
                        Err(_) => vec![],
                    },
                    Err(e) => vec![Err(e)],
                };
                futures::future::ready(Some(out))
            })
            .flat_map(futures::stream::iter);
        Ok(Box::pin(events))
    }
}

// ─── Stream event → ProviderEvent conversion ──────────────────────────────────

/// Maps Anthropic's content-block grammar onto begin/delta/end tool events.
///
/// `content_block_start` with a `tool_use` block opens a call (the only
/// event carrying id and name); `input_json_delta` fragments are keyed by
/// block index; `content_block_stop` on a tracked index closes the call.
#[derive(Default)]
struct BlockTracker {
    /// index → call id for open tool_use blocks.
    open: Vec<(u64, String)>,
}

impl BlockTracker {
    fn feed(&mut self, v: &Value) -> Vec<anyhow::Result<ProviderEvent>> {
        match v["type"].as_str().unwrap_or("") {
            "content_block_start" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let block = &v["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    let id = block["id"].as_str().unwrap_or("").to_string();
                    let name = block["name"].as_str().unwrap_or("").to_string();
                    self.open.push((index, id.clone()));
                    return vec![Ok(ProviderEvent::ToolCallBegin { id, name })];
                }
                vec![]
            }
            "content_block_delta" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        let text = delta["text"].as_str().unwrap_or("");
                        if text.is_empty() {
                            vec![]
                        } else {
                            vec![Ok(ProviderEvent::ContentDelta(text.to_string()))]
                        }
                    }
                    "input_json_delta" => {
                        let partial = delta["partial_json"].as_str().unwrap_or("");
                        if partial.is_empty() {
                            return vec![];
                        }
                        match self.open.iter().find(|(i, _)| *i == index) {
                            Some((_, id)) => vec![Ok(ProviderEvent::ToolCallArgumentsDelta {
                                id: id.clone(),
                                delta: partial.to_string(),
                            })],
                            None => vec![],
                        }
                    }
                    _ => vec![],
                }
            }
            "content_block_stop" => {
                let index = v["index"].as_u64().unwrap_or(0);
                if let Some(pos) = self.open.iter().position(|(i, _)| *i == index) {
                    let (_, id) = self.open.remove(pos);
                    return vec![Ok(ProviderEvent::ToolCallEnd { id })];
                }
                vec![]
            }
            "message_stop" => vec![Ok(ProviderEvent::Done)],
            "error" => {
                let msg = v["error"]["message"].as_str().unwrap_or("unknown error");
                vec![Err(anyhow::anyhow!("Anthropic stream error: {msg}"))]
            }
            _ => vec![],
        }
    }
}

// ─── Message → wire conversion ────────────────────────────────────────────────

/// Convert internal messages into the Anthropic wire format.
///
/// Returns `(system_text, conversation_messages)` — Anthropic takes the
/// system instruction as a top-level field.  An assistant turn carries its
/// text and all tool_use blocks in one message; the consecutive tool replies
/// that follow it are merged into a single user message so every
/// `tool_result` block immediately follows its `tool_use` turn.
pub(crate) fn build_anthropic_messages(messages: &[Message]) -> (String, Vec<Value>) {
    let mut system_text = String::new();
    let mut out: Vec<Value> = Vec::new();
    let mut pending_results: Vec<Value> = Vec::new();

    let flush_results = |pending: &mut Vec<Value>, out: &mut Vec<Value>| {
        if !pending.is_empty() {
            out.push(json!({ "role": "user", "content": std::mem::take(pending) }));
        }
    };

    for m in messages {
        match m {
            // Multiple system-channel messages (the instruction plus injected
            // memory blocks) are concatenated into the single system field.
            Message::System { content } => {
                if !system_text.is_empty() {
                    system_text.push_str("\n\n");
                }
                system_text.push_str(content);
            }
            Message::User { content, .. } => {
                flush_results(&mut pending_results, &mut out);
                out.push(json!({ "role": "user", "content": content }));
            }
            Message::Assistant {
                content,
                tool_calls,
                ..
            } => {
                flush_results(&mut pending_results, &mut out);
                if tool_calls.is_empty() {
                    out.push(json!({ "role": "assistant", "content": content }));
                } else {
                    let mut blocks: Vec<Value> = Vec::new();
                    if !content.is_empty() {
                        blocks.push(json!({ "type": "text", "text": content }));
                    }
                    for tc in tool_calls {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": tc.arguments,
                        }));
                    }
                    out.push(json!({ "role": "assistant", "content": blocks }));
                }
            }
            Message::Tool {
                call_id,
                result,
                is_error,
                ..
            } => {
                let content = match result {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                pending_results.push(json!({
                    "type": "tool_result",
                    "tool_use_id": call_id,
                    "content": content,
                    "is_error": is_error,
                }));
            }
        }
    }
    flush_results(&mut pending_results, &mut out);
    (system_text, out)
}

pub(crate) fn build_anthropic_tools(tools: &[ToolSchema]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters,
            })
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
