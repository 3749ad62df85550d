// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The iteration engine: drives the bounded think → act loop for one turn
//! and emits the ordered [`TurnEvent`] stream.

use std::sync::Arc;

use futures::StreamExt;
use otto_model::{ChatRequest, Message, ProviderEvent, ToolCall, ToolSchema};
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::CoreError, events::TurnEvent, manager::SessionManager, session::SessionHandle,
};

/// Options for one `run` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Override of the session's iteration bound; clamped to it.
    pub max_iterations: Option<u32>,
    /// Cooperative cancellation; checked at iteration tops and raced
    /// against model and tool awaits.
    pub cancel: CancellationToken,
}

/// The engine: session lookup, per-session turn serialization, and a
/// global worker budget across sessions.
pub struct Engine {
    manager: Arc<SessionManager>,
    turn_permits: Arc<Semaphore>,
}

impl Engine {
    pub fn new(manager: Arc<SessionManager>, worker_cap: usize) -> Self {
        Self {
            manager,
            turn_permits: Arc::new(Semaphore::new(worker_cap.max(1))),
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Start one turn.  Returns the event stream; the turn itself runs on a
    /// spawned task.
    ///
    /// Fails fast — without touching the session's context — when the input
    /// is empty, the session does not exist, or another turn is active.
    pub async fn run(
        &self,
        session_id: &str,
        user_input: &str,
        opts: RunOptions,
    ) -> Result<mpsc::Receiver<TurnEvent>, CoreError> {
        if user_input.trim().is_empty() {
            return Err(CoreError::invalid("user message must not be empty"));
        }
        let handle = self.manager.initialize(session_id).await?;

        // At most one turn per session: contention is an immediate Busy.
        let guard = Arc::clone(handle.turn_lock())
            .try_lock_owned()
            .map_err(|_| CoreError::Busy(session_id.to_string()))?;

        let config = handle.config().await;
        let session_max = config.agent.max_iterations.max(1);
        let max_iterations = match opts.max_iterations {
            Some(0) => return Err(CoreError::invalid("max_iterations must be positive")),
            Some(n) => n.min(session_max),
            None => session_max,
        };

        let (tx, rx) = mpsc::channel(64);
        let permits = Arc::clone(&self.turn_permits);
        let user_input = user_input.to_string();
        let cancel = opts.cancel;
        tokio::spawn(async move {
            let _guard = guard;
            // Global turn budget; a closed semaphore only happens at
            // process teardown, where running unthrottled is harmless.
            let _permit = permits.acquire_owned().await.ok();
            let mut emitted: Vec<TurnEvent> = Vec::new();
            run_turn(&handle, &user_input, max_iterations, cancel, &tx, &mut emitted).await;
            handle.append_turn_log(&emitted);
        });
        Ok(rx)
    }
}

async fn emit(
    tx: &mpsc::Sender<TurnEvent>,
    emitted: &mut Vec<TurnEvent>,
    event: TurnEvent,
) {
    emitted.push(event.clone());
    // A dropped receiver must not abort the turn: context mutations are
    // persisted regardless of whether anyone is still watching.
    let _ = tx.send(event).await;
}

/// One buffered tool call being accumulated from begin/delta/end events.
struct PendingCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingCall {
    fn finish(self) -> ToolCall {
        let arguments = if self.args_buf.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        tool = %self.name,
                        call_id = %self.id,
                        error = %e,
                        "model sent unparseable tool arguments; substituting {{}}"
                    );
                    json!({})
                }
            }
        };
        ToolCall {
            id: self.id,
            name: self.name,
            arguments,
        }
    }
}

/// Abort a round whose tool calls were announced but will never run.
///
/// The partial assistant message (text plus the calls) is committed, and
/// each call gets an error-flagged reply in the history and a failed
/// `ToolResult` on the stream.  Every `ToolCall` event therefore has a
/// matching `ToolResult` even on turns that end in `Error`, and no stored
/// call id is left dangling.
async fn abort_announced_calls(
    handle: &Arc<SessionHandle>,
    text: &str,
    calls: &[ToolCall],
    reason: &str,
    tx: &mpsc::Sender<TurnEvent>,
    emitted: &mut Vec<TurnEvent>,
) {
    {
        let mut ctx = handle.context().lock().await;
        ctx.append(Message::assistant_with_calls(text, calls.to_vec()));
        for call in calls {
            ctx.append(Message::tool_result(&call.id, &call.name, json!(reason), true));
        }
    }
    for call in calls {
        emit(
            tx,
            emitted,
            TurnEvent::ToolResult {
                tool: call.name.clone(),
                success: false,
                result: json!(reason),
            },
        )
        .await;
    }
}

/// Drive a whole turn.  Emits events in production order and guarantees a
/// single terminal event.
async fn run_turn(
    handle: &Arc<SessionHandle>,
    user_input: &str,
    max_iterations: u32,
    cancel: CancellationToken,
    tx: &mpsc::Sender<TurnEvent>,
    emitted: &mut Vec<TurnEvent>,
) {
    handle
        .context()
        .lock()
        .await
        .append(Message::user(user_input));

    let adapter = match handle.adapter() {
        Ok(a) => a,
        Err(e) => {
            emit(tx, emitted, TurnEvent::Error { error: e.to_string() }).await;
            return;
        }
    };

    let mut last_assistant_text = String::new();

    for iteration in 1..=max_iterations {
        if cancel.is_cancelled() {
            emit(tx, emitted, TurnEvent::Error { error: "cancelled".into() }).await;
            return;
        }
        emit(
            tx,
            emitted,
            TurnEvent::Iteration {
                current: iteration,
                max: max_iterations,
            },
        )
        .await;

        let prompt = {
            let ctx = handle.context().lock().await;
            let limit = ctx.max_context_length();
            ctx.assemble_prompt(limit).await
        };

        let tools: Vec<ToolSchema> = handle
            .pool()
            .list_tools()
            .await
            .into_iter()
            .map(|d| ToolSchema {
                name: d.name,
                description: d.description,
                parameters: d.input_schema,
            })
            .collect();
        debug!(iteration, tools = tools.len(), "starting model round");

        let mut stream = match adapter
            .chat_stream(ChatRequest {
                messages: prompt,
                tools,
            })
            .await
        {
            Ok(s) => s,
            Err(e) => {
                // The user message stays in context; no assistant message
                // is appended for a failed round.
                emit(tx, emitted, TurnEvent::Error { error: e.to_string() }).await;
                return;
            }
        };

        let mut text = String::new();
        let mut calls: Vec<ToolCall> = Vec::new();
        let mut pending: Vec<PendingCall> = Vec::new();
        let mut stream_error: Option<String> = None;
        let mut cancelled = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                ev = stream.next() => ev,
            };
            // A stream that ends without `Done` is treated as done: the
            // adapter owns the provider's termination grammar.
            let Some(event) = next else { break };
            match event {
                Ok(ProviderEvent::ContentDelta(delta)) => {
                    if !delta.is_empty() {
                        text.push_str(&delta);
                        emit(tx, emitted, TurnEvent::Content { content: delta }).await;
                    }
                }
                Ok(ProviderEvent::ToolCallBegin { id, name }) => {
                    pending.push(PendingCall {
                        id,
                        name,
                        args_buf: String::new(),
                    });
                }
                Ok(ProviderEvent::ToolCallArgumentsDelta { id, delta }) => {
                    if let Some(p) = pending.iter_mut().find(|p| p.id == id) {
                        p.args_buf.push_str(&delta);
                    }
                }
                Ok(ProviderEvent::ToolCallEnd { id }) => {
                    if let Some(pos) = pending.iter().position(|p| p.id == id) {
                        let call = pending.remove(pos).finish();
                        emit(
                            tx,
                            emitted,
                            TurnEvent::ToolCall {
                                tool: call.name.clone(),
                                arguments: call.arguments.clone(),
                            },
                        )
                        .await;
                        calls.push(call);
                    }
                }
                Ok(ProviderEvent::Done) => break,
                Err(e) => {
                    stream_error = Some(e.to_string());
                    break;
                }
            }
        }

        if let Some(error) = stream_error {
            // The stream may have fully announced tool calls before dying.
            // Close them out so the turn's ToolCall/ToolResult events stay
            // balanced; a plain failure (no calls) appends nothing — the
            // user message alone is retained.
            if !calls.is_empty() {
                abort_announced_calls(handle, &text, &calls, "model stream failed", tx, emitted)
                    .await;
            }
            emit(tx, emitted, TurnEvent::Error { error }).await;
            return;
        }

        if cancelled {
            // Persist the partial turn: whatever streamed before the cut
            // stays in context, and every announced call gets a cancelled
            // reply so the history never carries a dangling call id.
            if !text.is_empty() || !calls.is_empty() {
                abort_announced_calls(handle, &text, &calls, "cancelled", tx, emitted).await;
            }
            emit(tx, emitted, TurnEvent::Error { error: "cancelled".into() }).await;
            return;
        }

        handle
            .context()
            .lock()
            .await
            .append(Message::assistant_with_calls(text.clone(), calls.clone()));
        if !text.is_empty() {
            last_assistant_text = text.clone();
        }

        if calls.is_empty() {
            emit(
                tx,
                emitted,
                TurnEvent::Complete {
                    final_response: text,
                    iterations: iteration,
                },
            )
            .await;
            return;
        }

        // Execute the calls in presentation order.  Failures are recorded
        // for the model and never abort the turn.
        let mut executed = 0usize;
        for call in &calls {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                out = handle.pool().call(&call.name, call.arguments.clone()) => Some(out),
            };
            let Some(outcome) = outcome else { break };
            executed += 1;
            emit(
                tx,
                emitted,
                TurnEvent::ToolResult {
                    tool: call.name.clone(),
                    success: outcome.ok,
                    result: outcome.result.clone(),
                },
            )
            .await;
            handle.context().lock().await.append(Message::tool_result(
                &call.id,
                &call.name,
                outcome.result,
                !outcome.ok,
            ));
        }

        if executed < calls.len() {
            // Cancelled mid-batch: close out the remaining calls so both
            // the event stream and the history stay balanced.
            for call in &calls[executed..] {
                emit(
                    tx,
                    emitted,
                    TurnEvent::ToolResult {
                        tool: call.name.clone(),
                        success: false,
                        result: json!("cancelled"),
                    },
                )
                .await;
                handle.context().lock().await.append(Message::tool_result(
                    &call.id,
                    &call.name,
                    json!("cancelled"),
                    true,
                ));
            }
            emit(tx, emitted, TurnEvent::Error { error: "cancelled".into() }).await;
            return;
        }
    }

    // Iteration bound reached with the model still asking for tools: the
    // last assistant text is the final response.
    emit(
        tx,
        emitted,
        TurnEvent::Complete {
            final_response: last_assistant_text,
            iterations: max_iterations,
        },
    )
    .await;
}
