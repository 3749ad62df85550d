// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use chrono::{DateTime, Utc};
use otto_memory::MemoryStore;
use otto_model::Message;
use tracing::debug;

/// Per-session conversation context.
///
/// Invariants:
/// - the system instruction, when present, sits at index 0 and is unique;
/// - when the history exceeds `max_messages`, the oldest non-system
///   message is dropped first;
/// - prompt assembly never separates a tool reply from the assistant
///   message that introduced its call id.
pub struct Context {
    messages: Vec<Message>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    max_messages: usize,
    max_context_length: usize,
    memory_enabled: bool,
    memory_context_size: usize,
    memory: Arc<MemoryStore>,
}

impl Context {
    pub fn new(
        system_prompt: Option<&str>,
        max_messages: usize,
        max_context_length: usize,
        memory_enabled: bool,
        memory_context_size: usize,
        memory: Arc<MemoryStore>,
    ) -> Self {
        let now = Utc::now();
        let mut messages = Vec::new();
        if let Some(prompt) = system_prompt {
            if !prompt.is_empty() {
                messages.push(Message::system(prompt));
            }
        }
        Self {
            messages,
            created_at: now,
            updated_at: now,
            max_messages: max_messages.max(2),
            max_context_length: max_context_length.max(1),
            memory_enabled,
            memory_context_size,
            memory,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn max_context_length(&self) -> usize {
        self.max_context_length
    }

    /// Append a message, enforcing the history cap.
    ///
    /// A system message replaces the existing instruction (or becomes
    /// index 0) instead of being appended.
    pub fn append(&mut self, message: Message) {
        self.updated_at = Utc::now();
        if message.is_system() {
            match self.messages.first() {
                Some(m) if m.is_system() => self.messages[0] = message,
                _ => self.messages.insert(0, message),
            }
            return;
        }
        self.messages.push(message);
        while self.messages.len() > self.max_messages {
            let Some(oldest) = self.messages.iter().position(|m| !m.is_system()) else {
                break;
            };
            debug!("context cap reached; dropping oldest non-system message");
            self.messages.remove(oldest);
        }
    }

    /// Ordered copy of the history for external inspection.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Reset the history, optionally preserving the system instruction.
    pub fn clear_history(&mut self, keep_system: bool) {
        if keep_system {
            self.messages.retain(Message::is_system);
        } else {
            self.messages.clear();
        }
        self.updated_at = Utc::now();
    }

    /// Assemble the prompt for a model call: the system instruction,
    /// memory-derived system-channel blocks, and up to `limit` most-recent
    /// messages with tool pairs kept contiguous.
    ///
    /// Memory blocks are synthesized per call and never persist in the
    /// history.
    pub async fn assemble_prompt(&self, limit: usize) -> Vec<Message> {
        let mut prompt: Vec<Message> = Vec::new();
        let system = self.messages.first().filter(|m| m.is_system()).cloned();
        if let Some(sys) = system {
            prompt.push(sys);
        }

        if self.memory_enabled && self.memory_context_size > 0 {
            if let Some(query) = self.last_user_text() {
                let hits = self.memory.search(&query, self.memory_context_size).await;
                if !hits.is_empty() {
                    let block = hits
                        .iter()
                        .map(|h| format!("- {}", h.record.content))
                        .collect::<Vec<_>>()
                        .join("\n");
                    prompt.push(Message::system(format!(
                        "Relevant memories for this conversation:\n{block}"
                    )));
                }
            }
        }

        let non_system: Vec<&Message> = self.messages.iter().filter(|m| !m.is_system()).collect();
        let mut start = non_system.len().saturating_sub(limit);
        // Never let the window open on a tool reply: walk back to include
        // the assistant message that issued the calls.
        while start > 0 && non_system[start].is_tool() {
            start -= 1;
        }
        // The history cap may have dropped that assistant entirely; skip
        // orphaned replies rather than sending danglers to the provider.
        while start < non_system.len() && non_system[start].is_tool() {
            start += 1;
        }
        prompt.extend(non_system[start..].iter().map(|m| (*m).clone()));
        prompt
    }

    fn last_user_text(&self) -> Option<String> {
        self.messages.iter().rev().find_map(|m| match m {
            Message::User { content, .. } => Some(content.clone()),
            _ => None,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
