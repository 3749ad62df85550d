use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Conversation messages ────────────────────────────────────────────────────

/// One tool invocation requested by the model within an assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Opaque identifier assigned by the provider (forwarded verbatim).
    pub id: String,
    /// Qualified tool name (`<server>__<tool>`).
    pub name: String,
    /// Parsed JSON arguments.
    pub arguments: Value,
}

/// A single message in a session's conversation history.
///
/// The assistant variant stores text content and tool calls together: a
/// provider that interleaves both in one response produces exactly one
/// assistant message.  Tool messages reply to a specific call id introduced
/// by the preceding assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
        timestamp: DateTime<Utc>,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
        timestamp: DateTime<Utc>,
    },
    Tool {
        call_id: String,
        tool_name: String,
        result: Value,
        is_error: bool,
        timestamp: DateTime<Utc>,
    },
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::System {
            content: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            content: text.into(),
            tool_calls: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant_with_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self::Assistant {
            content: text.into(),
            tool_calls,
            timestamp: Utc::now(),
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        result: Value,
        is_error: bool,
    ) -> Self {
        Self::Tool {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            result,
            is_error,
            timestamp: Utc::now(),
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System { .. })
    }

    pub fn is_tool(&self) -> bool {
        matches!(self, Self::Tool { .. })
    }

    /// Plain text of this message; tool results render as their JSON.
    pub fn text(&self) -> String {
        match self {
            Self::System { content } | Self::User { content, .. } => content.clone(),
            Self::Assistant { content, .. } => content.clone(),
            Self::Tool { result, .. } => match result {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        }
    }
}

// ─── Tool schemas ─────────────────────────────────────────────────────────────

/// A tool description provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

// ─── Requests and streamed events ─────────────────────────────────────────────

/// Request sent to a model adapter.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
}

/// A single streamed event from a model adapter.
///
/// Tool calls arrive as a begin / arguments-deltas / end triple so the
/// engine can forward call boundaries without buffering the whole response.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// A text chunk streamed from the model.
    ContentDelta(String),
    /// The model opened a tool call.
    ToolCallBegin { id: String, name: String },
    /// A fragment of the call's JSON arguments.
    ToolCallArgumentsDelta { id: String, delta: String },
    /// The tool call's arguments are complete.
    ToolCallEnd { id: String },
    /// The stream finished normally.
    Done,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
