// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events emitted during a single turn.
///
/// The serialized form is the runtime's wire grammar: each variant maps to
/// one SSE record, discriminated by the `type` field.  A turn's stream is
/// finite and ends with exactly one `Complete` or one `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// A new model round is starting.
    Iteration { current: u32, max: u32 },
    /// A text chunk streamed from the model.
    Content { content: String },
    /// The model requested a tool call (arguments fully accumulated).
    ToolCall { tool: String, arguments: Value },
    /// A tool call finished.
    ToolResult {
        tool: String,
        success: bool,
        result: Value,
    },
    /// The turn finished normally.
    Complete {
        final_response: String,
        iterations: u32,
    },
    /// The turn failed; the stream ends here.
    Error { error: String },
}

impl TurnEvent {
    /// Whether this event terminates the turn's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_tags_match_the_protocol() {
        let cases = vec![
            (
                TurnEvent::Iteration { current: 1, max: 10 },
                r#"{"type":"iteration","current":1,"max":10}"#,
            ),
            (
                TurnEvent::Content {
                    content: "hi".into(),
                },
                r#"{"type":"content","content":"hi"}"#,
            ),
            (
                TurnEvent::Complete {
                    final_response: "done".into(),
                    iterations: 2,
                },
                r#"{"type":"complete","final_response":"done","iterations":2}"#,
            ),
            (
                TurnEvent::Error {
                    error: "boom".into(),
                },
                r#"{"type":"error","error":"boom"}"#,
            ),
        ];
        for (ev, expected) in cases {
            assert_eq!(serde_json::to_string(&ev).unwrap(), expected);
        }
    }

    #[test]
    fn tool_events_round_trip() {
        let events = vec![
            TurnEvent::ToolCall {
                tool: "calc__add".into(),
                arguments: json!({"a": 1, "b": 2}),
            },
            TurnEvent::ToolResult {
                tool: "calc__add".into(),
                success: true,
                result: json!({"sum": 3}),
            },
        ];
        for ev in events {
            let s = serde_json::to_string(&ev).unwrap();
            let back: TurnEvent = serde_json::from_str(&s).unwrap();
            assert_eq!(back, ev);
        }
    }

    #[test]
    fn only_complete_and_error_are_terminal() {
        assert!(TurnEvent::Complete {
            final_response: String::new(),
            iterations: 1
        }
        .is_terminal());
        assert!(TurnEvent::Error {
            error: String::new()
        }
        .is_terminal());
        assert!(!TurnEvent::Iteration { current: 1, max: 1 }.is_terminal());
        assert!(!TurnEvent::Content {
            content: String::new()
        }
        .is_terminal());
    }
}
