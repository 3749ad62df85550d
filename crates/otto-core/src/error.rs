// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Error taxonomy of the runtime's public operations.
///
/// Tool failures are deliberately absent from most paths: a failed tool
/// call is fed back to the model as an error-flagged tool message, not
/// surfaced to the caller.  `Tool` exists for the places that must talk
/// about such a failure as a value (logs, HTTP mapping).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("session '{0}' is busy with another turn")]
    Busy(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("tool server unavailable: {0}")]
    ServerUnavailable(String),
    #[error("tool error: {0}")]
    Tool(String),
    #[error("model provider error: {0}")]
    Provider(String),
    #[error("cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        Self::InvalidInput(what.into())
    }

    pub fn internal(what: impl Into<String>) -> Self {
        Self::Internal(what.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let e = CoreError::Busy("sess-1".into());
        assert_eq!(e.to_string(), "session 'sess-1' is busy with another turn");
    }

    #[test]
    fn cancelled_is_terse() {
        assert_eq!(CoreError::Cancelled.to_string(), "cancelled");
    }
}
