use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shared error type used across all Strand crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("thread {0} is not resumable")]
    NotResumable(Uuid),

    #[error("thread {0} has a retry scheduled; stop the thread first")]
    RetryPending(Uuid),

    #[error("stream {stream_id} is locked by another handler")]
    LockedByOther { stream_id: Uuid },

    #[error("stream {stream_id} is no longer the thread's active stream")]
    ThreadActiveMismatch { stream_id: Uuid },

    #[error("duplicate tool call {tool_call_id} on thread {thread_id}")]
    DuplicateToolCall {
        thread_id: Uuid,
        tool_call_id: String,
    },

    #[error("invalid parameters for tool {tool}: {reason}")]
    InvalidToolParameters { tool: String, reason: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stream-level error taxonomy assigned by the retry classifier.
///
/// `ToolExecution` is never produced by classification — it tags errors that
/// originated inside a tool handler when they are surfaced to user callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    RateLimited,
    #[serde(rename = "provider_5xx")]
    Provider5xx,
    ContextWindowExceeded,
    InsufficientCredits,
    InvalidRequest,
    Auth,
    ToolExecution,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_snake_case_serialization() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::Provider5xx).unwrap(),
            "\"provider_5xx\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::ContextWindowExceeded).unwrap(),
            "\"context_window_exceeded\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::RateLimited).unwrap(),
            "\"rate_limited\""
        );
    }

    #[test]
    fn error_kind_roundtrip() {
        for kind in [
            ErrorKind::Network,
            ErrorKind::RateLimited,
            ErrorKind::Provider5xx,
            ErrorKind::ContextWindowExceeded,
            ErrorKind::InsufficientCredits,
            ErrorKind::InvalidRequest,
            ErrorKind::Auth,
            ErrorKind::ToolExecution,
            ErrorKind::Unknown,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            let back: ErrorKind = serde_json::from_str(&json).unwrap();
            assert_eq!(kind, back);
        }
    }
}
