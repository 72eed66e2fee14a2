//! Tool-call records, retry policies, and backoff computation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Completed,
    Failed,
}

impl ToolCallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Whether the result comes from the handler's return (sync) or a later
/// `add_tool_result` / `add_tool_error` call (async).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallKind {
    Sync,
    Async,
}

/// A model-requested tool invocation.
///
/// Transitions pending → completed or pending → failed exactly once; once
/// terminal, no scheduled timeout or retry work remains pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: Uuid,
    pub thread_id: Uuid,
    /// The assistant message carrying the tool-input part.
    pub msg_id: String,
    /// Model-assigned id, unique per thread.
    pub tool_call_id: String,
    pub tool_name: String,
    pub args: Value,
    pub kind: ToolCallKind,
    pub status: ToolCallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Emit a tool-output delta on completion so clients see the outcome
    /// between streams.
    pub save_delta: bool,

    // ── Timeout ────────────────────────────────────────────────────
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_fn_id: Option<Uuid>,

    // ── Sync execution retry ───────────────────────────────────────
    #[serde(default)]
    pub execution_attempt: u32,
    /// Retry policy snapshot. Records written by older versions without
    /// retry fields deserialize as retry-disabled.
    #[serde(default)]
    pub execution_retry_policy: RetryPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_retry_fn_id: Option<Uuid>,

    // ── Async callback notification ────────────────────────────────
    #[serde(default)]
    pub callback_attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_last_error: Option<String>,

    pub created_at: i64,
}

/// Serializable retry policy for sync tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_attempts: 1,
            backoff: Backoff::Fixed {
                delay_ms: 0,
                jitter: false,
            },
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Backoff schedule. `delay_ms(attempt)` is 1-based: the delay before
/// attempt N+1, computed after attempt N failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed {
        delay_ms: u64,
        #[serde(default)]
        jitter: bool,
    },
    Exponential {
        initial_ms: u64,
        multiplier: f64,
        max_ms: u64,
        #[serde(default)]
        jitter: bool,
    },
}

impl Backoff {
    /// Compute the delay after the given failed attempt (1-based). With
    /// jitter, the result is uniform in `[0, delay]` inclusive (full jitter).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let (base, jitter) = match *self {
            Backoff::Fixed { delay_ms, jitter } => (delay_ms, jitter),
            Backoff::Exponential {
                initial_ms,
                multiplier,
                max_ms,
                jitter,
            } => {
                let exp = multiplier.powi(attempt.saturating_sub(1) as i32);
                let raw = (initial_ms as f64 * exp).min(max_ms as f64);
                (raw as u64, jitter)
            }
        };
        if jitter {
            (rand::random::<f64>() * (base + 1) as f64) as u64
        } else {
            base
        }
    }
}

/// Tool definition exposed to the model and registered with the engine.
/// `parameters` is a JSON-Schema object with no `$`-prefixed fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Structured failure from a tool handler or callback; feeds the tool
/// retry predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Explicit retryability override; wins over any heuristic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl ToolError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code: None,
            retryable: None,
        }
    }

    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
            code: None,
            retryable: None,
        }
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {status})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ToolError {}
