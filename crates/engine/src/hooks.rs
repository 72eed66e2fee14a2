//! User-supplied callbacks fired by the engine at turn boundaries.
//!
//! All hooks are optional and synchronous; they run outside store
//! transactions, so a hook may call back into the engine safely.

use std::sync::Arc;

use uuid::Uuid;

use strand_domain::{ErrorKind, ThreadStatus};

use crate::provider::ModelMessage;
use crate::retry::Classification;

/// Fired whenever a thread's status changes.
pub type StatusHook = Arc<dyn Fn(Uuid, ThreadStatus) + Send + Sync>;

/// Fired when a turn reaches `completed`.
pub type TurnCompleteHook = Arc<dyn Fn(Uuid) + Send + Sync>;

/// Fired when a turn fails permanently (no retry).
pub type ErrorHook = Arc<dyn Fn(Uuid, &TurnFailure) + Send + Sync>;

/// Fired when a stream retry is scheduled.
pub type RetryHook = Arc<dyn Fn(Uuid, &RetryNotice) + Send + Sync>;

/// Rewrite the model input right before the provider call.
pub type TransformMessagesHook =
    Arc<dyn Fn(Vec<ModelMessage>) -> Vec<ModelMessage> + Send + Sync>;

/// Override the default retry decision for a stream error.
pub type ClassifyRetryHook = Arc<dyn Fn(&RetryDecisionInput<'_>) -> RetryDecision + Send + Sync>;

#[derive(Default, Clone)]
pub struct EngineHooks {
    pub on_status_change: Option<StatusHook>,
    pub on_turn_complete: Option<TurnCompleteHook>,
    pub on_error: Option<ErrorHook>,
    pub on_retry: Option<RetryHook>,
    pub transform_messages: Option<TransformMessagesHook>,
    pub classify_retry: Option<ClassifyRetryHook>,
}

/// Payload of `on_error`: a permanent turn failure.
#[derive(Debug, Clone)]
pub struct TurnFailure {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub requires_explicit_handling: bool,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Normalized error message.
    pub message: String,
}

/// Payload of `on_retry`: a scheduled re-attempt.
#[derive(Debug, Clone)]
pub struct RetryNotice {
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub kind: Option<ErrorKind>,
    pub message: String,
}

/// Everything a custom `classify_retry` hook sees.
pub struct RetryDecisionInput<'a> {
    pub attempt: u32,
    pub max_attempts: u32,
    pub tool_calls_scheduled: usize,
    pub stream_part_count: usize,
    pub classification: &'a Classification,
    pub default_decision: RetryDecision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry, optionally overriding the computed delay.
    Retry { delay_ms: Option<u64> },
    Fail,
}

impl RetryDecision {
    pub fn is_retry(self) -> bool {
        matches!(self, Self::Retry { .. })
    }

    pub fn delay_override(self) -> Option<u64> {
        match self {
            Self::Retry { delay_ms } => delay_ms,
            Self::Fail => None,
        }
    }
}
