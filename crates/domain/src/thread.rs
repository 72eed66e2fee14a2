//! Thread records — one per conversation, owner of the turn state machine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Streaming,
    AwaitingToolResults,
    Completed,
    Failed,
    Stopped,
}

impl ThreadStatus {
    /// Idle statuses allow `resume_thread` without a new prompt.
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

/// A conversation thread.
///
/// `seq` is the monotonic stream counter: every stream allocated for this
/// thread gets the next value, and `active_stream` points at the stream the
/// thread currently considers its own (pending or streaming).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: Uuid,
    pub status: ThreadStatus,
    /// Cooperative cancel flag; observed at the next decision point.
    pub stop_signal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_stream: Option<Uuid>,
    /// Set while a live handler should re-enter `continue_stream` at
    /// finalize instead of a new stream being allocated immediately.
    #[serde(rename = "continue")]
    pub continue_requested: bool,
    pub seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_state: Option<RetryState>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Thread {
    pub fn new(now: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: ThreadStatus::Completed,
            stop_signal: false,
            active_stream: None,
            continue_requested: false,
            seq: 0,
            retry_state: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Stream-scope retry bookkeeping, present iff a retry is scheduled or a
/// retried attempt is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryState {
    pub attempt: u32,
    pub max_attempts: u32,
    pub next_retry_at: i64,
    /// Normalized message of the error that triggered the retry.
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    pub retryable: bool,
    pub requires_explicit_handling: bool,
    /// Scheduled re-entry into `continue_stream`, when still pending.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_fn_id: Option<Uuid>,
}
