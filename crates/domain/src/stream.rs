//! Stream records and their append-only delta log.
//!
//! A stream is one LLM invocation. Its state machine:
//!
//! ```text
//! pending ──take──▶ streaming ──finish──▶ finished ──(delete delay)──▶ deleted
//!    │                 │  ▲                   │
//!    │                 │  └── heartbeat       │
//!    └──abort──▶ aborted ◀──timeout/abort────┘
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::Part;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRecord {
    pub id: Uuid,
    pub thread_id: Uuid,
    /// Per-thread monotonic sequence number.
    pub seq: u64,
    pub state: StreamState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StreamState {
    Pending {
        scheduled_at: i64,
    },
    Streaming {
        /// Opaque token proving the right to write deltas. Exactly one
        /// handler invocation holds it.
        lock_id: String,
        last_heartbeat: i64,
        timeout_fn_id: Uuid,
    },
    Finished {
        ended_at: i64,
        cleanup_fn_id: Uuid,
    },
    Aborted {
        reason: AbortReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        cleanup_fn_id: Option<Uuid>,
    },
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Aborted { .. })
    }

    /// The pending timeout callback, when one is scheduled.
    pub fn timeout_fn_id(&self) -> Option<Uuid> {
        match self {
            Self::Streaming { timeout_fn_id, .. } => Some(*timeout_fn_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// The thread was stopped by the user.
    StopSignal,
    /// The handler died (stale heartbeat observed by `continue_stream`).
    Expired,
    /// A newer stream replaced this one.
    Superseded,
    /// The heartbeat timeout callback fired.
    Timeout,
    LockedByOther,
    ThreadActiveMismatch,
    /// The turn failed with the given normalized error.
    Error { message: String },
}

/// A batch of parts appended to a stream at one seq position. Immutable
/// once written; deleted with its parent stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub stream_id: Uuid,
    /// Per-stream monotonic, dense from 0.
    pub seq: u64,
    pub msg_id: String,
    pub parts: Vec<Part>,
}
