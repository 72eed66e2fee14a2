//! Shared domain types for the Strand orchestrator.
//!
//! Everything the engine persists lives here: thread / message / stream /
//! tool-call records, the streaming `Part` union, retry and backoff types,
//! the engine configuration, and the shared error enum.

pub mod config;
pub mod error;
pub mod message;
pub mod stream;
pub mod thread;
pub mod tool;

pub use config::EngineConfig;
pub use error::{Error, ErrorKind, Result};
pub use message::{Message, Part, Role};
pub use stream::{AbortReason, Delta, StreamRecord, StreamState};
pub use thread::{RetryState, Thread, ThreadStatus};
pub use tool::{
    Backoff, RetryPolicy, ToolCallKind, ToolCallRecord, ToolCallStatus, ToolDefinition, ToolError,
};

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// All persisted timestamps use this representation.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
