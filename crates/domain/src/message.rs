//! Messages and the streaming `Part` union.
//!
//! A message is an ordered list of parts. While a turn is streaming, parts
//! arrive as *delta* variants (`text-delta`, `reasoning-delta`, …) batched
//! into [`crate::stream::Delta`] records; once a turn is persisted, text and
//! reasoning deltas are coalesced into whole `text` / `reasoning` parts on
//! the assistant message.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A persisted conversation message.
///
/// `id` is model-generated for assistant messages (from the `start` part)
/// and minted locally for user/system messages. A message is mutated only by
/// appending or overwriting *its own* parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: Uuid,
    pub role: Role,
    pub parts: Vec<Part>,
    /// Stream seq of the turn that committed this message, when assistant.
    /// Clients use it to drop streamed parts already superseded here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committed_seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: i64,
}

impl Message {
    pub fn text(thread_id: Uuid, role: Role, text: impl Into<String>, now: i64) -> Self {
        Self {
            id: mint_message_id(),
            thread_id,
            role,
            parts: vec![Part::Text { text: text.into() }],
            committed_seq: None,
            metadata: None,
            created_at: now,
        }
    }
}

/// Mint a local message id (user/system messages; assistant ids come from
/// the model's `start` part).
pub fn mint_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

/// One element of a message or delta, tagged by `type`.
///
/// The delta variants mirror the provider's part stream; the whole-text
/// variants appear on persisted messages. Unrecognized part types round-trip
/// through `Unknown` so new provider parts survive storage untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    /// Stream control: a new assistant message begins.
    Start { message_id: String },
    TextDelta {
        id: String,
        delta: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<Value>,
    },
    ReasoningDelta {
        id: String,
        delta: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<Value>,
    },
    /// Incremental tool-argument chunks. Never persisted — the streamer
    /// drops these before writing a delta.
    ToolInputDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta: Option<String>,
    },
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    ToolOutputAvailable {
        tool_call_id: String,
        output: Value,
    },
    ToolOutputError {
        tool_call_id: String,
        error_text: String,
    },
    /// Whole-text form on persisted messages.
    Text { text: String },
    /// Whole-reasoning form on persisted messages.
    Reasoning { text: String },
    Finish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
    Error { error_text: String },
    /// Forward-compatibility escape hatch: any part whose `type` tag is not
    /// recognized above.
    #[serde(untagged)]
    Unknown(Value),
}

impl Part {
    /// Whether this part counts as *meaningful* output for retry gating.
    /// `start`/`finish`/`error` are control parts and do not count.
    pub fn is_meaningful(&self) -> bool {
        !matches!(
            self,
            Part::Start { .. } | Part::Finish { .. } | Part::Error { .. }
        )
    }

    /// The part's content id, when it has one (used for delta coalescing
    /// and for id-aliasing in streamed updates).
    pub fn content_id(&self) -> Option<&str> {
        match self {
            Part::TextDelta { id, .. } | Part::ReasoningDelta { id, .. } => Some(id),
            Part::ToolInputDelta { id, .. } => id.as_deref(),
            Part::Unknown(value) => value.get("id").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Rewrite the part's content id, when it has one.
    pub fn set_content_id(&mut self, new_id: String) {
        match self {
            Part::TextDelta { id, .. } | Part::ReasoningDelta { id, .. } => *id = new_id,
            Part::ToolInputDelta { id, .. } => *id = Some(new_id),
            Part::Unknown(value) => {
                if let Some(obj) = value.as_object_mut() {
                    if obj.contains_key("id") {
                        obj.insert("id".into(), Value::String(new_id));
                    }
                }
            }
            _ => {}
        }
    }

    /// Strip provider metadata before a part is written to a delta.
    pub fn strip_provider_metadata(&mut self) {
        match self {
            Part::TextDelta {
                provider_metadata, ..
            }
            | Part::ReasoningDelta {
                provider_metadata, ..
            } => *provider_metadata = None,
            Part::Unknown(value) => {
                if let Some(obj) = value.as_object_mut() {
                    obj.remove("providerMetadata");
                    obj.remove("provider_metadata");
                }
            }
            _ => {}
        }
    }
}
