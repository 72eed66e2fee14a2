//! The consumed LLM contract: a provider turns a request into a finite
//! stream of tagged parts, plus an error envelope the retry classifier can
//! inspect.

use std::pin::Pin;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use strand_domain::{Message, Part, Role, ToolDefinition};

/// A boxed async stream of parts, as produced by one model invocation.
pub type PartStream =
    Pin<Box<dyn futures_core::Stream<Item = Result<Part, ProviderError>> + Send>>;

/// Input to one model invocation.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub thread_id: Uuid,
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<ToolDefinition>,
    /// 1-based attempt number within the current turn (for provider-side
    /// telemetry; retries re-issue the same request).
    pub attempt: u32,
}

/// A persisted message converted to the model's input form: persisted
/// whole-text parts, tool inputs, and tool outcomes, with delta and
/// control parts already folded away.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMessage {
    pub role: Role,
    pub parts: Vec<Part>,
}

/// Convert persisted messages to the model input form.
pub fn to_model_messages(messages: &[Message]) -> Vec<ModelMessage> {
    messages
        .iter()
        .map(|m| ModelMessage {
            role: m.role,
            parts: m
                .parts
                .iter()
                .filter(|p| {
                    matches!(
                        p,
                        Part::Text { .. }
                            | Part::Reasoning { .. }
                            | Part::ToolInputAvailable { .. }
                            | Part::ToolOutputAvailable { .. }
                            | Part::ToolOutputError { .. }
                    )
                })
                .cloned()
                .collect(),
        })
        .collect()
}

/// Error raised by a provider, before or during streaming.
///
/// `details` is the provider SDK's raw error tree (nested causes, response
/// headers/bodies, provider codes) — the retry classifier walks it; the
/// engine itself only reads `message`.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub message: String,
    pub details: Option<Value>,
}

impl ProviderError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(message: impl Into<String>, details: Value) -> Self {
        Self {
            message: message.into(),
            details: Some(details),
        }
    }

    /// The value handed to the retry classifier.
    pub fn to_classifiable(&self) -> Value {
        match &self.details {
            Some(details) => details.clone(),
            None => serde_json::json!({ "message": self.message }),
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProviderError {}

/// The model side of a turn. Implementations wrap a concrete LLM SDK;
/// the engine only consumes the part stream.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn stream_turn(&self, request: TurnRequest) -> Result<PartStream, ProviderError>;
}

/// Provider used when none is configured: every turn fails with a
/// non-retryable invalid-request error. Lets the surrounding service start
/// (and serve reads) before a model is wired up.
pub struct UnconfiguredProvider;

#[async_trait]
impl ModelProvider for UnconfiguredProvider {
    async fn stream_turn(&self, _request: TurnRequest) -> Result<PartStream, ProviderError> {
        Err(ProviderError::with_details(
            "no model provider configured",
            serde_json::json!({
                "message": "no model provider configured",
                "status": 400,
            }),
        ))
    }
}
