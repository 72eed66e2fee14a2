//! Tool registry — the execution layer's resolvable handler references.
//!
//! Persisted tool-call records carry only the tool *name*; at execution
//! time the name is resolved here to a sync handler or an async callback.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use strand_domain::{Backoff, Error, RetryPolicy, Result, ToolDefinition, ToolError};

/// Synchronous tool: the result is the handler's return value.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value) -> std::result::Result<Value, ToolError>;
}

/// What an async tool callback is notified with. The result arrives later
/// through `add_tool_result` / `add_tool_error`.
#[derive(Debug, Clone)]
pub struct AsyncToolNotification {
    pub thread_id: Uuid,
    pub tool_call_id: String,
    pub tool_name: String,
    pub args: Value,
}

/// Asynchronous tool: the callback only *starts* the work.
#[async_trait]
pub trait AsyncToolCallback: Send + Sync {
    async fn notify(&self, notification: AsyncToolNotification)
        -> std::result::Result<(), ToolError>;
}

/// Custom retryability classifier for a sync tool's errors.
pub type RetryPredicate = Arc<dyn Fn(&ToolError) -> bool + Send + Sync>;

/// Per-tool timeout override.
#[derive(Debug, Clone, Copy, Default)]
pub enum ToolTimeout {
    /// Use the engine's configured default.
    #[default]
    Default,
    /// No timeout sweeper for this tool.
    Disabled,
    Ms(u64),
}

#[derive(Default)]
pub struct ToolOptions {
    /// Sync execution retry; `None` means the engine's default sync policy.
    pub retry: Option<RetryPolicy>,
    pub should_retry: Option<RetryPredicate>,
    pub timeout: ToolTimeout,
    /// Emit tool-outcome deltas for client visibility (default on).
    pub save_delta: Option<bool>,
}

pub(crate) enum RegisteredKind {
    Sync {
        handler: Arc<dyn ToolHandler>,
        retry: Option<RetryPolicy>,
        should_retry: Option<RetryPredicate>,
    },
    Async {
        callback: Arc<dyn AsyncToolCallback>,
    },
}

pub(crate) struct RegisteredTool {
    pub definition: ToolDefinition,
    pub kind: RegisteredKind,
    pub timeout: ToolTimeout,
    pub save_delta: bool,
}

/// Registry of tools available to the model, keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<RegisteredTool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_sync(
        &self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
        options: ToolOptions,
    ) -> Result<()> {
        validate_parameters(&definition)?;
        self.tools.write().insert(
            definition.name.clone(),
            Arc::new(RegisteredTool {
                definition,
                kind: RegisteredKind::Sync {
                    handler,
                    retry: options.retry,
                    should_retry: options.should_retry,
                },
                timeout: options.timeout,
                save_delta: options.save_delta.unwrap_or(true),
            }),
        );
        Ok(())
    }

    pub fn register_async(
        &self,
        definition: ToolDefinition,
        callback: Arc<dyn AsyncToolCallback>,
        options: ToolOptions,
    ) -> Result<()> {
        validate_parameters(&definition)?;
        self.tools.write().insert(
            definition.name.clone(),
            Arc::new(RegisteredTool {
                definition,
                kind: RegisteredKind::Async { callback },
                timeout: options.timeout,
                save_delta: options.save_delta.unwrap_or(true),
            }),
        );
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<RegisteredTool>> {
        self.tools.read().get(name).cloned()
    }

    /// Tool definitions in a stable order, for the model request.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let tools = self.tools.read();
        let mut defs: Vec<ToolDefinition> =
            tools.values().map(|t| t.definition.clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }
}

/// Parameters must be a JSON-Schema object with no `$`-prefixed fields.
fn validate_parameters(definition: &ToolDefinition) -> Result<()> {
    let obj = definition
        .parameters
        .as_object()
        .ok_or_else(|| Error::InvalidToolParameters {
            tool: definition.name.clone(),
            reason: "parameters must be a JSON object".into(),
        })?;
    if let Some(key) = obj.keys().find(|k| k.starts_with('$')) {
        return Err(Error::InvalidToolParameters {
            tool: definition.name.clone(),
            reason: format!("`$`-prefixed field not allowed: {key}"),
        });
    }
    Ok(())
}

/// Default retryability for tool errors, used when the tool supplies no
/// custom classifier. Retries 408/409/429/5xx, connection-level codes, and
/// transient-looking messages; all other 4xx are permanent.
pub fn default_tool_retry(error: &ToolError) -> bool {
    if let Some(retryable) = error.retryable {
        return retryable;
    }
    if let Some(status) = error.status {
        return matches!(status, 408 | 409 | 429) || (500..=599).contains(&status);
    }
    if let Some(code) = &error.code {
        let code = code.to_ascii_uppercase();
        if matches!(
            code.as_str(),
            "ECONNRESET"
                | "ECONNREFUSED"
                | "ETIMEDOUT"
                | "EHOSTUNREACH"
                | "EPIPE"
                | "ENOTFOUND"
                | "CONNECTIONREFUSED"
                | "CONNECTIONCLOSED"
                | "FAILEDTOOPENSOCKET"
        ) {
            return true;
        }
    }
    let message = error.message.to_ascii_lowercase();
    ["rate limit", "too many requests", "timed out", "timeout", "connection", "server error", "overloaded", "temporarily unavailable"]
        .iter()
        .any(|p| message.contains(p))
}

/// Resolve the effective retry policy for a sync tool: the tool's own,
/// else the engine default built from config knobs.
pub(crate) fn effective_retry_policy(
    tool_retry: Option<&RetryPolicy>,
    max_attempts: u32,
    backoff: Backoff,
) -> RetryPolicy {
    match tool_retry {
        Some(policy) => policy.clone(),
        None => RetryPolicy {
            enabled: true,
            max_attempts,
            backoff,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, args: Value) -> std::result::Result<Value, ToolError> {
            Ok(args)
        }
    }

    fn definition(name: &str, parameters: Value) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: "test tool".into(),
            parameters,
        }
    }

    #[test]
    fn register_and_list_definitions() {
        let registry = ToolRegistry::new();
        registry
            .register_sync(
                definition("b_tool", serde_json::json!({"type": "object"})),
                Arc::new(Echo),
                ToolOptions::default(),
            )
            .unwrap();
        registry
            .register_sync(
                definition("a_tool", serde_json::json!({"type": "object"})),
                Arc::new(Echo),
                ToolOptions::default(),
            )
            .unwrap();

        let defs = registry.definitions();
        assert_eq!(defs.len(), 2);
        // Stable name order.
        assert_eq!(defs[0].name, "a_tool");
        assert_eq!(defs[1].name, "b_tool");
    }

    #[test]
    fn rejects_non_object_parameters() {
        let registry = ToolRegistry::new();
        let err = registry
            .register_sync(
                definition("bad", serde_json::json!("not an object")),
                Arc::new(Echo),
                ToolOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidToolParameters { .. }));
    }

    #[test]
    fn rejects_dollar_prefixed_fields() {
        let registry = ToolRegistry::new();
        let err = registry
            .register_sync(
                definition("bad", serde_json::json!({"$schema": "x", "type": "object"})),
                Arc::new(Echo),
                ToolOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidToolParameters { .. }));
    }

    #[test]
    fn default_retry_honors_explicit_flag() {
        let mut err = ToolError::with_status("anything", 404);
        err.retryable = Some(true);
        assert!(default_tool_retry(&err));

        let mut err = ToolError::with_status("anything", 503);
        err.retryable = Some(false);
        assert!(!default_tool_retry(&err));
    }

    #[test]
    fn default_retry_by_status() {
        assert!(default_tool_retry(&ToolError::with_status("conflict", 409)));
        assert!(default_tool_retry(&ToolError::with_status("slow down", 429)));
        assert!(default_tool_retry(&ToolError::with_status("boom", 500)));
        assert!(default_tool_retry(&ToolError::with_status("gateway", 503)));
        assert!(!default_tool_retry(&ToolError::with_status("nope", 400)));
        assert!(!default_tool_retry(&ToolError::with_status("missing", 404)));
    }

    #[test]
    fn default_retry_by_code_and_message() {
        let mut err = ToolError::msg("socket closed");
        err.code = Some("ECONNRESET".into());
        assert!(default_tool_retry(&err));

        assert!(default_tool_retry(&ToolError::msg("upstream rate limit hit")));
        assert!(default_tool_retry(&ToolError::msg("request timed out")));
        assert!(!default_tool_retry(&ToolError::msg("invalid argument: location")));
    }
}
