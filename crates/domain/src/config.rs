//! Engine configuration constants.
//!
//! All values are overridable (e.g. from the gateway's `strand.toml`);
//! the defaults are the production values.

use serde::{Deserialize, Serialize};

use crate::tool::Backoff;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Stream lock timeout: a streaming stream with no heartbeat for this
    /// long is aborted by the scheduled timeout callback.
    pub timeout_interval_ms: u64,
    /// A stream counts as alive iff streaming and its heartbeat is younger
    /// than this.
    pub liveness_threshold_ms: u64,
    /// Handler heartbeat cadence. Must be at most a quarter of
    /// `timeout_interval_ms`.
    pub heartbeat_interval_ms: u64,
    /// Finished/aborted streams are deleted after this delay.
    pub delete_stream_delay_ms: u64,
    /// Default per-call tool timeout. Individual tools may override or
    /// disable it.
    pub tool_call_timeout_ms: u64,
    /// Async tool callback notification attempts before the call fails
    /// with a synthetic error.
    pub async_callback_max_attempts: u32,
    pub async_callback_base_delay_ms: u64,
    /// Default sync tool retry policy knobs.
    pub sync_tool_max_attempts: u32,
    pub sync_tool_base_delay_ms: u64,
    pub sync_tool_max_delay_ms: u64,
    /// Stream-scope retry.
    pub stream_retry_enabled: bool,
    pub stream_retry_max_attempts: u32,
    /// Permit stream retry even when the failed attempt scheduled tool
    /// calls (off by default: retrying would re-request the same tools).
    pub retry_after_tool_calls: bool,
    /// Delta write throttle inside the streamer.
    pub throttle_ms: u64,
    /// Cap on deltas returned by one `stream_updates` call.
    pub max_deltas_per_request: usize,
    /// Deltas removed per `delete_stream` step.
    pub delta_delete_batch: usize,
    /// Recovery sweep cadence.
    pub recovery_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_interval_ms: 10 * 60 * 1_000,
            liveness_threshold_ms: 30 * 1_000,
            heartbeat_interval_ms: 2 * 60 * 1_000,
            delete_stream_delay_ms: 5 * 60 * 1_000,
            tool_call_timeout_ms: 30 * 60 * 1_000,
            async_callback_max_attempts: 3,
            async_callback_base_delay_ms: 5_000,
            sync_tool_max_attempts: 3,
            sync_tool_base_delay_ms: 500,
            sync_tool_max_delay_ms: 10_000,
            stream_retry_enabled: true,
            stream_retry_max_attempts: 3,
            retry_after_tool_calls: false,
            throttle_ms: 250,
            max_deltas_per_request: 1_000,
            delta_delete_batch: 100,
            recovery_interval_ms: 60 * 1_000,
        }
    }
}

impl EngineConfig {
    /// Default stream-scope backoff: exponential 250ms ×2 capped at 4s,
    /// full jitter.
    pub fn stream_backoff(&self) -> Backoff {
        Backoff::Exponential {
            initial_ms: 250,
            multiplier: 2.0,
            max_ms: 4_000,
            jitter: true,
        }
    }

    /// Default sync tool retry backoff from the configured knobs.
    pub fn sync_tool_backoff(&self) -> Backoff {
        Backoff::Exponential {
            initial_ms: self.sync_tool_base_delay_ms,
            multiplier: 2.0,
            max_ms: self.sync_tool_max_delay_ms,
            jitter: true,
        }
    }

    /// Validate the configuration, returning issues by severity.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.heartbeat_interval_ms > self.timeout_interval_ms / 4 {
            issues.push(ConfigIssue::error(format!(
                "heartbeat_interval_ms ({}) must be at most timeout_interval_ms/4 ({})",
                self.heartbeat_interval_ms,
                self.timeout_interval_ms / 4
            )));
        }
        if self.liveness_threshold_ms >= self.timeout_interval_ms {
            issues.push(ConfigIssue::warning(format!(
                "liveness_threshold_ms ({}) >= timeout_interval_ms ({}); streams will \
                 time out before they read as dead",
                self.liveness_threshold_ms, self.timeout_interval_ms
            )));
        }
        if self.delta_delete_batch == 0 {
            issues.push(ConfigIssue::error(
                "delta_delete_batch must be at least 1".to_string(),
            ));
        }
        if self.stream_retry_max_attempts == 0 {
            issues.push(ConfigIssue::warning(
                "stream_retry_max_attempts is 0; stream retry is effectively disabled".to_string(),
            ));
        }
        if self.max_deltas_per_request == 0 {
            issues.push(ConfigIssue::error(
                "max_deltas_per_request must be at least 1".to_string(),
            ));
        }

        issues
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl ConfigIssue {
    fn warning(message: String) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            message,
        }
    }

    fn error(message: String) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            message,
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}
