//! Tool-call management: persistence, execution, timeouts, retry, result
//! ingestion, and the turn-continuation gate.
//!
//! A tool call transitions pending → completed/failed exactly once; every
//! terminal transition funnels through [`Engine::complete_tool_call`],
//! which cancels outstanding scheduled work and (optionally) emits an
//! outcome delta. [`Engine::on_tool_complete`] decides whether the turn
//! continues.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use strand_domain::{
    now_ms, Error, Part, Result, RetryPolicy, ThreadStatus, ToolCallKind, ToolCallRecord,
    ToolCallStatus, ToolError,
};

use crate::tools::{default_tool_retry, effective_retry_policy, RegisteredKind, ToolTimeout};
use crate::{Engine, Job};

const STOPPED_MESSAGE: &str = "cancelled because the thread was stopped";

impl Engine {
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Scheduling
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Entry point for a `tool-input-available` part: persist the call and
    /// enqueue its execution (sync) or its callback notification (async).
    pub(crate) fn schedule_tool_call_from_part(
        &self,
        thread_id: Uuid,
        msg_id: &str,
        tool_call_id: &str,
        tool_name: &str,
        args: Value,
    ) -> Result<()> {
        let Some(tool) = self.tools.get(tool_name) else {
            // Persist the call so the turn can carry the failure back to
            // the model as a tool error.
            self.create_tool_call(
                thread_id,
                msg_id,
                tool_call_id,
                tool_name,
                args,
                ToolCallKind::Sync,
                RetryPolicy::disabled(),
                ToolTimeout::Default,
                true,
            )?;
            if self.complete_tool_call(
                thread_id,
                tool_call_id,
                Err(format!("tool not registered: {tool_name}")),
            ) {
                self.on_tool_complete(thread_id);
            }
            return Ok(());
        };

        match &tool.kind {
            RegisteredKind::Sync { retry, .. } => {
                let policy = effective_retry_policy(
                    retry.as_ref(),
                    self.config.sync_tool_max_attempts,
                    self.config.sync_tool_backoff(),
                );
                self.create_tool_call(
                    thread_id,
                    msg_id,
                    tool_call_id,
                    tool_name,
                    args,
                    ToolCallKind::Sync,
                    policy,
                    tool.timeout,
                    tool.save_delta,
                )?;
                let job = Job::ExecuteToolCall {
                    thread_id,
                    tool_call_id: tool_call_id.to_string(),
                };
                if self.tool_workpool.is_some() || self.workpool.is_some() {
                    self.dispatch(job);
                } else {
                    // Direct scheduler path: track the enqueue on the
                    // record so the recovery sweep can tell it is pending.
                    let fn_id = self.scheduler.run_after(0, job);
                    self.store.mutate(|tables| {
                        if let Some(record) = tables.tool_call_mut(&thread_id, tool_call_id) {
                            record.execution_retry_fn_id = Some(fn_id);
                        }
                    });
                }
            }
            RegisteredKind::Async { .. } => {
                self.create_tool_call(
                    thread_id,
                    msg_id,
                    tool_call_id,
                    tool_name,
                    args,
                    ToolCallKind::Async,
                    RetryPolicy::disabled(),
                    tool.timeout,
                    tool.save_delta,
                )?;
                self.dispatch(Job::NotifyAsyncTool {
                    thread_id,
                    tool_call_id: tool_call_id.to_string(),
                });
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn create_tool_call(
        &self,
        thread_id: Uuid,
        msg_id: &str,
        tool_call_id: &str,
        tool_name: &str,
        args: Value,
        kind: ToolCallKind,
        retry: RetryPolicy,
        timeout: ToolTimeout,
        save_delta: bool,
    ) -> Result<()> {
        let timeout_ms = match timeout {
            ToolTimeout::Default => Some(self.config.tool_call_timeout_ms),
            ToolTimeout::Disabled => None,
            ToolTimeout::Ms(ms) => Some(ms),
        };
        self.store.mutate(|tables| {
            if tables.thread(&thread_id).is_none() {
                return Err(Error::NotFound {
                    kind: "thread",
                    id: thread_id.to_string(),
                });
            }
            if tables.tool_call(&thread_id, tool_call_id).is_some() {
                return Err(Error::DuplicateToolCall {
                    thread_id,
                    tool_call_id: tool_call_id.to_string(),
                });
            }
            let now = now_ms();
            let (expires_at, timeout_fn_id) = match timeout_ms {
                Some(ms) => {
                    let fn_id = self.scheduler.run_after(
                        ms,
                        Job::FailPendingToolCall {
                            thread_id,
                            tool_call_id: tool_call_id.to_string(),
                        },
                    );
                    (Some(now + ms as i64), Some(fn_id))
                }
                None => (None, None),
            };
            tables.push_tool_call(ToolCallRecord {
                id: Uuid::new_v4(),
                thread_id,
                msg_id: msg_id.to_string(),
                tool_call_id: tool_call_id.to_string(),
                tool_name: tool_name.to_string(),
                args,
                kind,
                status: ToolCallStatus::Pending,
                result: None,
                error: None,
                save_delta,
                timeout_ms,
                expires_at,
                timeout_fn_id,
                execution_attempt: 0,
                execution_retry_policy: retry,
                execution_last_error: None,
                next_retry_at: None,
                execution_retry_fn_id: None,
                callback_attempt: 0,
                callback_last_error: None,
                created_at: now,
            });
            Ok(())
        })
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Sync execution
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub(crate) async fn execute_tool_call(&self, thread_id: Uuid, tool_call_id: &str) {
        enum Gate {
            Skip,
            Stopped,
            Run { tool_name: String, args: Value, attempt: u32 },
        }

        let gate = self.store.mutate(|tables| {
            let Some(record) = tables.tool_call(&thread_id, tool_call_id) else {
                return Gate::Skip;
            };
            if record.status != ToolCallStatus::Pending {
                return Gate::Skip;
            }
            let thread_stopped = tables
                .thread(&thread_id)
                .map(|t| t.stop_signal || t.status == ThreadStatus::Stopped)
                .unwrap_or(true);
            if thread_stopped {
                return Gate::Stopped;
            }
            let record = tables
                .tool_call_mut(&thread_id, tool_call_id)
                .expect("checked above");
            record.execution_attempt += 1;
            record.next_retry_at = None;
            record.execution_retry_fn_id = None;
            Gate::Run {
                tool_name: record.tool_name.clone(),
                args: record.args.clone(),
                attempt: record.execution_attempt,
            }
        });

        let (tool_name, args, attempt) = match gate {
            Gate::Skip => return,
            Gate::Stopped => {
                if self.complete_tool_call(thread_id, tool_call_id, Err(STOPPED_MESSAGE.into())) {
                    self.on_tool_complete(thread_id);
                }
                return;
            }
            Gate::Run {
                tool_name,
                args,
                attempt,
            } => (tool_name, args, attempt),
        };

        let tool = self.tools.get(&tool_name);
        let outcome = match tool.as_ref().map(|t| &t.kind) {
            Some(RegisteredKind::Sync { handler, .. }) => handler.call(args).await,
            _ => Err(ToolError::msg(format!("tool not registered: {tool_name}"))),
        };

        match outcome {
            Ok(result) => {
                if self.complete_tool_call(thread_id, tool_call_id, Ok(result)) {
                    self.on_tool_complete(thread_id);
                }
            }
            Err(error) => {
                self.handle_tool_failure(thread_id, tool_call_id, attempt, &tool, error);
            }
        }
    }

    /// Decide retry-vs-fail for a sync execution error.
    fn handle_tool_failure(
        &self,
        thread_id: Uuid,
        tool_call_id: &str,
        attempt: u32,
        tool: &Option<Arc<crate::tools::RegisteredTool>>,
        error: ToolError,
    ) {
        let custom_predicate = tool.as_ref().and_then(|t| match &t.kind {
            RegisteredKind::Sync { should_retry, .. } => should_retry.clone(),
            _ => None,
        });
        let retryable = match custom_predicate {
            Some(predicate) => predicate(&error),
            None => default_tool_retry(&error),
        };

        let scheduled = self.store.mutate(|tables| {
            let Some(record) = tables.tool_call_mut(&thread_id, tool_call_id) else {
                return true; // Gone; nothing to do.
            };
            if record.status != ToolCallStatus::Pending {
                return true;
            }
            let policy = record.execution_retry_policy.clone();
            if !(policy.enabled && retryable && attempt < policy.max_attempts) {
                return false;
            }
            let delay = policy.backoff.delay_ms(attempt);
            let now = now_ms();
            record.execution_last_error = Some(error.to_string());
            record.next_retry_at = Some(now + delay as i64);
            let fn_id = self.scheduler.run_after(
                delay,
                Job::ExecuteToolCall {
                    thread_id,
                    tool_call_id: tool_call_id.to_string(),
                },
            );
            record.execution_retry_fn_id = Some(fn_id);
            tracing::debug!(
                %thread_id,
                tool_call_id,
                attempt,
                delay_ms = delay,
                error = %error,
                "tool execution retry scheduled"
            );
            true
        });

        if !scheduled {
            if self.complete_tool_call(thread_id, tool_call_id, Err(error.to_string())) {
                self.on_tool_complete(thread_id);
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Async callback notification
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub(crate) async fn notify_async_tool(&self, thread_id: Uuid, tool_call_id: &str) {
        let gate = self.store.mutate(|tables| {
            let Some(record) = tables.tool_call(&thread_id, tool_call_id) else {
                return None;
            };
            if record.status != ToolCallStatus::Pending {
                return None;
            }
            let record = tables
                .tool_call_mut(&thread_id, tool_call_id)
                .expect("checked above");
            record.callback_attempt += 1;
            Some((
                record.tool_name.clone(),
                record.args.clone(),
                record.callback_attempt,
            ))
        });
        let Some((tool_name, args, attempt)) = gate else {
            return;
        };

        let callback = self.tools.get(&tool_name).and_then(|t| match &t.kind {
            RegisteredKind::Async { callback } => Some(callback.clone()),
            _ => None,
        });
        let outcome = match callback {
            Some(callback) => {
                callback
                    .notify(crate::tools::AsyncToolNotification {
                        thread_id,
                        tool_call_id: tool_call_id.to_string(),
                        tool_name: tool_name.clone(),
                        args,
                    })
                    .await
            }
            None => Err(ToolError::msg(format!(
                "async tool not registered: {tool_name}"
            ))),
        };

        let Err(error) = outcome else {
            return; // Notified; the result arrives via add_tool_result.
        };

        let max_attempts = self.config.async_callback_max_attempts;
        if attempt < max_attempts {
            let delay = self.config.async_callback_base_delay_ms * 2u64.pow(attempt - 1);
            self.store.mutate(|tables| {
                if let Some(record) = tables.tool_call_mut(&thread_id, tool_call_id) {
                    record.callback_last_error = Some(error.to_string());
                }
            });
            self.scheduler.run_after(
                delay,
                Job::NotifyAsyncTool {
                    thread_id,
                    tool_call_id: tool_call_id.to_string(),
                },
            );
            tracing::debug!(
                %thread_id,
                tool_call_id,
                attempt,
                delay_ms = delay,
                "async tool callback retry scheduled"
            );
        } else if self.complete_tool_call(
            thread_id,
            tool_call_id,
            Err(format!(
                "async tool callback failed after {max_attempts} attempts: {error}"
            )),
        ) {
            self.on_tool_complete(thread_id);
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Result ingestion
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Deliver an async tool's result. Idempotent: a second delivery for a
    /// terminal call warns and does nothing.
    pub fn add_tool_result(
        &self,
        thread_id: Uuid,
        tool_call_id: &str,
        result: Value,
    ) -> Result<()> {
        self.assert_tool_call_exists(thread_id, tool_call_id)?;
        if self.complete_tool_call(thread_id, tool_call_id, Ok(result)) {
            self.on_tool_complete(thread_id);
        }
        Ok(())
    }

    /// Deliver an async tool's failure. Same idempotence as
    /// [`Engine::add_tool_result`].
    pub fn add_tool_error(
        &self,
        thread_id: Uuid,
        tool_call_id: &str,
        error: impl Into<String>,
    ) -> Result<()> {
        self.assert_tool_call_exists(thread_id, tool_call_id)?;
        if self.complete_tool_call(thread_id, tool_call_id, Err(error.into())) {
            self.on_tool_complete(thread_id);
        }
        Ok(())
    }

    fn assert_tool_call_exists(&self, thread_id: Uuid, tool_call_id: &str) -> Result<()> {
        self.store.read(|tables| {
            tables
                .tool_call(&thread_id, tool_call_id)
                .map(|_| ())
                .ok_or(Error::NotFound {
                    kind: "tool call",
                    id: tool_call_id.to_string(),
                })
        })
    }

    /// The single terminal transition. Returns `true` iff the record
    /// moved from pending to terminal in this call.
    fn complete_tool_call(
        &self,
        thread_id: Uuid,
        tool_call_id: &str,
        outcome: std::result::Result<Value, String>,
    ) -> bool {
        self.store.mutate(|tables| {
            let Some(record) = tables.tool_call_mut(&thread_id, tool_call_id) else {
                return false;
            };
            if record.status.is_terminal() {
                tracing::warn!(
                    %thread_id,
                    tool_call_id,
                    status = ?record.status,
                    "ignoring outcome for already-terminal tool call"
                );
                return false;
            }

            let msg_id = record.msg_id.clone();
            let save_delta = record.save_delta;
            let timeout_fn = record.timeout_fn_id.take();
            let retry_fn = record.execution_retry_fn_id.take();
            record.next_retry_at = None;

            let delta_part = match outcome {
                Ok(result) => {
                    record.status = ToolCallStatus::Completed;
                    record.result = Some(result.clone());
                    Part::ToolOutputAvailable {
                        tool_call_id: tool_call_id.to_string(),
                        output: result,
                    }
                }
                Err(error) => {
                    record.status = ToolCallStatus::Failed;
                    record.error = Some(error.clone());
                    Part::ToolOutputError {
                        tool_call_id: tool_call_id.to_string(),
                        error_text: error,
                    }
                }
            };

            if let Some(fn_id) = timeout_fn {
                self.scheduler.cancel(&fn_id);
            }
            if let Some(fn_id) = retry_fn {
                self.scheduler.cancel(&fn_id);
            }
            if save_delta {
                self.append_outcome_delta_in(tables, thread_id, &msg_id, delta_part);
            }
            true
        })
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Continuation gate
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Called on every terminal tool transition. Observes the stop signal,
    /// and when the last pending call clears, either flags a live handler
    /// to re-enter or enqueues `continue_stream`.
    pub(crate) fn on_tool_complete(&self, thread_id: Uuid) {
        enum Outcome {
            Nothing,
            Stopped { changed: bool },
            Enqueue,
        }

        let outcome = self.store.mutate(|tables| {
            let Some(thread) = tables.thread(&thread_id) else {
                return Outcome::Nothing;
            };
            let previous_status = thread.status;
            let previous_active = thread.active_stream;

            if thread.stop_signal {
                let retry_fn = thread
                    .retry_state
                    .as_ref()
                    .and_then(|state| state.retry_fn_id);
                {
                    let thread = tables.thread_mut(&thread_id).expect("loaded above");
                    thread.status = ThreadStatus::Stopped;
                    thread.active_stream = None;
                    thread.continue_requested = false;
                    thread.retry_state = None;
                    thread.updated_at = now_ms();
                }
                if let Some(fn_id) = retry_fn {
                    self.scheduler.cancel(&fn_id);
                }
                if let Some(stream_id) = previous_active {
                    self.abort_stream_in(tables, stream_id, strand_domain::AbortReason::StopSignal);
                }
                return Outcome::Stopped {
                    changed: previous_status != ThreadStatus::Stopped,
                };
            }

            if tables.pending_tool_calls(&thread_id) > 0 {
                return Outcome::Nothing;
            }

            let now = now_ms();
            let active_alive = previous_active
                .and_then(|id| tables.stream(&id).map(|s| self.stream_alive(&s.state, now)))
                .unwrap_or(false);
            if active_alive {
                tables
                    .thread_mut(&thread_id)
                    .expect("loaded above")
                    .continue_requested = true;
                Outcome::Nothing
            } else {
                Outcome::Enqueue
            }
        });

        match outcome {
            Outcome::Nothing => {}
            Outcome::Stopped { changed } => {
                if changed {
                    self.fire_status_change(thread_id, ThreadStatus::Stopped);
                }
            }
            Outcome::Enqueue => {
                self.dispatch(Job::ContinueStream { thread_id });
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Timeouts & recovery
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Scheduled timeout sweeper for one call.
    pub(crate) fn fail_pending_tool_call(&self, thread_id: Uuid, tool_call_id: &str) {
        let due = self.store.read(|tables| {
            tables
                .tool_call(&thread_id, tool_call_id)
                .filter(|record| record.status == ToolCallStatus::Pending)
                .and_then(|record| record.expires_at.map(|at| (at, record.timeout_ms)))
                .filter(|(at, _)| now_ms() >= *at)
                .map(|(_, timeout_ms)| timeout_ms.unwrap_or(0))
        });
        let Some(timeout_ms) = due else {
            return;
        };
        let message = format!(
            "Tool call timed out after {}",
            format_duration_ms(timeout_ms)
        );
        if self.complete_tool_call(thread_id, tool_call_id, Err(message)) {
            self.on_tool_complete(thread_id);
        }
    }

    /// Re-enqueue pending sync calls whose scheduled execution vanished
    /// (process restart). Returns how many were re-driven.
    pub(crate) fn resume_pending_sync_tool_executions(&self, limit: usize) -> usize {
        let now = now_ms();
        let orphaned: Vec<(Uuid, String, u64)> = self.store.read(|tables| {
            tables
                .all_pending_tool_calls()
                .filter(|record| record.kind == ToolCallKind::Sync)
                .filter(|record| {
                    record
                        .execution_retry_fn_id
                        .map_or(true, |fn_id| !self.scheduler.is_pending(&fn_id))
                })
                .take(limit)
                .map(|record| {
                    let delay = record
                        .next_retry_at
                        .map_or(0, |at| (at - now).max(0) as u64);
                    (record.thread_id, record.tool_call_id.clone(), delay)
                })
                .collect()
        });

        let count = orphaned.len();
        for (thread_id, tool_call_id, delay) in orphaned {
            let fn_id = self.scheduler.run_after(
                delay,
                Job::ExecuteToolCall {
                    thread_id,
                    tool_call_id: tool_call_id.clone(),
                },
            );
            self.store.mutate(|tables| {
                if let Some(record) = tables.tool_call_mut(&thread_id, &tool_call_id) {
                    record.execution_retry_fn_id = Some(fn_id);
                }
            });
        }
        count
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Outcome merge
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Idempotently merge completed tool outcomes into the parts of the
    /// assistant messages that requested them.
    pub(crate) fn apply_tool_outcomes(&self, thread_id: Uuid) {
        self.store.mutate(|tables| {
            let outcomes: Vec<(String, Part)> = tables
                .tool_calls(&thread_id)
                .iter()
                .filter(|record| record.status.is_terminal())
                .map(|record| {
                    let part = match record.status {
                        ToolCallStatus::Completed => Part::ToolOutputAvailable {
                            tool_call_id: record.tool_call_id.clone(),
                            output: record.result.clone().unwrap_or(Value::Null),
                        },
                        _ => Part::ToolOutputError {
                            tool_call_id: record.tool_call_id.clone(),
                            error_text: record.error.clone().unwrap_or_default(),
                        },
                    };
                    (record.msg_id.clone(), part)
                })
                .collect();

            for (msg_id, part) in outcomes {
                let call_id = match &part {
                    Part::ToolOutputAvailable { tool_call_id, .. }
                    | Part::ToolOutputError { tool_call_id, .. } => tool_call_id.clone(),
                    _ => continue,
                };
                if let Some(message) = tables.message_mut(&thread_id, &msg_id) {
                    let already_present = message.parts.iter().any(|p| {
                        matches!(
                            p,
                            Part::ToolOutputAvailable { tool_call_id, .. }
                            | Part::ToolOutputError { tool_call_id, .. }
                            if *tool_call_id == call_id
                        )
                    });
                    if !already_present {
                        message.parts.push(part);
                    }
                }
            }
        });
    }
}

/// Human-form duration for timeout messages: `30m`, `1h 5m`, `45s`.
fn format_duration_ms(ms: u64) -> String {
    let total_secs = ms / 1_000;
    if total_secs == 0 {
        return format!("{ms}ms");
    }
    let hours = total_secs / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;
    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    if seconds > 0 {
        parts.push(format!("{seconds}s"));
    }
    parts.join(" ")
}
