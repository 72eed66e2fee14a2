//! The stream handler: executes one LLM turn end-to-end under an
//! exclusive stream lock.
//!
//! One invocation per active stream. It takes the lock, runs a heartbeat
//! companion task, relays the provider's parts into the delta streamer,
//! schedules tool calls, classifies errors into retry-or-fail, and always
//! finalizes through the seq-fenced [`Engine::finalize_stream_turn`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use uuid::Uuid;

use strand_domain::{
    message::mint_message_id, now_ms, AbortReason, Message, Part, RetryState, Role, ThreadStatus,
};

use crate::hooks::{RetryDecision, RetryDecisionInput, RetryNotice, TurnFailure};
use crate::provider::{to_model_messages, TurnRequest};
use crate::retry::{classify, normalize_message};
use crate::streamer::DeltaStreamer;
use crate::streams::TakenStream;
use crate::{Engine, Job};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn outcome plumbing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct TurnOutcome {
    status: ThreadStatus,
}

struct TurnError {
    /// The raw error tree handed to the classifier.
    raw: Value,
    /// Normalized user-visible message.
    message: String,
    attempt: u32,
    tool_calls_scheduled: usize,
    stream_part_count: usize,
}

impl TurnError {
    fn new(raw: Value, attempt: u32, tool_calls_scheduled: usize, stream_part_count: usize) -> Self {
        let message = normalize_message(&raw);
        Self {
            raw,
            message,
            attempt,
            tool_calls_scheduled,
            stream_part_count,
        }
    }
}

/// Aborts the heartbeat task when the handler leaves scope.
struct HeartbeatGuard {
    handle: tokio::task::JoinHandle<()>,
}

impl HeartbeatGuard {
    fn spawn(engine: Arc<Engine>, stream_id: Uuid, lock_id: String) -> Self {
        let interval_ms = engine.config.heartbeat_interval_ms.max(10);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.tick().await; // Consume the immediate tick.
            loop {
                ticker.tick().await;
                if let Err(error) = engine.heartbeat(stream_id, &lock_id) {
                    // The handler itself keeps running; an invalidated
                    // lock surfaces on its next delta write.
                    tracing::warn!(%stream_id, %error, "stream heartbeat failed");
                    break;
                }
            }
        });
        Self { handle }
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Assistant message draft
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Accumulates the assistant messages produced by one turn: text and
/// reasoning deltas coalesce into whole parts; tool inputs append as-is.
#[derive(Default)]
struct AssistantDraft {
    messages: Vec<DraftMessage>,
}

struct DraftMessage {
    msg_id: String,
    parts: Vec<Part>,
    text_slots: HashMap<String, usize>,
    reasoning_slots: HashMap<String, usize>,
}

impl AssistantDraft {
    fn start(&mut self, msg_id: String) {
        if self.messages.last().map(|m| m.msg_id.as_str()) != Some(msg_id.as_str()) {
            self.messages.push(DraftMessage {
                msg_id,
                parts: Vec::new(),
                text_slots: HashMap::new(),
                reasoning_slots: HashMap::new(),
            });
        }
    }

    fn current_msg_id(&self) -> Option<&str> {
        self.messages.last().map(|m| m.msg_id.as_str())
    }

    fn push(&mut self, part: &Part) {
        let Some(current) = self.messages.last_mut() else {
            return;
        };
        match part {
            Part::TextDelta { id, delta, .. } => {
                if let Some(&slot) = current.text_slots.get(id) {
                    if let Part::Text { text } = &mut current.parts[slot] {
                        text.push_str(delta);
                        return;
                    }
                }
                current.parts.push(Part::Text {
                    text: delta.clone(),
                });
                current
                    .text_slots
                    .insert(id.clone(), current.parts.len() - 1);
            }
            Part::ReasoningDelta { id, delta, .. } => {
                if let Some(&slot) = current.reasoning_slots.get(id) {
                    if let Part::Reasoning { text } = &mut current.parts[slot] {
                        text.push_str(delta);
                        return;
                    }
                }
                current.parts.push(Part::Reasoning {
                    text: delta.clone(),
                });
                current
                    .reasoning_slots
                    .insert(id.clone(), current.parts.len() - 1);
            }
            Part::ToolInputAvailable { .. }
            | Part::ToolOutputAvailable { .. }
            | Part::ToolOutputError { .. }
            | Part::Text { .. }
            | Part::Reasoning { .. }
            | Part::Unknown(_) => current.parts.push(part.clone()),
            Part::Start { .. }
            | Part::Finish { .. }
            | Part::Error { .. }
            | Part::ToolInputDelta { .. } => {}
        }
    }

    fn finish(self) -> Vec<(String, Vec<Part>)> {
        self.messages
            .into_iter()
            .map(|m| (m.msg_id, m.parts))
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Engine {
    /// Run one turn for `{thread_id, stream_id}`. Tolerates losing the
    /// take race (logs and returns without effect) and always finalizes.
    pub(crate) async fn run_stream_handler(&self, thread_id: Uuid, stream_id: Uuid) {
        let lock_id = Uuid::new_v4().to_string();
        let taken = match self.take_stream(thread_id, stream_id, &lock_id) {
            Ok(taken) => taken,
            Err(error) => {
                tracing::debug!(%thread_id, %stream_id, %error, "stream not taken; handler exits");
                return;
            }
        };
        let expected_seq = taken.seq;

        let heartbeat = HeartbeatGuard::spawn(self.strong(), stream_id, lock_id.clone());

        let outcome = self.run_turn(thread_id, stream_id, &lock_id, taken).await;
        drop(heartbeat);

        let final_status = match outcome {
            Ok(TurnOutcome { status }) => {
                if status == ThreadStatus::Completed {
                    if let Some(hook) = &self.hooks.on_turn_complete {
                        hook(thread_id);
                    }
                }
                Some(status)
            }
            Err(turn_error) => {
                self.handle_turn_error(thread_id, stream_id, turn_error);
                None
            }
        };

        if self.finalize_stream_turn(thread_id, stream_id, final_status, expected_seq) {
            self.dispatch(Job::ContinueStream { thread_id });
        }
    }

    async fn run_turn(
        &self,
        thread_id: Uuid,
        stream_id: Uuid,
        lock_id: &str,
        taken: TakenStream,
    ) -> Result<TurnOutcome, TurnError> {
        let attempt = self.store.read(|tables| {
            tables
                .thread(&thread_id)
                .and_then(|t| t.retry_state.as_ref())
                .map(|state| state.attempt + 1)
                .unwrap_or(1)
        });

        let mut tool_calls_scheduled = 0usize;
        let mut stream_part_count = 0usize;
        macro_rules! fail {
            ($raw:expr) => {
                TurnError::new($raw, attempt, tool_calls_scheduled, stream_part_count)
            };
        }

        // Fold earlier tool outcomes into the transcript before building
        // the model input.
        self.apply_tool_outcomes(thread_id);

        let messages = self
            .store
            .read(|tables| tables.messages(&thread_id).to_vec());
        let mut model_messages = to_model_messages(&messages);
        if let Some(transform) = &self.hooks.transform_messages {
            model_messages = transform(model_messages);
        }

        let request = TurnRequest {
            thread_id,
            messages: model_messages,
            tools: self.tools.definitions(),
            attempt,
        };
        let mut parts = self
            .provider
            .stream_turn(request)
            .await
            .map_err(|e| fail!(e.to_classifiable()))?;

        let mut streamer =
            DeltaStreamer::new(self, stream_id, lock_id.to_string(), taken.next_delta_seq);
        let mut draft = AssistantDraft::default();
        let mut finish_reason: Option<String> = None;

        while let Some(item) = parts.next().await {
            let part = match item {
                Ok(part) => part,
                Err(error) => return Err(fail!(error.to_classifiable())),
            };
            match &part {
                Part::Start { message_id } => {
                    streamer
                        .set_message(message_id.clone())
                        .map_err(|e| fail!(json!({ "message": e.to_string() })))?;
                    draft.start(message_id.clone());
                }
                Part::Finish {
                    finish_reason: reason,
                } => {
                    finish_reason = reason.clone();
                }
                Part::Error { error_text } => {
                    return Err(fail!(json!({ "message": error_text })));
                }
                Part::ToolInputAvailable {
                    tool_call_id,
                    tool_name,
                    input,
                } => {
                    // Providers may emit tool inputs before any start
                    // part; anchor them to a minted assistant message.
                    if draft.current_msg_id().is_none() {
                        let msg_id = mint_message_id();
                        streamer
                            .set_message(msg_id.clone())
                            .map_err(|e| fail!(json!({ "message": e.to_string() })))?;
                        draft.start(msg_id);
                    }
                    let msg_id = draft
                        .current_msg_id()
                        .expect("draft started above")
                        .to_string();
                    self.schedule_tool_call_from_part(
                        thread_id,
                        &msg_id,
                        tool_call_id,
                        tool_name,
                        input.clone(),
                    )
                    .map_err(|e| fail!(json!({ "message": e.to_string() })))?;
                    tool_calls_scheduled += 1;
                    stream_part_count += 1;
                    draft.push(&part);
                    streamer
                        .push(part.clone())
                        .map_err(|e| fail!(json!({ "message": e.to_string() })))?;
                }
                other => {
                    if other.is_meaningful() {
                        stream_part_count += 1;
                    }
                    draft.push(other);
                    streamer
                        .push(part.clone())
                        .map_err(|e| fail!(json!({ "message": e.to_string() })))?;
                }
            }
        }

        // Persist the turn's assistant messages, fenced by this stream's
        // seq so clients can drop superseded streamed parts.
        let drafted = draft.finish();
        if !drafted.is_empty() {
            let now = now_ms();
            self.store.mutate(|tables| {
                for (msg_id, parts) in drafted {
                    let created_at = tables
                        .message_mut(&thread_id, &msg_id)
                        .map(|m| m.created_at)
                        .unwrap_or(now);
                    tables.upsert_message(Message {
                        id: msg_id,
                        thread_id,
                        role: Role::Assistant,
                        parts,
                        committed_seq: Some(taken.seq),
                        metadata: None,
                        created_at,
                    });
                }
            });
            self.apply_tool_outcomes(thread_id);
        }

        let status = if tool_calls_scheduled > 0 {
            ThreadStatus::AwaitingToolResults
        } else {
            match finish_reason.as_deref() {
                Some("tool-calls") | None => {
                    return Err(fail!(json!({
                        "message": "stream ended without a terminal finish reason"
                    })));
                }
                Some(_) => ThreadStatus::Completed,
            }
        };

        streamer
            .finish()
            .map_err(|e| fail!(json!({ "message": e.to_string() })))?;

        self.store.mutate(|tables| {
            if let Some(thread) = tables.thread_mut(&thread_id) {
                thread.retry_state = None;
            }
        });

        Ok(TurnOutcome { status })
    }

    // ── Error path ─────────────────────────────────────────────────

    /// Classify, then either schedule a retry (transient error with no
    /// visible output) or fail the thread permanently.
    fn handle_turn_error(&self, thread_id: Uuid, stream_id: Uuid, error: TurnError) {
        let classification = classify(&error.raw);
        let max_attempts = self.config.stream_retry_max_attempts;
        let default_decision = if classification.retryable {
            RetryDecision::Retry { delay_ms: None }
        } else {
            RetryDecision::Fail
        };
        let decision = match &self.hooks.classify_retry {
            Some(hook) => hook(&RetryDecisionInput {
                attempt: error.attempt,
                max_attempts,
                tool_calls_scheduled: error.tool_calls_scheduled,
                stream_part_count: error.stream_part_count,
                classification: &classification,
                default_decision,
            }),
            None => default_decision,
        };

        let permitted = self.config.stream_retry_enabled
            && decision.is_retry()
            && error.attempt < max_attempts
            && (error.tool_calls_scheduled == 0 || self.config.retry_after_tool_calls)
            && error.stream_part_count == 0;

        if permitted {
            let delay = decision
                .delay_override()
                .or(classification.retry_after_ms)
                .unwrap_or_else(|| self.config.stream_backoff().delay_ms(error.attempt));

            let scheduled = self.store.mutate(|tables| {
                let Some(thread) = tables.thread(&thread_id) else {
                    return false;
                };
                if thread.stop_signal || thread.status == ThreadStatus::Stopped {
                    return false;
                }
                let fn_id = self
                    .scheduler
                    .run_after(delay, Job::ContinueStream { thread_id });
                let now = now_ms();
                {
                    let thread = tables.thread_mut(&thread_id).expect("loaded above");
                    thread.retry_state = Some(RetryState {
                        attempt: error.attempt,
                        max_attempts,
                        next_retry_at: now + delay as i64,
                        error: error.message.clone(),
                        kind: Some(classification.kind),
                        retryable: true,
                        requires_explicit_handling: classification.requires_explicit_handling,
                        retry_fn_id: Some(fn_id),
                    });
                    thread.updated_at = now;
                }
                self.abort_stream_in(
                    tables,
                    stream_id,
                    AbortReason::Error {
                        message: error.message.clone(),
                    },
                );
                true
            });

            if scheduled {
                tracing::info!(
                    %thread_id,
                    attempt = error.attempt,
                    max_attempts,
                    delay_ms = delay,
                    kind = ?classification.kind,
                    error = %error.message,
                    "stream retry scheduled"
                );
                if let Some(hook) = &self.hooks.on_retry {
                    hook(
                        thread_id,
                        &RetryNotice {
                            attempt: error.attempt,
                            max_attempts,
                            delay_ms: delay,
                            kind: Some(classification.kind),
                            message: error.message.clone(),
                        },
                    );
                }
                return;
            }
            // The thread was stopped underneath us; settle the stream and
            // do not treat the stop as a failure.
            self.abort_stream(stream_id, AbortReason::StopSignal);
            return;
        }

        // Permanent failure.
        let (was_stopped, status_changed) = self.store.mutate(|tables| {
            let Some(thread) = tables.thread(&thread_id) else {
                return (false, None);
            };
            let stopped = thread.stop_signal || thread.status == ThreadStatus::Stopped;
            let retry_fn = thread
                .retry_state
                .as_ref()
                .and_then(|state| state.retry_fn_id);
            if let Some(fn_id) = retry_fn {
                self.scheduler.cancel(&fn_id);
            }
            let changed = {
                let thread = tables.thread_mut(&thread_id).expect("loaded above");
                thread.retry_state = None;
                thread.updated_at = now_ms();
                if stopped {
                    None
                } else {
                    let was = thread.status;
                    thread.status = ThreadStatus::Failed;
                    (was != ThreadStatus::Failed).then_some(ThreadStatus::Failed)
                }
            };
            let reason = if stopped {
                AbortReason::StopSignal
            } else {
                AbortReason::Error {
                    message: error.message.clone(),
                }
            };
            self.abort_stream_in(tables, stream_id, reason);
            (stopped, changed)
        });

        if let Some(status) = status_changed {
            self.fire_status_change(thread_id, status);
        }
        if !was_stopped {
            tracing::error!(
                %thread_id,
                attempt = error.attempt,
                kind = ?classification.kind,
                error = %error.message,
                "stream turn failed"
            );
            if let Some(hook) = &self.hooks.on_error {
                hook(
                    thread_id,
                    &TurnFailure {
                        kind: classification.kind,
                        retryable: false,
                        requires_explicit_handling: classification.requires_explicit_handling,
                        attempt: error.attempt,
                        max_attempts,
                        message: error.message,
                    },
                );
            }
        }
    }

    // ── Finalization ───────────────────────────────────────────────

    /// Idempotent, fenced finalization: only effective while the thread
    /// still points at this stream *and* the stream carries the expected
    /// seq. Returns whether a `continue` flag was recorded during the
    /// turn (the caller then re-enters `continue_stream`).
    pub(crate) fn finalize_stream_turn(
        &self,
        thread_id: Uuid,
        stream_id: Uuid,
        status: Option<ThreadStatus>,
        expected_seq: u64,
    ) -> bool {
        enum Outcome {
            Mismatch,
            Done {
                continue_requested: bool,
                status_changed: Option<ThreadStatus>,
            },
        }

        let outcome = self.store.mutate(|tables| {
            let Some(thread) = tables.thread(&thread_id) else {
                return Outcome::Mismatch;
            };
            let seq_matches = tables
                .stream(&stream_id)
                .map(|s| s.seq == expected_seq)
                .unwrap_or(false);
            if thread.active_stream != Some(stream_id) || !seq_matches {
                return Outcome::Mismatch;
            }

            let thread = tables.thread_mut(&thread_id).expect("loaded above");
            let continue_requested = std::mem::take(&mut thread.continue_requested);
            thread.active_stream = None;
            thread.updated_at = now_ms();
            let mut status_changed = None;
            if let Some(status) = status {
                if thread.status != ThreadStatus::Stopped && thread.status != status {
                    thread.status = status;
                    status_changed = Some(status);
                }
            }
            Outcome::Done {
                continue_requested,
                status_changed,
            }
        });

        match outcome {
            Outcome::Mismatch => {
                self.note_finalize_mismatch(thread_id);
                false
            }
            Outcome::Done {
                continue_requested,
                status_changed,
            } => {
                if let Some(status) = status_changed {
                    self.fire_status_change(thread_id, status);
                }
                continue_requested
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::provider::UnconfiguredProvider;
    use crate::threads::CreateThread;
    use crate::EngineBuilder;

    fn engine() -> Arc<Engine> {
        EngineBuilder::new(Arc::new(UnconfiguredProvider)).build()
    }

    #[tokio::test]
    async fn finalize_clears_active_stream_and_sets_status() {
        let engine = engine();
        let thread_id = engine.create_thread(CreateThread::default()).unwrap();
        engine.continue_stream(thread_id).unwrap();
        let stream_id = engine.get_thread(thread_id).unwrap().active_stream.unwrap();

        let cont =
            engine.finalize_stream_turn(thread_id, stream_id, Some(ThreadStatus::Completed), 1);
        assert!(!cont);

        let thread = engine.get_thread(thread_id).unwrap();
        assert!(thread.active_stream.is_none());
        assert_eq!(thread.status, ThreadStatus::Completed);
    }

    #[tokio::test]
    async fn finalize_reports_continue_flag() {
        let engine = engine();
        let thread_id = engine.create_thread(CreateThread::default()).unwrap();
        engine.continue_stream(thread_id).unwrap();
        let stream_id = engine.get_thread(thread_id).unwrap().active_stream.unwrap();
        engine.store.mutate(|tables| {
            tables.thread_mut(&thread_id).unwrap().continue_requested = true;
        });

        let cont =
            engine.finalize_stream_turn(thread_id, stream_id, Some(ThreadStatus::Completed), 1);
        assert!(cont);
        assert!(!engine.get_thread(thread_id).unwrap().continue_requested);
    }

    #[tokio::test]
    async fn finalize_mismatch_is_inert() {
        let engine = engine();
        let thread_id = engine.create_thread(CreateThread::default()).unwrap();
        engine.continue_stream(thread_id).unwrap();
        let stream_id = engine.get_thread(thread_id).unwrap().active_stream.unwrap();

        // Wrong expected seq: no effect.
        let cont =
            engine.finalize_stream_turn(thread_id, stream_id, Some(ThreadStatus::Completed), 99);
        assert!(!cont);
        let thread = engine.get_thread(thread_id).unwrap();
        assert_eq!(thread.active_stream, Some(stream_id));
        assert_eq!(thread.status, ThreadStatus::Streaming);

        // Wrong stream id: no effect either.
        let cont = engine.finalize_stream_turn(
            thread_id,
            Uuid::new_v4(),
            Some(ThreadStatus::Completed),
            1,
        );
        assert!(!cont);
    }

    #[tokio::test]
    async fn finalize_never_overwrites_stopped() {
        let engine = engine();
        let thread_id = engine.create_thread(CreateThread::default()).unwrap();
        engine.continue_stream(thread_id).unwrap();
        let stream_id = engine.get_thread(thread_id).unwrap().active_stream.unwrap();
        engine.store.mutate(|tables| {
            tables.thread_mut(&thread_id).unwrap().status = ThreadStatus::Stopped;
        });

        engine.finalize_stream_turn(thread_id, stream_id, Some(ThreadStatus::Completed), 1);
        assert_eq!(
            engine.get_thread(thread_id).unwrap().status,
            ThreadStatus::Stopped
        );
    }

    #[tokio::test]
    async fn handler_tolerates_lost_take_race() {
        let engine = engine();
        let thread_id = engine.create_thread(CreateThread::default()).unwrap();
        engine.continue_stream(thread_id).unwrap();
        let stream_id = engine.get_thread(thread_id).unwrap().active_stream.unwrap();

        // Another invocation already holds the lock.
        engine.take_stream(thread_id, stream_id, "other-lock").unwrap();
        engine.run_stream_handler(thread_id, stream_id).await;

        // The holder was not disturbed.
        engine.store.read(|tables| {
            match &tables.stream(&stream_id).unwrap().state {
                strand_domain::StreamState::Streaming { lock_id, .. } => {
                    assert_eq!(lock_id, "other-lock")
                }
                other => panic!("expected streaming, got {other:?}"),
            }
        });
    }

    #[tokio::test]
    async fn unconfigured_provider_fails_thread() {
        let engine = engine();
        let thread_id = engine.create_thread(CreateThread::default()).unwrap();
        engine.continue_stream(thread_id).unwrap();
        let stream_id = engine.get_thread(thread_id).unwrap().active_stream.unwrap();

        engine.run_stream_handler(thread_id, stream_id).await;

        let thread = engine.get_thread(thread_id).unwrap();
        assert_eq!(thread.status, ThreadStatus::Failed);
        assert!(thread.active_stream.is_none());
        assert!(thread.retry_state.is_none());
    }

    #[test]
    fn draft_coalesces_text_by_id() {
        let mut draft = AssistantDraft::default();
        draft.start("m1".into());
        draft.push(&Part::TextDelta {
            id: "t".into(),
            delta: "he".into(),
            provider_metadata: None,
        });
        draft.push(&Part::TextDelta {
            id: "t".into(),
            delta: "llo".into(),
            provider_metadata: None,
        });
        draft.push(&Part::ToolInputAvailable {
            tool_call_id: "c1".into(),
            tool_name: "f".into(),
            input: json!({}),
        });

        let messages = draft.finish();
        assert_eq!(messages.len(), 1);
        let (msg_id, parts) = &messages[0];
        assert_eq!(msg_id, "m1");
        assert_eq!(parts.len(), 2);
        assert_eq!(
            parts[0],
            Part::Text {
                text: "hello".into()
            }
        );
    }

    #[test]
    fn draft_separates_messages_by_start() {
        let mut draft = AssistantDraft::default();
        draft.start("m1".into());
        draft.push(&Part::TextDelta {
            id: "t".into(),
            delta: "one".into(),
            provider_metadata: None,
        });
        draft.start("m2".into());
        draft.push(&Part::TextDelta {
            id: "t".into(),
            delta: "two".into(),
            provider_metadata: None,
        });

        let messages = draft.finish();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].0, "m1");
        assert_eq!(messages[1].0, "m2");
    }
}
