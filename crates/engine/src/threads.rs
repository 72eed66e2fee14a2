//! Thread lifecycle and the `continue_stream` decision procedure.
//!
//! User intents (create/send/resume/stop/delete) funnel into
//! [`Engine::continue_stream`], the single place that decides whether a
//! new stream starts, an in-flight handler is asked to re-enter, or the
//! thread settles into a terminal status.

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use strand_domain::{
    message::mint_message_id, now_ms, AbortReason, Error, Message, Part, Result, Role,
    StreamState, Thread, ThreadStatus,
};

use crate::{Engine, Job};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateThread {
    /// Initial user prompt; appending it implies `auto_start` unless
    /// overridden.
    pub prompt: Option<String>,
    /// Seed messages appended before the prompt (system context, imported
    /// history).
    #[serde(default)]
    pub messages: Vec<MessageInit>,
    pub auto_start: Option<bool>,
}

/// A raw message append.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageInit {
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl MessageInit {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::Text { text: text.into() }],
            metadata: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            parts: vec![Part::Text { text: text.into() }],
            metadata: None,
        }
    }

    fn into_message(self, thread_id: Uuid, now: i64) -> Message {
        Message {
            id: mint_message_id(),
            thread_id,
            role: self.role,
            parts: self.parts,
            committed_seq: None,
            metadata: self.metadata,
            created_at: now,
        }
    }
}

enum ContinueOutcome {
    Missing,
    Done,
    StatusChanged(ThreadStatus),
    Start {
        stream_id: Uuid,
        status_changed: bool,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Thread API
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Engine {
    pub fn create_thread(&self, input: CreateThread) -> Result<Uuid> {
        let auto_start = input.auto_start.unwrap_or(input.prompt.is_some());
        let now = now_ms();
        let thread_id = self.store.mutate(|tables| {
            let thread = Thread::new(now);
            let thread_id = thread.id;
            tables.insert_thread(thread);
            for init in input.messages {
                tables.push_message(init.into_message(thread_id, now));
            }
            if let Some(prompt) = input.prompt {
                tables.push_message(Message::text(thread_id, Role::User, prompt, now));
            }
            thread_id
        });
        tracing::debug!(%thread_id, auto_start, "thread created");
        if auto_start {
            self.dispatch(Job::ContinueStream { thread_id });
        }
        Ok(thread_id)
    }

    /// Append a user message and drive the next turn.
    pub fn send_message(&self, thread_id: Uuid, prompt: impl Into<String>) -> Result<()> {
        let prompt = prompt.into();
        self.store.mutate(|tables| {
            let thread = tables.thread_mut(&thread_id).ok_or(Error::NotFound {
                kind: "thread",
                id: thread_id.to_string(),
            })?;
            if thread.retry_state.is_some() {
                return Err(Error::RetryPending(thread_id));
            }
            thread.stop_signal = false;
            thread.updated_at = now_ms();
            tables.push_message(Message::text(thread_id, Role::User, prompt, now_ms()));
            Ok(())
        })?;
        self.dispatch(Job::ContinueStream { thread_id });
        Ok(())
    }

    /// Append a message without starting a turn. Returns the minted id.
    pub fn add_message(&self, thread_id: Uuid, init: MessageInit) -> Result<String> {
        self.store.mutate(|tables| {
            if tables.thread(&thread_id).is_none() {
                return Err(Error::NotFound {
                    kind: "thread",
                    id: thread_id.to_string(),
                });
            }
            let message = init.into_message(thread_id, now_ms());
            let msg_id = message.id.clone();
            tables.push_message(message);
            Ok(msg_id)
        })
    }

    /// Re-drive a thread: with a prompt this is `send_message`; without
    /// one the thread must be idle (a crashed or stopped turn is restarted
    /// against the existing transcript).
    pub fn resume_thread(&self, thread_id: Uuid, prompt: Option<String>) -> Result<()> {
        self.store.mutate(|tables| {
            let thread = tables.thread_mut(&thread_id).ok_or(Error::NotFound {
                kind: "thread",
                id: thread_id.to_string(),
            })?;
            if thread.retry_state.is_some() {
                return Err(Error::RetryPending(thread_id));
            }
            match prompt {
                Some(prompt) => {
                    thread.stop_signal = false;
                    thread.updated_at = now_ms();
                    tables.push_message(Message::text(thread_id, Role::User, prompt, now_ms()));
                }
                None => {
                    if !thread.status.is_idle() {
                        return Err(Error::NotResumable(thread_id));
                    }
                    thread.stop_signal = false;
                    thread.updated_at = now_ms();
                }
            }
            Ok(())
        })?;
        self.dispatch(Job::ContinueStream { thread_id });
        Ok(())
    }

    /// Request a cooperative stop. The transition to `stopped` happens at
    /// the next observation point; enqueueing `continue_stream` makes that
    /// point now-ish rather than the next heartbeat or tool completion.
    pub fn stop_thread(&self, thread_id: Uuid) -> Result<()> {
        let retry_fn = self.store.mutate(|tables| {
            let thread = tables.thread_mut(&thread_id).ok_or(Error::NotFound {
                kind: "thread",
                id: thread_id.to_string(),
            })?;
            thread.stop_signal = true;
            thread.updated_at = now_ms();
            Ok::<_, Error>(thread
                .retry_state
                .take()
                .and_then(|state| state.retry_fn_id))
        })?;
        if let Some(fn_id) = retry_fn {
            self.scheduler.cancel(&fn_id);
        }
        self.dispatch(Job::ContinueStream { thread_id });
        Ok(())
    }

    /// Cascade-delete a thread: messages, tool calls, streams, deltas,
    /// and every scheduled function they own.
    pub fn delete_thread(&self, thread_id: Uuid) -> Result<()> {
        let removed = self
            .store
            .mutate(|tables| tables.remove_thread(&thread_id))
            .ok_or(Error::NotFound {
                kind: "thread",
                id: thread_id.to_string(),
            })?;

        if let Some(fn_id) = removed
            .thread
            .retry_state
            .as_ref()
            .and_then(|s| s.retry_fn_id)
        {
            self.scheduler.cancel(&fn_id);
        }
        for stream in &removed.streams {
            match &stream.state {
                StreamState::Streaming { timeout_fn_id, .. } => {
                    self.scheduler.cancel(timeout_fn_id);
                }
                StreamState::Finished { cleanup_fn_id, .. } => {
                    self.scheduler.cancel(cleanup_fn_id);
                }
                StreamState::Aborted {
                    cleanup_fn_id: Some(cleanup_fn_id),
                    ..
                } => {
                    self.scheduler.cancel(cleanup_fn_id);
                }
                _ => {}
            }
        }
        for call in &removed.tool_calls {
            if let Some(fn_id) = call.timeout_fn_id {
                self.scheduler.cancel(&fn_id);
            }
            if let Some(fn_id) = call.execution_retry_fn_id {
                self.scheduler.cancel(&fn_id);
            }
        }
        tracing::debug!(%thread_id, "thread deleted");
        Ok(())
    }

    pub fn get_thread(&self, thread_id: Uuid) -> Option<Thread> {
        self.store.read(|tables| tables.thread(&thread_id).cloned())
    }

    /// Threads ordered newest-first.
    pub fn list_threads(&self, limit: Option<usize>) -> Vec<Thread> {
        self.store.read(|tables| {
            let mut threads: Vec<Thread> = tables.threads().cloned().collect();
            threads.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            threads.truncate(limit.unwrap_or(50));
            threads
        })
    }

    pub fn list_messages(&self, thread_id: Uuid) -> Vec<Message> {
        self.store
            .read(|tables| tables.messages(&thread_id).to_vec())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // continue_stream — the central decision procedure
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Decide, in one transaction, how the thread advances:
    ///
    /// 1. A raised stop signal settles the thread into `stopped`.
    /// 2. Pending tool calls defer to `on_tool_complete`.
    /// 3. A live active stream is asked to re-enter at finalize.
    /// 4. Otherwise the dead/pending active stream is cancelled and the
    ///    next stream is allocated, activated, and handed to a handler.
    pub fn continue_stream(&self, thread_id: Uuid) -> Result<()> {
        let outcome = self.store.mutate(|tables| {
            let Some(thread) = tables.thread(&thread_id) else {
                return ContinueOutcome::Missing;
            };
            let previous_status = thread.status;
            let previous_active = thread.active_stream;

            // 1. Stop signal wins over everything.
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
                    self.abort_stream_in(tables, stream_id, AbortReason::StopSignal);
                }
                return if previous_status != ThreadStatus::Stopped {
                    ContinueOutcome::StatusChanged(ThreadStatus::Stopped)
                } else {
                    ContinueOutcome::Done
                };
            }

            // 2. A stopped thread stays stopped.
            if previous_status == ThreadStatus::Stopped {
                return ContinueOutcome::Done;
            }

            // 3. Tool work in flight: the tool-call manager re-invokes us
            // when the last one completes.
            if tables.pending_tool_calls(&thread_id) > 0 {
                return ContinueOutcome::Done;
            }

            // 4. Active stream handling.
            let now = now_ms();
            if let Some(active_id) = previous_active {
                if let Some(stream) = tables.stream(&active_id) {
                    if self.stream_alive(&stream.state, now) {
                        tables
                            .thread_mut(&thread_id)
                            .expect("loaded above")
                            .continue_requested = true;
                        return ContinueOutcome::Done;
                    }
                    if !stream.state.is_terminal() {
                        let reason = match stream.state {
                            StreamState::Streaming { .. } => AbortReason::Expired,
                            _ => AbortReason::Superseded,
                        };
                        self.abort_stream_in(tables, active_id, reason);
                    }
                }
                tables
                    .thread_mut(&thread_id)
                    .expect("loaded above")
                    .active_stream = None;
            }

            // 5–7. Allocate the next stream and activate it.
            let stream = self.create_stream_in(tables, thread_id);
            let stream_id = stream.id;
            {
                let thread = tables.thread_mut(&thread_id).expect("loaded above");
                thread.active_stream = Some(stream_id);
                thread.status = ThreadStatus::Streaming;
                thread.continue_requested = false;
                thread.updated_at = now;
            }
            self.cancel_inactive_streams_in(tables, thread_id, stream_id);

            ContinueOutcome::Start {
                stream_id,
                status_changed: previous_status != ThreadStatus::Streaming,
            }
        });

        match outcome {
            ContinueOutcome::Missing => {
                tracing::warn!(%thread_id, "continue_stream on unknown thread");
                Ok(())
            }
            ContinueOutcome::Done => Ok(()),
            ContinueOutcome::StatusChanged(status) => {
                self.fire_status_change(thread_id, status);
                Ok(())
            }
            ContinueOutcome::Start {
                stream_id,
                status_changed,
            } => {
                if status_changed {
                    self.fire_status_change(thread_id, ThreadStatus::Streaming);
                }
                // 8. Hand the stream to a handler (through the work pool
                // when one is configured).
                self.dispatch(Job::StreamHandler {
                    thread_id,
                    stream_id,
                });
                Ok(())
            }
        }
    }
}
