//! Stream lifecycle, the lock protocol, and the delta log.
//!
//! A stream is taken by exactly one handler invocation, identified by its
//! `lock_id`. Every delta write re-validates the lock and the thread's
//! `active_stream` pointer, so a superseded or expired handler can never
//! write into a stream it no longer owns.

use serde::Serialize;
use uuid::Uuid;

use strand_domain::{
    now_ms, AbortReason, Delta, Error, Part, Result, StreamRecord, StreamState,
};
use strand_store::Tables;

use crate::{Engine, Job};

/// What a successful `take_stream` hands the handler.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TakenStream {
    /// The stream's per-thread seq (the finalize fencing token).
    pub seq: u64,
    /// Where the streamer's delta seq continues from (non-zero after a
    /// re-entry).
    pub next_delta_seq: u64,
}

impl Engine {
    // ── Allocation ─────────────────────────────────────────────────

    /// Allocate the thread's next stream: bump `thread.seq` and insert a
    /// pending stream carrying the new value. Caller runs inside a
    /// mutation and has already verified the thread exists.
    pub(crate) fn create_stream_in(&self, tables: &mut Tables, thread_id: Uuid) -> StreamRecord {
        let now = now_ms();
        let thread = tables
            .thread_mut(&thread_id)
            .expect("create_stream_in: thread verified by caller");
        thread.seq += 1;
        let stream = StreamRecord {
            id: Uuid::new_v4(),
            thread_id,
            seq: thread.seq,
            state: StreamState::Pending { scheduled_at: now },
        };
        tables.insert_stream(stream.clone());
        stream
    }

    // ── Lock protocol ──────────────────────────────────────────────

    /// Take a pending stream with a fresh lock (or re-enter a streaming
    /// one holding the same lock). Fails when the stream is gone, owned by
    /// another lock, terminal, or no longer the thread's active stream.
    pub(crate) fn take_stream(
        &self,
        thread_id: Uuid,
        stream_id: Uuid,
        lock_id: &str,
    ) -> Result<TakenStream> {
        // Created up-front so the id can land inside the state transition;
        // cancelled again if the take does not use it.
        let timeout_fn_id = self
            .scheduler
            .run_after(self.config.timeout_interval_ms, Job::TimeoutStream { stream_id });

        let result = self.store.mutate(|tables| {
            let thread = tables.thread(&thread_id).ok_or(Error::NotFound {
                kind: "thread",
                id: thread_id.to_string(),
            })?;
            if thread.active_stream != Some(stream_id) {
                return Err(Error::ThreadActiveMismatch { stream_id });
            }
            let next_delta_seq = tables.delta_count(&stream_id) as u64;
            let stream = tables.stream_mut(&stream_id).ok_or(Error::NotFound {
                kind: "stream",
                id: stream_id.to_string(),
            })?;
            let now = now_ms();
            match &stream.state {
                StreamState::Pending { .. } => {
                    stream.state = StreamState::Streaming {
                        lock_id: lock_id.to_string(),
                        last_heartbeat: now,
                        timeout_fn_id,
                    };
                    Ok((
                        TakenStream {
                            seq: stream.seq,
                            next_delta_seq,
                        },
                        true,
                    ))
                }
                StreamState::Streaming {
                    lock_id: held,
                    timeout_fn_id: existing_timeout,
                    ..
                } if held == lock_id => {
                    // Re-entry by the same invocation: refresh the
                    // heartbeat, keep the existing timeout.
                    let existing_timeout = *existing_timeout;
                    stream.state = StreamState::Streaming {
                        lock_id: lock_id.to_string(),
                        last_heartbeat: now,
                        timeout_fn_id: existing_timeout,
                    };
                    Ok((
                        TakenStream {
                            seq: stream.seq,
                            next_delta_seq,
                        },
                        false,
                    ))
                }
                StreamState::Streaming { .. } => Err(Error::LockedByOther { stream_id }),
                _ => Err(Error::InvalidState(format!(
                    "stream {stream_id} cannot be taken from a terminal state"
                ))),
            }
        });

        match result {
            Ok((taken, used_timeout)) => {
                if !used_timeout {
                    self.scheduler.cancel(&timeout_fn_id);
                }
                Ok(taken)
            }
            Err(error) => {
                self.scheduler.cancel(&timeout_fn_id);
                Err(error)
            }
        }
    }

    /// Prove liveness of the lock holder. Aborts the stream and raises on
    /// lock or active-stream mismatch; a no-op while the last heartbeat is
    /// fresher than a quarter of the timeout interval.
    pub fn heartbeat(&self, stream_id: Uuid, lock_id: &str) -> Result<()> {
        self.store
            .mutate(|tables| self.heartbeat_in(tables, stream_id, lock_id))
    }

    fn heartbeat_in(&self, tables: &mut Tables, stream_id: Uuid, lock_id: &str) -> Result<()> {
        let stream = tables.stream(&stream_id).ok_or(Error::NotFound {
            kind: "stream",
            id: stream_id.to_string(),
        })?;
        let thread_id = stream.thread_id;

        let active = tables
            .thread(&thread_id)
            .and_then(|t| t.active_stream);
        if active != Some(stream_id) {
            self.abort_stream_in(tables, stream_id, AbortReason::ThreadActiveMismatch);
            return Err(Error::ThreadActiveMismatch { stream_id });
        }

        let now = now_ms();
        enum Decision {
            WrongLock,
            Fresh,
            Refresh { held: String, stale_timeout: Uuid },
            NotStreaming,
        }
        let decision = match &tables
            .stream(&stream_id)
            .expect("stream existence checked above")
            .state
        {
            StreamState::Streaming {
                lock_id: held,
                last_heartbeat,
                timeout_fn_id,
            } => {
                if held != lock_id {
                    Decision::WrongLock
                } else if now - *last_heartbeat < (self.config.timeout_interval_ms / 4) as i64 {
                    Decision::Fresh
                } else {
                    Decision::Refresh {
                        held: held.clone(),
                        stale_timeout: *timeout_fn_id,
                    }
                }
            }
            _ => Decision::NotStreaming,
        };

        match decision {
            Decision::WrongLock => {
                self.abort_stream_in(tables, stream_id, AbortReason::LockedByOther);
                Err(Error::LockedByOther { stream_id })
            }
            Decision::Fresh => Ok(()),
            Decision::Refresh {
                held,
                stale_timeout,
            } => {
                let new_timeout = self
                    .scheduler
                    .run_after(self.config.timeout_interval_ms, Job::TimeoutStream { stream_id });
                if let Some(stream) = tables.stream_mut(&stream_id) {
                    stream.state = StreamState::Streaming {
                        lock_id: held,
                        last_heartbeat: now,
                        timeout_fn_id: new_timeout,
                    };
                }
                self.scheduler.cancel(&stale_timeout);
                Ok(())
            }
            Decision::NotStreaming => Err(Error::InvalidState(format!(
                "heartbeat on non-streaming stream {stream_id}"
            ))),
        }
    }

    // ── Deltas ─────────────────────────────────────────────────────

    /// Append a delta batch under the lock. Heartbeat-validates first, so
    /// a write by a superseded handler aborts its stream and errors.
    pub fn add_delta(
        &self,
        stream_id: Uuid,
        lock_id: &str,
        seq: u64,
        msg_id: &str,
        parts: Vec<Part>,
    ) -> Result<()> {
        self.store.mutate(|tables| {
            self.heartbeat_in(tables, stream_id, lock_id)?;
            let ok = tables.push_delta(Delta {
                stream_id,
                seq,
                msg_id: msg_id.to_string(),
                parts,
            });
            if !ok {
                return Err(Error::InvalidState(format!(
                    "delta seq {seq} is not the next dense seq for stream {stream_id}"
                )));
            }
            Ok(())
        })
    }

    /// Append a delta outside the handler's lock (tool outcomes between
    /// streams). Targets the thread's active stream when it is
    /// non-terminal, else the newest surviving stream; seq is assigned by
    /// the store so the log stays dense.
    pub(crate) fn append_outcome_delta_in(
        &self,
        tables: &mut Tables,
        thread_id: Uuid,
        msg_id: &str,
        part: Part,
    ) {
        let target = tables
            .thread(&thread_id)
            .and_then(|t| t.active_stream)
            .filter(|id| {
                tables
                    .stream(id)
                    .map(|s| !s.state.is_terminal())
                    .unwrap_or(false)
            })
            .or_else(|| tables.thread_streams(&thread_id).last().copied());

        let Some(stream_id) = target else {
            tracing::debug!(%thread_id, "no stream to carry tool outcome delta");
            return;
        };
        let seq = tables.delta_count(&stream_id) as u64;
        tables.push_delta(Delta {
            stream_id,
            seq,
            msg_id: msg_id.to_string(),
            parts: vec![part],
        });
    }

    // ── Termination ────────────────────────────────────────────────

    /// Finish a streaming stream: cancel its timeout and schedule the
    /// delayed delete. Idempotent once terminal.
    pub fn finish_stream(&self, stream_id: Uuid) -> Result<()> {
        self.store.mutate(|tables| {
            let stream = tables.stream_mut(&stream_id).ok_or(Error::NotFound {
                kind: "stream",
                id: stream_id.to_string(),
            })?;
            match &stream.state {
                StreamState::Streaming { timeout_fn_id, .. } => {
                    let timeout = *timeout_fn_id;
                    let cleanup_fn_id = self
                        .scheduler
                        .run_after(self.config.delete_stream_delay_ms, Job::DeleteStream { stream_id });
                    stream.state = StreamState::Finished {
                        ended_at: now_ms(),
                        cleanup_fn_id,
                    };
                    self.scheduler.cancel(&timeout);
                    Ok(())
                }
                state if state.is_terminal() => Ok(()),
                _ => Err(Error::InvalidState(format!(
                    "finish on stream {stream_id} that was never taken"
                ))),
            }
        })
    }

    /// Abort a stream from any non-terminal state. Idempotent.
    pub fn abort_stream(&self, stream_id: Uuid, reason: AbortReason) {
        self.store
            .mutate(|tables| self.abort_stream_in(tables, stream_id, reason));
    }

    pub(crate) fn abort_stream_in(
        &self,
        tables: &mut Tables,
        stream_id: Uuid,
        reason: AbortReason,
    ) {
        let Some(stream) = tables.stream_mut(&stream_id) else {
            return;
        };
        if stream.state.is_terminal() {
            return;
        }
        let stale_timeout = stream.state.timeout_fn_id();
        let cleanup_fn_id = self
            .scheduler
            .run_after(self.config.delete_stream_delay_ms, Job::DeleteStream { stream_id });
        stream.state = StreamState::Aborted {
            reason,
            cleanup_fn_id: Some(cleanup_fn_id),
        };
        if let Some(timeout) = stale_timeout {
            self.scheduler.cancel(&timeout);
        }
    }

    /// Abort every non-terminal stream of the thread other than
    /// `active_stream_id` as superseded.
    pub(crate) fn cancel_inactive_streams_in(
        &self,
        tables: &mut Tables,
        thread_id: Uuid,
        active_stream_id: Uuid,
    ) {
        let others: Vec<Uuid> = tables
            .thread_streams(&thread_id)
            .iter()
            .copied()
            .filter(|id| *id != active_stream_id)
            .filter(|id| {
                tables
                    .stream(id)
                    .map(|s| !s.state.is_terminal())
                    .unwrap_or(false)
            })
            .collect();
        for id in others {
            self.abort_stream_in(tables, id, AbortReason::Superseded);
        }
    }

    /// Liveness: streaming with a heartbeat younger than the threshold.
    pub(crate) fn stream_alive(&self, state: &StreamState, now: i64) -> bool {
        match state {
            StreamState::Streaming { last_heartbeat, .. } => {
                now - *last_heartbeat < self.config.liveness_threshold_ms as i64
            }
            _ => false,
        }
    }

    /// Scheduled timeout callback: the lock holder went silent.
    pub(crate) fn timeout_stream(&self, stream_id: Uuid) {
        self.store.mutate(|tables| {
            let still_streaming = tables
                .stream(&stream_id)
                .map(|s| matches!(s.state, StreamState::Streaming { .. }))
                .unwrap_or(false);
            if still_streaming {
                tracing::warn!(%stream_id, "stream heartbeat timed out");
                self.abort_stream_in(tables, stream_id, AbortReason::Timeout);
            }
        });
    }

    /// Incremental delete: drop a batch of deltas, re-scheduling until the
    /// log is drained, then remove the stream record.
    pub(crate) fn delete_stream_step(&self, stream_id: Uuid) {
        let reschedule = self.store.mutate(|tables| {
            if tables.stream(&stream_id).is_none() {
                return false;
            }
            let remaining = tables.drain_deltas(&stream_id, self.config.delta_delete_batch);
            if remaining > 0 {
                return true;
            }
            if let Some(stream) = tables.remove_stream(&stream_id) {
                // A pending cleanup callback other than the one that got
                // us here would fire into nothing; cancel it.
                let cleanup = match stream.state {
                    StreamState::Finished { cleanup_fn_id, .. } => Some(cleanup_fn_id),
                    StreamState::Aborted { cleanup_fn_id, .. } => cleanup_fn_id,
                    _ => None,
                };
                if let Some(id) = cleanup {
                    self.scheduler.cancel(&id);
                }
            }
            false
        });
        if reschedule {
            self.scheduler.run_after(0, Job::DeleteStream { stream_id });
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming updates (read-only)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A streamed part stamped with its source stream seq, so clients can
/// drop parts already superseded by a message's `committed_seq`.
#[derive(Debug, Clone, Serialize)]
pub struct StreamedPart {
    pub stream_seq: u64,
    pub part: Part,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamingMessage {
    pub msg_id: String,
    pub parts: Vec<StreamedPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamUpdates {
    pub messages: Vec<StreamingMessage>,
    /// Cursor for the next poll (`from_seq` of the follow-up call).
    pub next_seq: u64,
}

impl Engine {
    /// Introspection: a thread's streams in allocation order.
    pub fn list_streams(&self, thread_id: Uuid) -> Vec<StreamRecord> {
        self.store.read(|tables| {
            tables
                .thread_streams(&thread_id)
                .iter()
                .filter_map(|id| tables.stream(id).cloned())
                .collect()
        })
    }

    /// Introspection: a thread's tool calls in creation order.
    pub fn list_tool_calls(&self, thread_id: Uuid) -> Vec<strand_domain::ToolCallRecord> {
        self.store
            .read(|tables| tables.tool_calls(&thread_id).to_vec())
    }

    /// Join streams with `seq >= from_seq` to their deltas in order,
    /// rewriting colliding part ids through a per-message alias map so
    /// parts from concurrent streams stay distinct on the client.
    pub fn stream_updates(&self, thread_id: Uuid, from_seq: Option<u64>) -> StreamUpdates {
        let from_seq = from_seq.unwrap_or(0);
        self.store.read(|tables| {
            let mut streams: Vec<&StreamRecord> = tables
                .thread_streams(&thread_id)
                .iter()
                .filter_map(|id| tables.stream(id))
                .filter(|s| s.seq >= from_seq)
                .collect();
            streams.sort_by_key(|s| s.seq);

            let mut messages: Vec<StreamingMessage> = Vec::new();
            let mut message_index: std::collections::HashMap<String, usize> =
                std::collections::HashMap::new();
            // (msg_id, original part id) → stream seq that first used it.
            let mut id_owners: std::collections::HashMap<(String, String), u64> =
                std::collections::HashMap::new();

            let mut taken = 0usize;
            let mut max_seq = None;
            'outer: for stream in &streams {
                for delta in tables.deltas(&stream.id) {
                    if taken >= self.config.max_deltas_per_request {
                        break 'outer;
                    }
                    taken += 1;
                    max_seq = Some(max_seq.map_or(stream.seq, |m: u64| m.max(stream.seq)));

                    let slot = *message_index
                        .entry(delta.msg_id.clone())
                        .or_insert_with(|| {
                            messages.push(StreamingMessage {
                                msg_id: delta.msg_id.clone(),
                                parts: Vec::new(),
                            });
                            messages.len() - 1
                        });

                    for part in &delta.parts {
                        let mut part = part.clone();
                        if let Some(original) = part.content_id().map(str::to_string) {
                            let owner = *id_owners
                                .entry((delta.msg_id.clone(), original.clone()))
                                .or_insert(stream.seq);
                            if owner != stream.seq {
                                part.set_content_id(format!("{original}#s{}", stream.seq));
                            }
                        }
                        messages[slot].parts.push(StreamedPart {
                            stream_seq: stream.seq,
                            part,
                        });
                    }
                }
            }

            StreamUpdates {
                messages,
                next_seq: max_seq.map_or(from_seq, |m| m + 1),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use strand_domain::{Thread, ThreadStatus};

    use crate::provider::UnconfiguredProvider;
    use crate::EngineBuilder;

    fn engine() -> Arc<Engine> {
        EngineBuilder::new(Arc::new(UnconfiguredProvider)).build()
    }

    /// Insert a thread with a pending active stream, as `continue_stream`
    /// would leave it.
    fn seed_thread(engine: &Engine) -> (Uuid, Uuid) {
        engine.store.mutate(|tables| {
            let mut thread = Thread::new(now_ms());
            let thread_id = thread.id;
            thread.status = ThreadStatus::Streaming;
            tables.insert_thread(thread);
            let stream = engine.create_stream_in(tables, thread_id);
            let stream_id = stream.id;
            tables.thread_mut(&thread_id).unwrap().active_stream = Some(stream_id);
            (thread_id, stream_id)
        })
    }

    #[tokio::test]
    async fn take_pending_stream() {
        let engine = engine();
        let (thread_id, stream_id) = seed_thread(&engine);

        let taken = engine.take_stream(thread_id, stream_id, "lock-1").unwrap();
        assert_eq!(taken.seq, 1);
        assert_eq!(taken.next_delta_seq, 0);

        engine.store.read(|tables| {
            match &tables.stream(&stream_id).unwrap().state {
                StreamState::Streaming { lock_id, .. } => assert_eq!(lock_id, "lock-1"),
                other => panic!("expected streaming, got {other:?}"),
            }
        });
    }

    #[tokio::test]
    async fn take_with_other_lock_is_rejected() {
        let engine = engine();
        let (thread_id, stream_id) = seed_thread(&engine);
        engine.take_stream(thread_id, stream_id, "lock-1").unwrap();

        let err = engine
            .take_stream(thread_id, stream_id, "lock-2")
            .unwrap_err();
        assert!(matches!(err, Error::LockedByOther { .. }));

        // The previous holder still owns the stream.
        engine.store.read(|tables| {
            match &tables.stream(&stream_id).unwrap().state {
                StreamState::Streaming { lock_id, .. } => assert_eq!(lock_id, "lock-1"),
                other => panic!("expected streaming, got {other:?}"),
            }
        });
    }

    #[tokio::test]
    async fn reentry_with_same_lock_refreshes() {
        let engine = engine();
        let (thread_id, stream_id) = seed_thread(&engine);
        engine.take_stream(thread_id, stream_id, "lock-1").unwrap();
        engine
            .add_delta(
                stream_id,
                "lock-1",
                0,
                "m1",
                vec![Part::Text { text: "x".into() }],
            )
            .unwrap();

        let taken = engine.take_stream(thread_id, stream_id, "lock-1").unwrap();
        // The streamer resumes after the deltas already written.
        assert_eq!(taken.next_delta_seq, 1);
    }

    #[tokio::test]
    async fn take_requires_active_stream_pointer() {
        let engine = engine();
        let (thread_id, stream_id) = seed_thread(&engine);
        engine.store.mutate(|tables| {
            tables.thread_mut(&thread_id).unwrap().active_stream = None;
        });

        let err = engine
            .take_stream(thread_id, stream_id, "lock-1")
            .unwrap_err();
        assert!(matches!(err, Error::ThreadActiveMismatch { .. }));
    }

    #[tokio::test]
    async fn add_delta_with_wrong_lock_aborts_stream() {
        let engine = engine();
        let (thread_id, stream_id) = seed_thread(&engine);
        engine.take_stream(thread_id, stream_id, "lock-1").unwrap();

        let err = engine
            .add_delta(stream_id, "lock-2", 0, "m1", vec![])
            .unwrap_err();
        assert!(matches!(err, Error::LockedByOther { .. }));

        engine.store.read(|tables| {
            match &tables.stream(&stream_id).unwrap().state {
                StreamState::Aborted { reason, .. } => {
                    assert_eq!(*reason, AbortReason::LockedByOther)
                }
                other => panic!("expected aborted, got {other:?}"),
            }
        });
    }

    #[tokio::test]
    async fn add_delta_enforces_dense_seq() {
        let engine = engine();
        let (thread_id, stream_id) = seed_thread(&engine);
        engine.take_stream(thread_id, stream_id, "lock-1").unwrap();

        engine
            .add_delta(stream_id, "lock-1", 0, "m1", vec![])
            .unwrap();
        let err = engine
            .add_delta(stream_id, "lock-1", 2, "m1", vec![])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let engine = engine();
        let (thread_id, stream_id) = seed_thread(&engine);
        engine.take_stream(thread_id, stream_id, "lock-1").unwrap();

        engine.finish_stream(stream_id).unwrap();
        engine.finish_stream(stream_id).unwrap();

        engine.store.read(|tables| {
            assert!(matches!(
                tables.stream(&stream_id).unwrap().state,
                StreamState::Finished { .. }
            ));
        });
    }

    #[tokio::test]
    async fn abort_then_finish_keeps_abort() {
        let engine = engine();
        let (thread_id, stream_id) = seed_thread(&engine);
        engine.take_stream(thread_id, stream_id, "lock-1").unwrap();

        engine.abort_stream(stream_id, AbortReason::StopSignal);
        engine.finish_stream(stream_id).unwrap();

        engine.store.read(|tables| {
            match &tables.stream(&stream_id).unwrap().state {
                StreamState::Aborted { reason, .. } => {
                    assert_eq!(*reason, AbortReason::StopSignal)
                }
                other => panic!("expected aborted, got {other:?}"),
            }
        });
    }

    #[tokio::test]
    async fn timeout_only_fires_on_streaming() {
        let engine = engine();
        let (thread_id, stream_id) = seed_thread(&engine);
        engine.take_stream(thread_id, stream_id, "lock-1").unwrap();
        engine.finish_stream(stream_id).unwrap();

        engine.timeout_stream(stream_id);
        engine.store.read(|tables| {
            assert!(matches!(
                tables.stream(&stream_id).unwrap().state,
                StreamState::Finished { .. }
            ));
        });
    }

    #[tokio::test]
    async fn delete_stream_drains_then_removes() {
        let engine = engine();
        let (thread_id, stream_id) = seed_thread(&engine);
        engine.take_stream(thread_id, stream_id, "lock-1").unwrap();
        for seq in 0..150u64 {
            engine
                .add_delta(stream_id, "lock-1", seq, "m1", vec![])
                .unwrap();
        }
        engine.finish_stream(stream_id).unwrap();

        // Two batches of 100, then the record goes away.
        engine.delete_stream_step(stream_id);
        engine
            .store
            .read(|tables| assert_eq!(tables.delta_count(&stream_id), 50));
        engine.delete_stream_step(stream_id);
        engine.delete_stream_step(stream_id);
        engine
            .store
            .read(|tables| assert!(tables.stream(&stream_id).is_none()));
    }

    #[tokio::test]
    async fn cancel_inactive_supersedes_others() {
        let engine = engine();
        let (thread_id, first) = seed_thread(&engine);
        let second = engine.store.mutate(|tables| {
            let stream = engine.create_stream_in(tables, thread_id);
            tables.thread_mut(&thread_id).unwrap().active_stream = Some(stream.id);
            stream.id
        });

        engine.store.mutate(|tables| {
            engine.cancel_inactive_streams_in(tables, thread_id, second);
        });

        engine.store.read(|tables| {
            match &tables.stream(&first).unwrap().state {
                StreamState::Aborted { reason, .. } => {
                    assert_eq!(*reason, AbortReason::Superseded)
                }
                other => panic!("expected superseded, got {other:?}"),
            }
            assert!(!tables.stream(&second).unwrap().state.is_terminal());
        });
    }

    #[tokio::test]
    async fn updates_stamp_and_alias_ids() {
        let engine = engine();
        let (thread_id, first) = seed_thread(&engine);
        engine.take_stream(thread_id, first, "lock-1").unwrap();
        engine
            .add_delta(
                first,
                "lock-1",
                0,
                "m1",
                vec![Part::TextDelta {
                    id: "t".into(),
                    delta: "he".into(),
                    provider_metadata: None,
                }],
            )
            .unwrap();

        // A second stream writes to the same message with a colliding id.
        let second = engine.store.mutate(|tables| {
            engine.abort_stream_in(tables, first, AbortReason::Expired);
            let stream = engine.create_stream_in(tables, thread_id);
            tables.thread_mut(&thread_id).unwrap().active_stream = Some(stream.id);
            stream.id
        });
        engine.take_stream(thread_id, second, "lock-2").unwrap();
        engine
            .add_delta(
                second,
                "lock-2",
                0,
                "m1",
                vec![Part::TextDelta {
                    id: "t".into(),
                    delta: "hello".into(),
                    provider_metadata: None,
                }],
            )
            .unwrap();

        let updates = engine.stream_updates(thread_id, None);
        assert_eq!(updates.messages.len(), 1);
        let parts = &updates.messages[0].parts;
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].stream_seq, 1);
        assert_eq!(parts[0].part.content_id(), Some("t"));
        assert_eq!(parts[1].stream_seq, 2);
        assert_eq!(parts[1].part.content_id(), Some("t#s2"));
        assert_eq!(updates.next_seq, 3);
    }

    #[tokio::test]
    async fn updates_respect_from_seq() {
        let engine = engine();
        let (thread_id, first) = seed_thread(&engine);
        engine.take_stream(thread_id, first, "lock-1").unwrap();
        engine
            .add_delta(first, "lock-1", 0, "m1", vec![Part::Text { text: "a".into() }])
            .unwrap();

        let updates = engine.stream_updates(thread_id, Some(2));
        assert!(updates.messages.is_empty());
        assert_eq!(updates.next_seq, 2);
    }
}
