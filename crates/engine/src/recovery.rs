//! Recovery sweep — re-drives work lost to a process restart.
//!
//! Scheduled jobs live only in memory, so a crash orphans threads that
//! were mid-turn and tool calls whose execution was queued. The sweep
//! re-derives both from the persistent records: threads stuck in
//! `streaming`/`awaiting_tool_results` are pushed back through
//! `continue_stream`, and pending sync tool calls with no live scheduled
//! execution are re-enqueued.

use uuid::Uuid;

use strand_domain::{now_ms, ThreadStatus};

use crate::Engine;

/// Cap on tool calls re-adopted per sweep.
const RESUME_SWEEP_LIMIT: usize = 50;

impl Engine {
    pub(crate) fn recovery_tick(&self) {
        let now = now_ms();
        let stuck: Vec<Uuid> = self.store.read(|tables| {
            tables
                .threads()
                .filter(|thread| {
                    matches!(
                        thread.status,
                        ThreadStatus::Streaming | ThreadStatus::AwaitingToolResults
                    )
                })
                // A scheduled retry owns its thread until it fires; waking
                // the thread early would cut the backoff short.
                .filter(|thread| {
                    thread
                        .retry_state
                        .as_ref()
                        .and_then(|state| state.retry_fn_id)
                        .map_or(true, |fn_id| !self.scheduler.is_pending(&fn_id))
                })
                // A live handler needs no recovery.
                .filter(|thread| {
                    !thread
                        .active_stream
                        .and_then(|id| tables.stream(&id))
                        .map(|stream| self.stream_alive(&stream.state, now))
                        .unwrap_or(false)
                })
                .map(|thread| thread.id)
                .collect()
        });

        for thread_id in &stuck {
            if let Err(error) = self.continue_stream(*thread_id) {
                tracing::warn!(%thread_id, %error, "recovery continue_stream failed");
            }
        }

        let resumed = self.resume_pending_sync_tool_executions(RESUME_SWEEP_LIMIT);
        if !stuck.is_empty() || resumed > 0 {
            tracing::info!(
                threads = stuck.len(),
                tool_calls = resumed,
                "recovery sweep re-drove orphaned work"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::provider::UnconfiguredProvider;
    use crate::threads::CreateThread;
    use crate::EngineBuilder;
    use strand_domain::{RetryState, StreamState};

    fn engine() -> Arc<Engine> {
        EngineBuilder::new(Arc::new(UnconfiguredProvider)).build()
    }

    #[tokio::test]
    async fn sweep_redrives_dead_streaming_thread() {
        let engine = engine();
        let thread_id = engine.create_thread(CreateThread::default()).unwrap();
        engine.continue_stream(thread_id).unwrap();
        let first = engine.get_thread(thread_id).unwrap().active_stream.unwrap();
        // Simulate a handler that died right after taking the stream: a
        // streaming state with an ancient heartbeat.
        engine.store.mutate(|tables| {
            tables.stream_mut(&first).unwrap().state = StreamState::Streaming {
                lock_id: "dead".into(),
                last_heartbeat: now_ms() - 10 * 60 * 1_000,
                timeout_fn_id: Uuid::new_v4(),
            };
        });

        engine.recovery_tick();

        let thread = engine.get_thread(thread_id).unwrap();
        let second = thread.active_stream.unwrap();
        assert_ne!(first, second, "a fresh stream was allocated");
        engine.store.read(|tables| {
            assert!(matches!(
                tables.stream(&first).unwrap().state,
                StreamState::Aborted { .. }
            ));
        });
    }

    #[tokio::test]
    async fn sweep_skips_live_handler() {
        let engine = engine();
        let thread_id = engine.create_thread(CreateThread::default()).unwrap();
        engine.continue_stream(thread_id).unwrap();
        let stream_id = engine.get_thread(thread_id).unwrap().active_stream.unwrap();
        engine.take_stream(thread_id, stream_id, "live").unwrap();

        engine.recovery_tick();

        let thread = engine.get_thread(thread_id).unwrap();
        assert_eq!(thread.active_stream, Some(stream_id));
        assert!(
            !thread.continue_requested,
            "recovery must not queue spurious turns behind a live handler"
        );
    }

    #[tokio::test]
    async fn sweep_respects_pending_retry_backoff() {
        let engine = engine();
        let thread_id = engine.create_thread(CreateThread::default()).unwrap();
        engine.store.mutate(|tables| {
            tables.thread_mut(&thread_id).unwrap().status = ThreadStatus::Streaming;
        });
        // Retry scheduled far in the future.
        let fn_id = engine
            .scheduler
            .run_after(60_000, crate::Job::ContinueStream { thread_id });
        engine.store.mutate(|tables| {
            tables.thread_mut(&thread_id).unwrap().retry_state = Some(RetryState {
                attempt: 1,
                max_attempts: 3,
                next_retry_at: now_ms() + 60_000,
                error: "upstream".into(),
                kind: None,
                retryable: true,
                requires_explicit_handling: false,
                retry_fn_id: Some(fn_id),
            });
        });

        engine.recovery_tick();

        let thread = engine.get_thread(thread_id).unwrap();
        assert!(
            thread.active_stream.is_none(),
            "backoff must not be cut short by the sweep"
        );
        assert_eq!(thread.seq, 0);
    }

    #[tokio::test]
    async fn sweep_redrives_thread_with_orphaned_retry() {
        let engine = engine();
        let thread_id = engine.create_thread(CreateThread::default()).unwrap();
        engine.store.mutate(|tables| {
            let thread = tables.thread_mut(&thread_id).unwrap();
            thread.status = ThreadStatus::Streaming;
            // Retry state whose scheduled fn vanished with the old process.
            thread.retry_state = Some(RetryState {
                attempt: 1,
                max_attempts: 3,
                next_retry_at: now_ms() - 1,
                error: "upstream".into(),
                kind: None,
                retryable: true,
                requires_explicit_handling: false,
                retry_fn_id: Some(Uuid::new_v4()),
            });
        });

        engine.recovery_tick();

        let thread = engine.get_thread(thread_id).unwrap();
        assert!(thread.active_stream.is_some(), "turn was re-driven");
    }

    #[tokio::test]
    async fn sweep_ignores_idle_threads() {
        let engine = engine();
        let thread_id = engine.create_thread(CreateThread::default()).unwrap();

        engine.recovery_tick();

        let thread = engine.get_thread(thread_id).unwrap();
        assert_eq!(thread.status, ThreadStatus::Completed);
        assert!(thread.active_stream.is_none());
    }
}
