//! The Strand turn engine.
//!
//! Coordinated persistent state machines (thread, stream, tool call) plus
//! the concurrency protocol — lock acquisition, heartbeats, timeouts,
//! sequence-number fencing, retry scheduling — that guarantee at most one
//! active stream per thread, exactly-once tool-completion handling, and
//! resumption after arbitrary process failure.
//!
//! Entry points: [`EngineBuilder`] wires a provider, tool registry, hooks
//! and config into an [`Engine`]; [`Engine::start`] launches the job
//! dispatcher and the recovery sweep; the thread API lives in
//! [`threads`].

pub mod handler;
pub mod hooks;
pub mod provider;
pub mod recovery;
pub mod retry;
pub mod streamer;
pub mod streams;
pub mod threads;
pub mod tool_calls;
pub mod tools;
pub mod workpool;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use strand_domain::{now_ms, EngineConfig};
use strand_store::{Scheduler, Store};

use hooks::EngineHooks;
use provider::ModelProvider;
use tools::ToolRegistry;
use workpool::WorkPool;

pub use hooks::{RetryDecision, RetryDecisionInput, RetryNotice, TurnFailure};
pub use provider::{ModelMessage, PartStream, ProviderError, TurnRequest, UnconfiguredProvider};
pub use retry::Classification;
pub use streams::{StreamUpdates, StreamedPart, StreamingMessage};
pub use threads::{CreateThread, MessageInit};
pub use tools::{AsyncToolCallback, AsyncToolNotification, ToolHandler, ToolOptions, ToolTimeout};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Jobs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Schedulable engine actions. Scheduled work holds one of these; the
/// dispatcher routes fired jobs to the matching engine entry point.
#[derive(Debug, Clone)]
pub enum Job {
    ContinueStream { thread_id: Uuid },
    StreamHandler { thread_id: Uuid, stream_id: Uuid },
    TimeoutStream { stream_id: Uuid },
    DeleteStream { stream_id: Uuid },
    ExecuteToolCall { thread_id: Uuid, tool_call_id: String },
    NotifyAsyncTool { thread_id: Uuid, tool_call_id: String },
    FailPendingToolCall { thread_id: Uuid, tool_call_id: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sliding-window size for the finalizer-mismatch rate limiter.
const MISMATCH_WINDOW_MS: i64 = 5 * 60 * 1_000;
const MISMATCH_ESCALATION: usize = 3;

pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) store: Store,
    pub(crate) scheduler: Scheduler<Job>,
    pub(crate) provider: Arc<dyn ModelProvider>,
    pub(crate) tools: Arc<ToolRegistry>,
    pub(crate) hooks: EngineHooks,
    workpool: Option<Arc<dyn WorkPool>>,
    tool_workpool: Option<Arc<dyn WorkPool>>,
    /// Per-thread finalize-mismatch timestamps (in-process only; reset on
    /// restart — alerting is best-effort).
    finalize_mismatches: Mutex<HashMap<Uuid, Vec<i64>>>,
    /// Taken by `start`.
    job_rx: Mutex<Option<mpsc::UnboundedReceiver<(Uuid, Job)>>>,
    /// Back-reference for spawning owned tasks from `&self` methods.
    self_ref: Weak<Engine>,
}

pub struct EngineBuilder {
    config: EngineConfig,
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    hooks: EngineHooks,
    workpool: Option<Arc<dyn WorkPool>>,
    tool_workpool: Option<Arc<dyn WorkPool>>,
}

impl EngineBuilder {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            config: EngineConfig::default(),
            provider,
            tools: Arc::new(ToolRegistry::new()),
            hooks: EngineHooks::default(),
            workpool: None,
            tool_workpool: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn hooks(mut self, hooks: EngineHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Route stream-handler actions through a work pool.
    pub fn workpool(mut self, pool: Arc<dyn WorkPool>) -> Self {
        self.workpool = Some(pool);
        self
    }

    /// Route tool executions through a dedicated work pool (falls back to
    /// the general pool, then direct spawn).
    pub fn tool_workpool(mut self, pool: Arc<dyn WorkPool>) -> Self {
        self.tool_workpool = Some(pool);
        self
    }

    pub fn build(self) -> Arc<Engine> {
        let (scheduler, job_rx) = Scheduler::new();
        Arc::new_cyclic(|self_ref| Engine {
            config: self.config,
            store: Store::new(),
            scheduler,
            provider: self.provider,
            tools: self.tools,
            hooks: self.hooks,
            workpool: self.workpool,
            tool_workpool: self.tool_workpool,
            finalize_mismatches: Mutex::new(HashMap::new()),
            job_rx: Mutex::new(Some(job_rx)),
            self_ref: self_ref.clone(),
        })
    }
}

impl Engine {
    /// The owning handle behind this engine. Infallible while any caller
    /// holds the engine at all.
    pub(crate) fn strong(&self) -> Arc<Engine> {
        self.self_ref
            .upgrade()
            .expect("engine invoked after its last handle was dropped")
    }

    /// Launch the scheduled-job dispatcher and the periodic recovery
    /// sweep. Idempotent per engine: the second call is a no-op.
    pub fn start(&self) {
        let Some(mut rx) = self.job_rx.lock().take() else {
            return;
        };

        let engine = self.strong();
        tokio::spawn(async move {
            while let Some((_, job)) = rx.recv().await {
                engine.dispatch(job);
            }
        });

        let engine = self.strong();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(
                engine.config.recovery_interval_ms.max(1_000),
            ));
            // The first tick fires immediately; skip it so startup isn't a
            // recovery pass over an empty store.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                engine.recovery_tick();
            }
        });
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Route a job to its execution lane: stream handlers through the
    /// general pool, tool work through the tool pool, everything else as a
    /// direct task.
    pub(crate) fn dispatch(&self, job: Job) {
        match &job {
            Job::StreamHandler { .. } => {
                if let Some(pool) = &self.workpool {
                    pool.enqueue(self.strong(), job);
                    return;
                }
            }
            Job::ExecuteToolCall { .. } | Job::NotifyAsyncTool { .. } => {
                if let Some(pool) = self.tool_workpool.as_ref().or(self.workpool.as_ref()) {
                    pool.enqueue(self.strong(), job);
                    return;
                }
            }
            _ => {}
        }
        let engine = self.strong();
        tokio::spawn(async move {
            engine.run_job(job).await;
        });
    }

    /// Execute one job. Public so work pools can drive jobs themselves.
    pub async fn run_job(self: Arc<Self>, job: Job) {
        match job {
            Job::ContinueStream { thread_id } => {
                if let Err(error) = self.continue_stream(thread_id) {
                    tracing::warn!(%thread_id, %error, "continue_stream failed");
                }
            }
            Job::StreamHandler {
                thread_id,
                stream_id,
            } => {
                self.run_stream_handler(thread_id, stream_id).await;
            }
            Job::TimeoutStream { stream_id } => self.timeout_stream(stream_id),
            Job::DeleteStream { stream_id } => self.delete_stream_step(stream_id),
            Job::ExecuteToolCall {
                thread_id,
                tool_call_id,
            } => {
                self.execute_tool_call(thread_id, &tool_call_id).await;
            }
            Job::NotifyAsyncTool {
                thread_id,
                tool_call_id,
            } => {
                self.notify_async_tool(thread_id, &tool_call_id).await;
            }
            Job::FailPendingToolCall {
                thread_id,
                tool_call_id,
            } => self.fail_pending_tool_call(thread_id, &tool_call_id),
        }
    }

    // ── Hook plumbing ──────────────────────────────────────────────

    pub(crate) fn fire_status_change(&self, thread_id: Uuid, status: strand_domain::ThreadStatus) {
        if let Some(hook) = &self.hooks.on_status_change {
            hook(thread_id, status);
        }
    }

    /// Record a finalize guard mismatch; escalates to an error log at
    /// three or more within a five-minute window.
    pub(crate) fn note_finalize_mismatch(&self, thread_id: Uuid) {
        let now = now_ms();
        let count = {
            let mut map = self.finalize_mismatches.lock();
            let window = map.entry(thread_id).or_default();
            window.retain(|t| now - *t < MISMATCH_WINDOW_MS);
            window.push(now);
            window.len()
        };
        if count >= MISMATCH_ESCALATION {
            tracing::error!(
                %thread_id,
                count,
                "finalize_stream_turn guard mismatch repeating"
            );
        } else {
            tracing::warn!(%thread_id, count, "finalize_stream_turn guard mismatch");
        }
    }
}
