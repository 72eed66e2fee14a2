//! End-to-end turn scenarios against a scripted provider.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use strand_domain::{
    AbortReason, ErrorKind, Part, Role, StreamState, ThreadStatus, ToolCallStatus, ToolDefinition,
    ToolError,
};
use strand_engine::hooks::EngineHooks;
use strand_engine::provider::{ModelProvider, PartStream, ProviderError, TurnRequest};
use strand_engine::tools::{
    AsyncToolCallback, AsyncToolNotification, ToolHandler, ToolOptions, ToolRegistry,
};
use strand_engine::{CreateThread, Engine, EngineBuilder, RetryNotice, TurnFailure};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum Turn {
    Parts(Vec<Part>),
    /// Emits the given parts, then hangs until the task is dropped.
    Hang(Vec<Part>),
    Error(ProviderError),
}

struct ScriptedProvider {
    turns: Mutex<VecDeque<Turn>>,
}

impl ScriptedProvider {
    fn new(turns: Vec<Turn>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
        })
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn stream_turn(&self, _request: TurnRequest) -> Result<PartStream, ProviderError> {
        match self.turns.lock().pop_front() {
            Some(Turn::Parts(parts)) => {
                let stream: PartStream =
                    Box::pin(futures_util::stream::iter(parts.into_iter().map(Ok)));
                Ok(stream)
            }
            Some(Turn::Hang(parts)) => {
                let stream: PartStream = Box::pin(async_stream::stream! {
                    for part in parts {
                        yield Ok(part);
                    }
                    std::future::pending::<()>().await;
                });
                Ok(stream)
            }
            Some(Turn::Error(error)) => Err(error),
            None => Err(ProviderError::msg("script exhausted")),
        }
    }
}

fn start(message_id: &str) -> Part {
    Part::Start {
        message_id: message_id.into(),
    }
}

fn text(id: &str, delta: &str) -> Part {
    Part::TextDelta {
        id: id.into(),
        delta: delta.into(),
        provider_metadata: None,
    }
}

fn finish(reason: &str) -> Part {
    Part::Finish {
        finish_reason: Some(reason.into()),
    }
}

fn tool_input(call_id: &str, name: &str, input: Value) -> Part {
    Part::ToolInputAvailable {
        tool_call_id: call_id.into(),
        tool_name: name.into(),
        input,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn build_engine(turns: Vec<Turn>, tools: Arc<ToolRegistry>, hooks: EngineHooks) -> Arc<Engine> {
    let engine = EngineBuilder::new(ScriptedProvider::new(turns))
        .tools(tools)
        .hooks(hooks)
        .build();
    engine.start();
    engine
}

async fn wait_for_status(engine: &Arc<Engine>, thread_id: Uuid, status: ThreadStatus) {
    wait_until(|| {
        engine
            .get_thread(thread_id)
            .map(|t| t.status == status)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(engine.get_thread(thread_id).unwrap().status, status);
}

async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

fn message_text(parts: &[Part]) -> String {
    parts
        .iter()
        .filter_map(|p| match p {
            Part::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_without_tools() {
    let engine = build_engine(
        vec![Turn::Parts(vec![
            start("m1"),
            text("t", "he"),
            text("t", "llo"),
            finish("stop"),
        ])],
        Arc::new(ToolRegistry::new()),
        EngineHooks::default(),
    );

    let thread_id = engine.create_thread(CreateThread::default()).unwrap();
    engine.send_message(thread_id, "hi").unwrap();
    wait_for_status(&engine, thread_id, ThreadStatus::Completed).await;

    // Transcript: user "hi", assistant "hello" committed under stream 1.
    let messages = engine.list_messages(thread_id);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(message_text(&messages[0].parts), "hi");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].id, "m1");
    assert_eq!(message_text(&messages[1].parts), "hello");
    assert_eq!(messages[1].committed_seq, Some(1));

    // One stream, finished (never aborted).
    let streams = engine.list_streams(thread_id);
    assert_eq!(streams.len(), 1);
    assert!(matches!(streams[0].state, StreamState::Finished { .. }));

    // One compacted delta: the two text chunks joined.
    let updates = engine.stream_updates(thread_id, None);
    assert_eq!(updates.messages.len(), 1);
    assert_eq!(updates.messages[0].msg_id, "m1");
    let joined: Vec<&Part> = updates.messages[0].parts.iter().map(|p| &p.part).collect();
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0], &text("t", "hello"));

    let thread = engine.get_thread(thread_id).unwrap();
    assert!(thread.active_stream.is_none());
    assert!(thread.retry_state.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_sync_tool_turn() {
    struct Weather;
    #[async_trait]
    impl ToolHandler for Weather {
        async fn call(&self, args: Value) -> Result<Value, ToolError> {
            assert_eq!(args["location"], "SF");
            Ok(json!({ "weather": "sunny" }))
        }
    }

    let tools = Arc::new(ToolRegistry::new());
    tools
        .register_sync(
            ToolDefinition {
                name: "get_weather".into(),
                description: "weather lookup".into(),
                parameters: json!({"type": "object", "properties": {"location": {"type": "string"}}}),
            },
            Arc::new(Weather),
            ToolOptions::default(),
        )
        .unwrap();

    let engine = build_engine(
        vec![
            Turn::Parts(vec![
                start("m1"),
                tool_input("call-1", "get_weather", json!({"location": "SF"})),
                finish("tool-calls"),
            ]),
            Turn::Parts(vec![start("m2"), text("t", "sunny"), finish("stop")]),
        ],
        tools,
        EngineHooks::default(),
    );

    let thread_id = engine.create_thread(CreateThread::default()).unwrap();
    engine.send_message(thread_id, "weather in SF?").unwrap();
    wait_for_status(&engine, thread_id, ThreadStatus::Completed).await;

    // Both streams ran to completion.
    let streams = engine.list_streams(thread_id);
    assert_eq!(streams.len(), 2);
    assert!(streams
        .iter()
        .all(|s| matches!(s.state, StreamState::Finished { .. })));

    // The tool call completed exactly once.
    let calls = engine.list_tool_calls(thread_id);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].status, ToolCallStatus::Completed);
    assert_eq!(calls[0].result.as_ref().unwrap()["weather"], "sunny");

    // The tool outcome was merged into the requesting assistant message.
    let messages = engine.list_messages(thread_id);
    let m1 = messages.iter().find(|m| m.id == "m1").unwrap();
    assert!(m1.parts.iter().any(|p| matches!(
        p,
        Part::ToolOutputAvailable { tool_call_id, .. } if tool_call_id == "call-1"
    )));
    let m2 = messages.iter().find(|m| m.id == "m2").unwrap();
    assert_eq!(message_text(&m2.parts), "sunny");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_tool_result_roundtrip() {
    struct Notifications(Mutex<Vec<AsyncToolNotification>>);
    struct Callback(Arc<Notifications>);
    #[async_trait]
    impl AsyncToolCallback for Callback {
        async fn notify(&self, notification: AsyncToolNotification) -> Result<(), ToolError> {
            self.0 .0.lock().push(notification);
            Ok(())
        }
    }

    let notifications = Arc::new(Notifications(Mutex::new(Vec::new())));
    let tools = Arc::new(ToolRegistry::new());
    tools
        .register_async(
            ToolDefinition {
                name: "get_temp".into(),
                description: "slow temperature probe".into(),
                parameters: json!({"type": "object"}),
            },
            Arc::new(Callback(notifications.clone())),
            ToolOptions::default(),
        )
        .unwrap();

    let engine = build_engine(
        vec![
            Turn::Parts(vec![
                start("m1"),
                tool_input("call-2", "get_temp", json!({})),
                finish("tool-calls"),
            ]),
            Turn::Parts(vec![start("m2"), text("t", "72"), finish("stop")]),
        ],
        tools,
        EngineHooks::default(),
    );

    let thread_id = engine.create_thread(CreateThread::default()).unwrap();
    engine.send_message(thread_id, "temperature?").unwrap();

    // The turn parks awaiting the external result.
    wait_for_status(&engine, thread_id, ThreadStatus::AwaitingToolResults).await;
    wait_until(|| !notifications.0.lock().is_empty()).await;
    {
        let seen = notifications.0.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].tool_call_id, "call-2");
        assert_eq!(seen[0].tool_name, "get_temp");
    }

    // External completion drives stream 2.
    engine
        .add_tool_result(thread_id, "call-2", json!({"temp": 72}))
        .unwrap();
    wait_for_status(&engine, thread_id, ThreadStatus::Completed).await;

    // A duplicate delivery is a no-op.
    engine
        .add_tool_result(thread_id, "call-2", json!({"temp": 0}))
        .unwrap();
    let calls = engine.list_tool_calls(thread_id);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].status, ToolCallStatus::Completed);
    assert_eq!(calls[0].result.as_ref().unwrap()["temp"], 72);

    assert_eq!(engine.list_streams(thread_id).len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_5xx_retries_then_succeeds() {
    struct Seen {
        retries: Mutex<Vec<RetryNotice>>,
    }
    let seen = Arc::new(Seen {
        retries: Mutex::new(Vec::new()),
    });
    let seen_hook = seen.clone();

    let hooks = EngineHooks {
        on_retry: Some(Arc::new(move |_, notice: &RetryNotice| {
            seen_hook.retries.lock().push(notice.clone());
        })),
        ..Default::default()
    };

    let engine = build_engine(
        vec![
            Turn::Error(ProviderError::with_details(
                "upstream",
                json!({"statusCode": 503, "message": "upstream"}),
            )),
            Turn::Parts(vec![start("m1"), text("t", "ok"), finish("stop")]),
        ],
        Arc::new(ToolRegistry::new()),
        hooks,
    );

    let thread_id = engine.create_thread(CreateThread::default()).unwrap();
    engine.send_message(thread_id, "hi").unwrap();
    wait_for_status(&engine, thread_id, ThreadStatus::Completed).await;

    let retries = seen.retries.lock();
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].attempt, 1);
    assert_eq!(retries[0].max_attempts, 3);
    assert!(retries[0].delay_ms <= 500, "got {}", retries[0].delay_ms);
    assert_eq!(retries[0].kind, Some(ErrorKind::Provider5xx));

    let thread = engine.get_thread(thread_id).unwrap();
    assert!(thread.retry_state.is_none(), "cleared on success");
    // Two streams: the aborted first attempt and the successful retry.
    let streams = engine.list_streams(thread_id);
    assert_eq!(streams.len(), 2);
    assert!(matches!(
        streams[0].state,
        StreamState::Aborted {
            reason: AbortReason::Error { .. },
            ..
        }
    ));
    assert!(matches!(streams[1].state, StreamState::Finished { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn context_window_exceeded_fails_without_retry() {
    struct Seen {
        errors: Mutex<Vec<TurnFailure>>,
        retries: Mutex<usize>,
    }
    let seen = Arc::new(Seen {
        errors: Mutex::new(Vec::new()),
        retries: Mutex::new(0),
    });
    let errors_hook = seen.clone();
    let retries_hook = seen.clone();

    let hooks = EngineHooks {
        on_error: Some(Arc::new(move |_, failure: &TurnFailure| {
            errors_hook.errors.lock().push(failure.clone());
        })),
        on_retry: Some(Arc::new(move |_, _| {
            *retries_hook.retries.lock() += 1;
        })),
        ..Default::default()
    };

    let engine = build_engine(
        vec![Turn::Error(ProviderError::with_details(
            "prompt is too long",
            json!({"status": 400, "message": "prompt is too long"}),
        ))],
        Arc::new(ToolRegistry::new()),
        hooks,
    );

    let thread_id = engine.create_thread(CreateThread::default()).unwrap();
    engine.send_message(thread_id, "enormous prompt").unwrap();
    wait_for_status(&engine, thread_id, ThreadStatus::Failed).await;

    assert_eq!(*seen.retries.lock(), 0);
    let errors = seen.errors.lock();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ErrorKind::ContextWindowExceeded);
    assert!(errors[0].requires_explicit_handling);
    assert!(!errors[0].retryable);
    assert_eq!(errors[0].attempt, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_during_turn_settles_to_stopped() {
    let engine = build_engine(
        vec![Turn::Hang(vec![start("m1"), text("t", "thinking")])],
        Arc::new(ToolRegistry::new()),
        EngineHooks::default(),
    );

    let thread_id = engine.create_thread(CreateThread::default()).unwrap();
    engine.send_message(thread_id, "hi").unwrap();
    wait_for_status(&engine, thread_id, ThreadStatus::Streaming).await;
    let stream_id = {
        // Wait for the handler to actually take the stream.
        wait_until(|| {
            engine
                .list_streams(thread_id)
                .first()
                .map(|s| matches!(s.state, StreamState::Streaming { .. }))
                .unwrap_or(false)
        })
        .await;
        engine.list_streams(thread_id)[0].id
    };

    engine.stop_thread(thread_id).unwrap();
    wait_for_status(&engine, thread_id, ThreadStatus::Stopped).await;

    let thread = engine.get_thread(thread_id).unwrap();
    assert!(thread.active_stream.is_none());
    assert!(thread.retry_state.is_none());

    let streams = engine.list_streams(thread_id);
    assert_eq!(streams.len(), 1, "no further stream was scheduled");
    assert_eq!(streams[0].id, stream_id);
    assert!(matches!(
        &streams[0].state,
        StreamState::Aborted {
            reason: AbortReason::StopSignal,
            ..
        }
    ));

    // The thread stays stopped; a later resume restarts it cleanly.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        engine.get_thread(thread_id).unwrap().status,
        ThreadStatus::Stopped
    );
}
