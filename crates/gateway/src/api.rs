//! Thread API endpoints — thin wrappers over the engine.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use strand_domain::Error;
use strand_engine::{CreateThread, MessageInit};

use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/threads", post(create_thread).get(list_threads))
        .route("/v1/threads/:id", get(get_thread).delete(delete_thread))
        .route("/v1/threads/:id/messages", post(send_message).get(list_messages))
        .route("/v1/threads/:id/append", post(append_message))
        .route("/v1/threads/:id/resume", post(resume_thread))
        .route("/v1/threads/:id/stop", post(stop_thread))
        .route("/v1/threads/:id/updates", get(stream_updates))
        .route("/v1/threads/:id/tool-results", post(add_tool_result))
        .route("/v1/threads/:id/tool-errors", post(add_tool_error))
        .with_state(state)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::NotResumable(_)
            | Error::RetryPending(_)
            | Error::DuplicateToolCall { .. }
            | Error::LockedByOther { .. }
            | Error::ThreadActiveMismatch { .. }
            | Error::InvalidState(_) => StatusCode::CONFLICT,
            Error::InvalidToolParameters { .. } | Error::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn create_thread(
    State(state): State<AppState>,
    Json(body): Json<CreateThread>,
) -> ApiResult<impl IntoResponse> {
    let thread_id = state.engine.create_thread(body)?;
    Ok((StatusCode::CREATED, Json(json!({ "thread_id": thread_id }))))
}

#[derive(Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

async fn list_threads(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    Json(json!({ "threads": state.engine.list_threads(query.limit) }))
}

async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let thread = state.engine.get_thread(thread_id).ok_or(Error::NotFound {
        kind: "thread",
        id: thread_id.to_string(),
    })?;
    Ok(Json(json!({ "thread": thread })))
}

async fn delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.engine.delete_thread(thread_id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct SendMessageBody {
    prompt: String,
}

async fn send_message(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Json(body): Json<SendMessageBody>,
) -> ApiResult<impl IntoResponse> {
    state.engine.send_message(thread_id, body.prompt)?;
    Ok(StatusCode::ACCEPTED)
}

async fn append_message(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Json(body): Json<MessageInit>,
) -> ApiResult<impl IntoResponse> {
    let msg_id = state.engine.add_message(thread_id, body)?;
    Ok(Json(json!({ "msg_id": msg_id })))
}

#[derive(Deserialize, Default)]
struct ResumeBody {
    prompt: Option<String>,
}

async fn resume_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    body: Option<Json<ResumeBody>>,
) -> ApiResult<impl IntoResponse> {
    let prompt = body.and_then(|Json(b)| b.prompt);
    state.engine.resume_thread(thread_id, prompt)?;
    Ok(StatusCode::ACCEPTED)
}

async fn stop_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.engine.stop_thread(thread_id)?;
    Ok(StatusCode::ACCEPTED)
}

async fn list_messages(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
) -> impl IntoResponse {
    Json(json!({ "messages": state.engine.list_messages(thread_id) }))
}

#[derive(Deserialize)]
struct UpdatesQuery {
    from_seq: Option<u64>,
}

async fn stream_updates(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Query(query): Query<UpdatesQuery>,
) -> impl IntoResponse {
    Json(state.engine.stream_updates(thread_id, query.from_seq))
}

#[derive(Deserialize)]
struct ToolResultBody {
    tool_call_id: String,
    result: Value,
}

async fn add_tool_result(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Json(body): Json<ToolResultBody>,
) -> ApiResult<impl IntoResponse> {
    state
        .engine
        .add_tool_result(thread_id, &body.tool_call_id, body.result)?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
struct ToolErrorBody {
    tool_call_id: String,
    error: String,
}

async fn add_tool_error(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Json(body): Json<ToolErrorBody>,
) -> ApiResult<impl IntoResponse> {
    state
        .engine
        .add_tool_error(thread_id, &body.tool_call_id, body.error)?;
    Ok(StatusCode::ACCEPTED)
}
