//! Demo HTTP surface (spec §6.2 ADD). Not a product surface: it exists so
//! this crate's §6.2 operations have an exercisable boundary for manual
//! testing and integration tests, the way the teacher's entire `cthulu`
//! binary exists to expose its flow/agent operations over axum. No auth,
//! templating, or UI lives here.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::SupervisorError;
use crate::supervisor::block::{Block, Mode, UserInput};
use crate::supervisor::manager::{BlockManager, StreamItem};

impl IntoResponse for SupervisorError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            SupervisorError::SessionNotFound(_) | SupervisorError::BlockNotFound(_) => StatusCode::NOT_FOUND,
            SupervisorError::BlockImmutable(_) | SupervisorError::NotReady(_) => StatusCode::CONFLICT,
            SupervisorError::Conflict { .. } => StatusCode::CONFLICT,
            SupervisorError::Cancelled => StatusCode::GONE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn block_to_json(block: &Block) -> Value {
    serde_json::to_value(block).unwrap_or(Value::Null)
}

/// Builds the axum router over a shared [`BlockManager`], following the
/// teacher's `build_router(state)` shape in `api/routes.rs` — a `/health`
/// probe, a permissive CORS layer for local development, and a nested `/api`
/// tree.
pub fn build_router(manager: BlockManager) -> Router {
    let health_routes = Router::new().route(
        "/",
        get(|| async { Json(json!({ "status": "ok" })) }),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(vec![header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .nest("/health", health_routes)
        .nest("/api/v1", api_router())
        .fallback(not_found)
        .with_state(Arc::new(manager))
        .layer(cors)
}

fn api_router() -> Router<Arc<BlockManager>> {
    Router::new()
        .route("/conversations/{conversation_id}/resolve", get(resolve))
        .route(
            "/conversations/{conversation_id}/blocks",
            get(list_blocks).post(create_block),
        )
        .route(
            "/conversations/{conversation_id}/blocks/{block_id}/send",
            post(send_and_stream),
        )
        .route("/blocks/{block_id}", get(get_block))
        .route("/blocks/{block_id}/input", post(append_user_input))
        .route("/blocks/{block_id}/fork", post(fork_block))
        .route("/blocks/{block_id}/archive", post(archive_block))
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!(path = %req.uri(), "unhandled path");
    (StatusCode::NOT_FOUND, "not found")
}

async fn resolve(State(manager): State<Arc<BlockManager>>, Path(conversation_id): Path<String>) -> Json<Value> {
    let session_id = manager.resolve(&conversation_id);
    Json(json!({ "conversation_id": conversation_id, "session_id": session_id.to_string() }))
}

#[derive(Deserialize)]
struct ListBlocksQuery {
    #[serde(default)]
    include_archived: bool,
}

async fn list_blocks(
    State(manager): State<Arc<BlockManager>>,
    Path(conversation_id): Path<String>,
    axum::extract::Query(query): axum::extract::Query<ListBlocksQuery>,
) -> Result<Json<Value>, SupervisorError> {
    let blocks = manager.list_blocks(conversation_id, query.include_archived).await?;
    Ok(Json(json!({ "blocks": blocks.iter().map(block_to_json).collect::<Vec<_>>() })))
}

#[derive(Deserialize)]
struct CreateBlockRequest {
    mode: Mode,
    #[serde(default)]
    inputs: Vec<String>,
}

async fn create_block(
    State(manager): State<Arc<BlockManager>>,
    Path(conversation_id): Path<String>,
    Json(body): Json<CreateBlockRequest>,
) -> Result<Json<Value>, SupervisorError> {
    let now = chrono::Utc::now().timestamp_millis();
    let inputs = body
        .inputs
        .into_iter()
        .map(|content| UserInput::new(content, now))
        .collect();
    let block = manager.create_block(conversation_id, body.mode, inputs).await?;
    Ok(Json(block_to_json(&block)))
}

async fn get_block(
    State(manager): State<Arc<BlockManager>>,
    Path(block_id): Path<Uuid>,
) -> Result<Json<Value>, SupervisorError> {
    let block = manager.get_block(block_id).await?;
    Ok(Json(block_to_json(&block)))
}

#[derive(Deserialize)]
struct AppendInputRequest {
    content: String,
}

async fn append_user_input(
    State(manager): State<Arc<BlockManager>>,
    Path(block_id): Path<Uuid>,
    Json(body): Json<AppendInputRequest>,
) -> Result<Json<Value>, SupervisorError> {
    manager.append_user_input(block_id, body.content).await?;
    Ok(Json(json!({ "status": "appended" })))
}

#[derive(Deserialize)]
struct ForkRequest {
    #[serde(default)]
    inputs: Vec<String>,
}

async fn fork_block(
    State(manager): State<Arc<BlockManager>>,
    Path(block_id): Path<Uuid>,
    Json(body): Json<ForkRequest>,
) -> Result<Json<Value>, SupervisorError> {
    let now = chrono::Utc::now().timestamp_millis();
    let inputs = body
        .inputs
        .into_iter()
        .map(|content| UserInput::new(content, now))
        .collect();
    let block = manager.fork_block(block_id, inputs).await?;
    Ok(Json(block_to_json(&block)))
}

async fn archive_block(
    State(manager): State<Arc<BlockManager>>,
    Path(block_id): Path<Uuid>,
) -> Result<Json<Value>, SupervisorError> {
    manager.archive_block(block_id).await?;
    Ok(Json(json!({ "status": "archived" })))
}

#[derive(Deserialize)]
struct SendRequest {
    mode: Mode,
    input: String,
}

/// POST .../send — streams classified events as SSE, grounded on the
/// teacher's `Sse::new(stream).keep_alive(...)` pattern in
/// `api/agents/chat.rs`. Both `conversation_id` and `block_id` come from the
/// path (the route declares both captures, so they must be extracted
/// together — a lone `Path<String>` would reject the request at call time).
async fn send_and_stream(
    State(manager): State<Arc<BlockManager>>,
    Path((conversation_id, block_id)): Path<(String, Uuid)>,
    Json(body): Json<SendRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, SupervisorError> {
    let mut rx = manager
        .send_and_stream(conversation_id, block_id, body.mode, body.input)
        .await?;

    let stream = async_stream::stream! {
        while let Some(item) = rx.recv().await {
            match item {
                StreamItem::Event(ev) => {
                    let payload = serde_json::to_string(&ev).unwrap_or_default();
                    yield Ok(Event::default().event("event").data(payload));
                }
                StreamItem::Completed { assistant_content, stats } => {
                    let payload = json!({ "assistant_content": assistant_content, "stats": stats });
                    yield Ok(Event::default().event("completed").data(payload.to_string()));
                }
                StreamItem::Errored { message } => {
                    yield Ok(Event::default().event("error").data(message));
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15))))
}
