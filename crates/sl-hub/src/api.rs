//! # API Handlers
//!
//! Axum routes over a shared [`Coordinator`]:
//!
//! | Route                          | Purpose                               |
//! |--------------------------------|---------------------------------------|
//! | `POST /api/search`             | run a query, answer with the result   |
//! | `GET /api/search/ws`           | run a query, stream progress frames   |
//! | `GET /api/queries`             | list registered executions            |
//! | `POST /api/queries/:qid/cancel`| cancel one execution                  |
//! | `POST /api/queries/restart`    | restart every registered execution    |

use crate::delivery::{cancel_frame, complete_frame, error_frame, FrameSink};
use crate::driver::{Coordinator, RunRequest};
use crate::error::CoordinatorError;
use crate::query::{QueryContext, QuerySpec};
use crate::registry::ActiveQuery;
use crate::ws::SignalReader;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{SplitStream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use sl_core::QueryId;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Body of `POST /api/search`, and of the first websocket frame (which
/// additionally carries `"state": "query"`).
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub primary: QuerySpec,
    #[serde(default)]
    pub companion: Option<QuerySpec>,
    pub context: QueryContext,
}

impl SearchRequest {
    pub fn into_run(self, qid: QueryId) -> RunRequest {
        RunRequest {
            qid,
            primary: self.primary,
            companion: self.companion,
            context: self.context,
        }
    }
}

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/api/search", post(search))
        .route("/api/search/ws", get(search_ws))
        .route("/api/queries", get(list_queries))
        .route("/api/queries/restart", post(restart_queries))
        .route("/api/queries/:qid/cancel", post(cancel_query))
        .layer(CorsLayer::permissive())
        .with_state(coordinator)
}

fn error_status(e: CoordinatorError) -> (StatusCode, String) {
    let status = match &e {
        CoordinatorError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        CoordinatorError::InvalidTimeRange(_) | CoordinatorError::DuplicateQuery(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

// =============================================================================
// Search
// =============================================================================

pub async fn search(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let qid = coordinator.registry().next_qid();
    let outcome = coordinator
        .run_sync(request.into_run(qid))
        .await
        .map_err(error_status)?;
    match outcome.response {
        Some(response) => Ok(Json(complete_frame(qid, &response))),
        None => Ok(Json(cancel_frame(qid))),
    }
}

pub async fn search_ws(
    ws: WebSocketUpgrade,
    State(coordinator): State<Arc<Coordinator>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_search_socket(socket, coordinator))
}

async fn handle_search_socket(socket: WebSocket, coordinator: Arc<Coordinator>) {
    let (mut sink, mut stream) = socket.split();
    let request = match read_query_frame(&mut stream).await {
        Ok(request) => request,
        Err(message) => {
            tracing::warn!("Rejecting websocket search: {}", message);
            let _ = sink.send_frame(error_frame(&message)).await;
            return;
        }
    };

    let qid = coordinator.registry().next_qid();
    let signals = SignalReader::from_websocket(stream);
    if let Err(e) = coordinator
        .run_streaming(request.into_run(qid), sink, Some(signals))
        .await
    {
        tracing::warn!("qid={}, websocket search failed to start: {}", qid, e);
    }
}

async fn read_query_frame(stream: &mut SplitStream<WebSocket>) -> Result<SearchRequest, String> {
    match stream.next().await {
        Some(Ok(Message::Text(text))) => parse_query_frame(&text),
        Some(Ok(_)) => Err("expected a JSON text frame".to_string()),
        Some(Err(e)) => Err(e.to_string()),
        None => Err("connection closed before a query was sent".to_string()),
    }
}

/// The opening websocket frame must be a search request tagged
/// `"state": "query"`.
pub fn parse_query_frame(text: &str) -> Result<SearchRequest, String> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| format!("invalid query frame: {}", e))?;
    match value.get("state").and_then(Value::as_str) {
        Some("query") => {}
        other => return Err(format!("first frame must have state \"query\", got {:?}", other)),
    }
    serde_json::from_value(value).map_err(|e| format!("invalid query frame: {}", e))
}

// =============================================================================
// Query management
// =============================================================================

pub async fn list_queries(State(coordinator): State<Arc<Coordinator>>) -> Json<Vec<ActiveQuery>> {
    Json(coordinator.registry().active().await)
}

pub async fn cancel_query(
    State(coordinator): State<Arc<Coordinator>>,
    Path(qid): Path<u64>,
) -> Result<StatusCode, (StatusCode, String)> {
    if coordinator.registry().cancel(QueryId(qid)).await {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err((
            StatusCode::NOT_FOUND,
            format!("qid={} is not running", qid),
        ))
    }
}

pub async fn restart_queries(State(coordinator): State<Arc<Coordinator>>) -> Json<Value> {
    let restarted = coordinator.registry().restart_all().await;
    Json(json!({ "restarted": restarted }))
}
