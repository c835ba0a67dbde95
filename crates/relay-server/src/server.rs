use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use relay_core::ProgressEvent;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::viewers::ViewerRegistry;

/// SSE event name every progress event is sent under.
pub const PROGRESS_EVENT: &str = "progress";

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ViewerRegistry>,
}

/// Build the Axum router with all hub routes. Ingest bodies larger than
/// `ingest_body_limit` are rejected with 413 before reaching the handler.
pub fn build_router(state: AppState, ingest_body_limit: usize) -> Router {
    Router::new()
        .route("/events", get(events_handler))
        .route(
            "/ingest",
            post(ingest_handler).layer(DefaultBodyLimit::max(ingest_body_limit)),
        )
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serialize and push an event to every viewer. Returns viewers reached.
pub(crate) fn publish(registry: &ViewerRegistry, event: &ProgressEvent) -> usize {
    match serde_json::to_string(event) {
        Ok(json) => registry.broadcast(&json),
        Err(e) => {
            tracing::debug!(error = %e, "unserializable progress event dropped");
            0
        }
    }
}

async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (viewer_id, rx) = state.registry.register();
    tracing::info!(viewer_id = %viewer_id, "viewer connected");

    let stream = ReceiverStream::new(rx)
        .map(|json| Ok::<_, Infallible>(Event::default().event(PROGRESS_EVENT).data(&*json)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn ingest_handler(State(state): State<AppState>, body: Bytes) -> StatusCode {
    let event: ProgressEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!(error = %e, "rejected ingest payload");
            return StatusCode::BAD_REQUEST;
        }
    };
    publish(&state.registry, &event);
    StatusCode::ACCEPTED
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "role": "hub",
        "viewers": state.registry.count(),
        "pid": std::process::id(),
    }))
}
