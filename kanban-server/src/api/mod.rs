use axum::{http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

mod events;
mod store;

use crate::state::AppState;

/// Axum REST API routes.
///
///   GET    /db                -> whole tree
///   PUT    /db                -> replace the whole tree
///   GET    /db/{*path}        -> value at path (null when absent)
///   PUT    /db/{*path}        -> set value at path
///   PATCH  /db/{*path}        -> multi-path update relative to path
///   DELETE /db/{*path}        -> remove value at path
///   GET    /events            -> SSE stream of store events
///   GET    /status            -> health check (+ connection counts)
///   GET    /logs              -> recent log entries
///   GET    /logs/stream       -> SSE stream of log entries
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/db", get(store::get_root).put(store::set_root))
        .route(
            "/db/{*path}",
            get(store::get_value)
                .put(store::set_value)
                .patch(store::update_value)
                .delete(store::remove_value),
        )
        .route("/events", get(events::sse_events))
        .route("/status", get(events::status))
        .route("/logs", get(events::list_logs))
        .route("/logs/stream", get(events::stream_logs))
}

// ── Shared types and helpers used across sub-modules ────────────────────

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub(crate) type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, target: &'static str, error: String) -> ApiError {
    log_api_issue(status, target, &error);
    (status, Json(ErrorResponse { error }))
}

fn log_api_issue(status: StatusCode, target: &'static str, message: impl AsRef<str>) {
    let message = message.as_ref();
    if status.is_server_error() {
        log::error!(target: target, "{}", message);
    } else {
        log::warn!(target: target, "{}", message);
    }
}
