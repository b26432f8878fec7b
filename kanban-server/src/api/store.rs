/// Plain HTTP access to the tree. Writes made here have no connection and
/// carry no deferred writes; they notify subscribers like any other write.
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use kanban_core::remote::{RemoteError, StorePath, WriteOp};
use serde_json::{Map, Value};

use super::{api_error, ApiError};
use crate::state::AppState;

fn parse_path(raw: &str, target: &'static str) -> Result<StorePath, ApiError> {
    StorePath::parse(raw).map_err(|e| api_error(StatusCode::BAD_REQUEST, target, e.to_string()))
}

fn store_error(e: RemoteError, target: &'static str, path: &StorePath) -> ApiError {
    let status = match e {
        RemoteError::InvalidPath { .. } | RemoteError::Serialization(_) => StatusCode::BAD_REQUEST,
        RemoteError::Rejected(_) => StatusCode::CONFLICT,
        RemoteError::Unavailable(_) | RemoteError::Disconnected => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, target, format!("{} at '{}': {}", target, path, e))
}

fn read(state: &AppState, path: &StorePath) -> Result<Json<Value>, ApiError> {
    let value = state
        .store
        .read(path)
        .map_err(|e| store_error(e, "kanban.api.get", path))?;
    Ok(Json(value.unwrap_or(Value::Null)))
}

fn write(
    state: &AppState,
    path: &StorePath,
    op: WriteOp,
    target: &'static str,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .write(path, op)
        .map_err(|e| store_error(e, target, path))?;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn get_root(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    read(&state, &StorePath::root())
}

pub async fn set_root(
    State(state): State<AppState>,
    Json(value): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    log::info!("[api.store] Replacing the whole tree");
    write(&state, &StorePath::root(), WriteOp::Set { value }, "kanban.api.set")
}

pub async fn get_value(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let path = parse_path(&raw, "kanban.api.get")?;
    read(&state, &path)
}

pub async fn set_value(
    State(state): State<AppState>,
    Path(raw): Path<String>,
    Json(value): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let path = parse_path(&raw, "kanban.api.set")?;
    write(&state, &path, WriteOp::Set { value }, "kanban.api.set")
}

pub async fn update_value(
    State(state): State<AppState>,
    Path(raw): Path<String>,
    Json(fields): Json<Map<String, Value>>,
) -> Result<Json<Value>, ApiError> {
    let path = parse_path(&raw, "kanban.api.update")?;
    write(&state, &path, WriteOp::Update { fields }, "kanban.api.update")
}

pub async fn remove_value(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let path = parse_path(&raw, "kanban.api.remove")?;
    write(&state, &path, WriteOp::Remove, "kanban.api.remove")
}
