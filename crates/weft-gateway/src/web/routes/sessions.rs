//! Session listing, history, and per-session artifacts.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::web::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions", get(list_active))
        .route("/sessions/history", get(list_history))
        .route("/sessions/history/{id}/transcript", get(get_transcript))
        .route("/sessions/history/{id}/rename", put(rename_session))
        .route("/sessions/history/{id}", delete(delete_session))
        .route("/sessions/{id}/artifacts", get(list_artifacts))
}

async fn list_active(State(state): State<AppState>) -> Json<Value> {
    let sessions: Vec<Value> = state
        .manager
        .list_active()
        .into_iter()
        .map(|m| {
            json!({
                "session_id": m.session_id,
                "bundle": m.bundle,
                "status": m.status,
                "turn_count": m.turn_count,
            })
        })
        .collect();
    Json(Value::Array(sessions))
}

async fn list_history(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.manager.list_saved()).unwrap_or_default())
}

async fn get_transcript(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Value> {
    let transcript = state.manager.load_transcript(&id);
    Json(json!({ "session_id": id, "transcript": transcript }))
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    name: String,
}

async fn rename_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.manager.rename_saved(&id, &request.name) {
        Ok(true) => Ok(Json(json!({ "success": true, "session_id": id }))),
        Ok(false) => Err(not_found()),
        Err(e) => Err(gateway_error(e)),
    }
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.manager.delete_saved(&id) {
        Ok(true) => Ok(Json(json!({ "success": true, "session_id": id }))),
        Ok(false) => Err(not_found()),
        Err(e) => Err(gateway_error(e)),
    }
}

async fn list_artifacts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Value> {
    Json(serde_json::to_value(state.artifacts.list(&id)).unwrap_or_default())
}

fn not_found() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Session not found" })),
    )
}

fn gateway_error(e: GatewayError) -> (StatusCode, Json<Value>) {
    (
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(json!({ "error": e.to_string() })),
    )
}
