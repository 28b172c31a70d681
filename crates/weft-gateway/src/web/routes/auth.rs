//! Health and authentication endpoints.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use weft_shared::PROTOCOL_VERSION;

use crate::web::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/auth/verify", get(verify))
        .route("/auth/local-token", get(local_token))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol_version": PROTOCOL_VERSION,
    }))
}

async fn verify() -> Json<Value> {
    // The bearer middleware already rejected anything unauthenticated.
    Json(json!({ "authenticated": true }))
}

/// Hand the token to loopback callers so a local browser can bootstrap
/// without copy-pasting from the terminal.
async fn local_token(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if !addr.ip().is_loopback() {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "local-token is only served on loopback" })),
        ));
    }
    Ok(Json(json!({ "token": state.token.as_str() })))
}
