//! Behavior listing and custom registration. Mirrors the bundle routes;
//! behaviors are bundles composed on top of the base bundle.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::Value;

use super::bundles::{CustomRequest, ValidateRequest};
use crate::preferences::RegistryKind;
use crate::web::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/behaviors", get(list_behaviors))
        .route("/behaviors/validate", post(validate_behavior))
        .route("/behaviors/custom", post(add_custom_behavior))
        .route("/behaviors/custom/{name}", delete(remove_custom_behavior))
}

async fn list_behaviors(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.bundles.list(RegistryKind::Behavior)).unwrap_or_default())
}

async fn validate_behavior(
    State(state): State<AppState>,
    Json(request): Json<ValidateRequest>,
) -> Json<Value> {
    let result = state.bundles.validate_uri(&request.uri).await;
    Json(serde_json::to_value(result).unwrap_or_default())
}

async fn add_custom_behavior(
    State(state): State<AppState>,
    Json(request): Json<CustomRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let result = state
        .bundles
        .register_custom(
            RegistryKind::Behavior,
            &request.uri,
            request.name.as_deref(),
            request.description.as_deref(),
        )
        .await;
    if result.success {
        Ok(Json(serde_json::to_value(result).unwrap_or_default()))
    } else {
        Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::to_value(result).unwrap_or_default()),
        ))
    }
}

async fn remove_custom_behavior(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let result = state
        .bundles
        .unregister_custom(RegistryKind::Behavior, &name);
    if result.success {
        Ok(Json(serde_json::to_value(result).unwrap_or_default()))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::to_value(result).unwrap_or_default()),
        ))
    }
}
