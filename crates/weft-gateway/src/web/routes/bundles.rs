//! Bundle listing, validation, and custom registration.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::preferences::RegistryKind;
use crate::web::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/bundles", get(list_bundles))
        .route("/bundles/validate", post(validate_bundle))
        .route("/bundles/custom", post(add_custom_bundle))
        .route("/bundles/custom/{name}", delete(remove_custom_bundle))
        .route("/bundles/{name}", get(get_bundle))
}

#[derive(Debug, Deserialize)]
pub struct CustomRequest {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub uri: String,
}

async fn list_bundles(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.bundles.list(RegistryKind::Bundle)).unwrap_or_default())
}

async fn get_bundle(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.bundles.describe(&name).await {
        Ok(info) => Ok(Json(serde_json::to_value(info).unwrap_or_default())),
        Err(e) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

async fn validate_bundle(
    State(state): State<AppState>,
    Json(request): Json<ValidateRequest>,
) -> Json<Value> {
    let result = state.bundles.validate_uri(&request.uri).await;
    Json(serde_json::to_value(result).unwrap_or_default())
}

async fn add_custom_bundle(
    State(state): State<AppState>,
    Json(request): Json<CustomRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let result = state
        .bundles
        .register_custom(
            RegistryKind::Bundle,
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

async fn remove_custom_bundle(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let result = state.bundles.unregister_custom(RegistryKind::Bundle, &name);
    if result.success {
        Ok(Json(serde_json::to_value(result).unwrap_or_default()))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::to_value(result).unwrap_or_default()),
        ))
    }
}
