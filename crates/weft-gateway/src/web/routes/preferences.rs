//! Preferences endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::preferences::PreferencesUpdate;
use crate::web::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/preferences", get(get_preferences))
        .route("/preferences", put(update_preferences))
}

async fn get_preferences(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.preferences.load()).unwrap_or_default())
}

async fn update_preferences(
    State(state): State<AppState>,
    Json(updates): Json<PreferencesUpdate>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.preferences.update(updates) {
        Ok(prefs) => Ok(Json(serde_json::to_value(prefs).unwrap_or_default())),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}
