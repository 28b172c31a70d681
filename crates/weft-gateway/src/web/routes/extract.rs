//! Document text extraction endpoint.

use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;

use crate::extract::{extract_text, ExtractRequest};
use crate::web::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/extract", post(extract))
}

async fn extract(Json(request): Json<ExtractRequest>) -> Json<Value> {
    let result = extract_text(&request.filename, &request.content);
    Json(serde_json::to_value(result).unwrap_or_default())
}
