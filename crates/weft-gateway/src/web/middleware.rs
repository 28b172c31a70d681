//! Bearer-token middleware for the REST surface.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::web::AppState;

/// Paths that skip the bearer check. `local-token` applies its own
/// loopback-only policy in the handler.
const PUBLIC_PATHS: &[&str] = &["/api/health", "/api/auth/local-token"];

pub async fn bearer_auth(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    let path = req.uri().path();
    if !path.starts_with("/api/") || PUBLIC_PATHS.contains(&path) {
        return Ok(next.run(req).await);
    }

    let presented = match extract_bearer_token(&req) {
        Some(t) => t,
        None => {
            return Err(unauthorized("Missing authentication token"));
        }
    };

    if !state.token.verify(&presented) {
        return Err(unauthorized("Invalid authentication token"));
    }

    Ok(next.run(req).await)
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": message })),
    )
        .into_response()
}

fn extract_bearer_token(req: &Request) -> Option<String> {
    req.headers()
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|s| s.to_string())
}
