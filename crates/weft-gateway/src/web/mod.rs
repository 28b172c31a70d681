//! REST surface for the browser UI.
//!
//! Everything under `/api` requires the bearer token except `/api/health`
//! and the loopback-only `/api/auth/local-token`.

pub mod middleware;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::artifacts::ArtifactLedger;
use crate::auth::AuthToken;
use crate::bundles::BundleIndex;
use crate::config::GatewayConfig;
use crate::preferences::PreferenceStore;
use crate::session::SessionManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub token: Arc<AuthToken>,
    pub manager: Arc<SessionManager>,
    pub bundles: Arc<BundleIndex>,
    pub preferences: Arc<PreferenceStore>,
    pub artifacts: Arc<ArtifactLedger>,
}

pub fn build_router(state: AppState) -> Router {
    let origins: Vec<axum::http::HeaderValue> = state
        .config
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
        ])
        .allow_origin(AllowOrigin::list(origins));

    let api = routes::api_router().layer(cors);

    Router::new()
        .nest("/api", api)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::bearer_auth,
        ))
        .with_state(state)
}
