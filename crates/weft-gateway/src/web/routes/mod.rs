pub mod auth;
pub mod behaviors;
pub mod bundles;
pub mod extract;
pub mod preferences;
pub mod sessions;

use axum::Router;

use crate::web::AppState;

/// Build the `/api` router (bearer middleware applied externally).
pub fn api_router() -> Router<AppState> {
    Router::new()
        .merge(auth::router())
        .merge(bundles::router())
        .merge(behaviors::router())
        .merge(sessions::router())
        .merge(preferences::router())
        .merge(extract::router())
}
