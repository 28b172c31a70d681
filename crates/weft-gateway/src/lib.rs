pub mod adapter;
pub mod approvals;
pub mod artifacts;
pub mod auth;
pub mod bundles;
pub mod config;
pub mod error;
pub mod extract;
pub mod preferences;
pub mod runtime;
pub mod security;
pub mod session;
pub mod transcripts;
pub mod web;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::info;

use artifacts::ArtifactLedger;
use bundles::BundleIndex;
use config::GatewayConfig;
use preferences::PreferenceStore;
use runtime::{AgentRuntime, BundleResolver};
use session::SessionManager;
use transcripts::TranscriptStore;
use web::AppState;
use ws::WsState;

/// Wire the gateway together and serve until a shutdown signal arrives.
///
/// The bundle resolver and agent runtime are collaborators, injected rather
/// than constructed here; the binary decides which implementations to use.
pub async fn run_gateway(
    config: GatewayConfig,
    resolver: Arc<dyn BundleResolver>,
    runtime: Arc<dyn AgentRuntime>,
) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let (app, token_is_new, token) = build_app(config.clone(), resolver, runtime)?;

    if token_is_new {
        info!(token = %token, "generated new web auth token");
    }

    let addr = format!("{}:{}", config.listen_host, config.listen_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "gateway listening");

    let shutdown_notify = Arc::new(Notify::new());
    let shutdown_notify_srv = shutdown_notify.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_notify_srv.notified().await;
        })
        .await
    });

    shutdown_signal().await;
    shutdown_notify.notify_one();

    if tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .is_err()
    {
        info!("graceful shutdown timed out, forcing exit");
    }

    info!("gateway stopped");
    Ok(())
}

/// Build the combined REST + WebSocket router. Split out so tests can serve
/// the full app on an ephemeral port.
pub fn build_app(
    config: Arc<GatewayConfig>,
    resolver: Arc<dyn BundleResolver>,
    runtime: Arc<dyn AgentRuntime>,
) -> anyhow::Result<(axum::Router, bool, String)> {
    let token = Arc::new(auth::get_or_create_token(&config.auth_file())?);
    let token_is_new = token.is_new;
    let token_value = token.as_str().to_string();

    let preferences = Arc::new(PreferenceStore::new(config.preferences_file()));
    let transcripts = Arc::new(TranscriptStore::new(config.sessions_dir())?);
    let artifacts = Arc::new(ArtifactLedger::new(config.artifact_diff_limit));
    let bundles = Arc::new(BundleIndex::new(resolver, preferences.clone()));
    let manager = Arc::new(SessionManager::new(
        bundles.clone(),
        runtime,
        transcripts,
        artifacts.clone(),
        config.session_create_timeout,
    ));

    let app_state = AppState {
        config: config.clone(),
        token: token.clone(),
        manager: manager.clone(),
        bundles,
        preferences,
        artifacts,
    };
    let ws_state = WsState {
        manager,
        token,
        auth_timeout: config.auth_timeout,
        read_idle_timeout: config.read_idle_timeout,
    };

    let app = web::build_router(app_state).merge(ws::ws_router(ws_state));
    Ok((app, token_is_new, token_value))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
