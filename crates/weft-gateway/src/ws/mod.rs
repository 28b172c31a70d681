//! WebSocket multiplexer.
//!
//! One reader and one writer task per connection, joined by the bounded
//! outbound queue. Connection state machine:
//!
//! ```text
//! NEW -> AWAITING_AUTH -> READY -> CLOSED
//!                      \-> CLOSED (code 4001 on auth failure)
//! ```
//!
//! The first client frame must be `auth` and must arrive within the auth
//! window. After that the reader dispatches typed frames until disconnect,
//! idle timeout, or a slow-consumer overflow closes the connection.

pub mod outbound;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Router;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use weft_shared::frames::{ClientFrame, ServerFrame};

use crate::auth::AuthToken;
use crate::error::GatewayError;
use crate::session::SessionManager;
use outbound::Outbound;

/// WebSocket close code for authentication failures.
const CLOSE_AUTH_FAILURE: u16 = 4001;
/// Policy-violation close code used for slow consumers.
const CLOSE_SLOW_CONSUMER: u16 = 1008;

#[derive(Clone)]
pub struct WsState {
    pub manager: Arc<SessionManager>,
    pub token: Arc<AuthToken>,
    pub auth_timeout: Duration,
    pub read_idle_timeout: Duration,
}

pub fn ws_router(state: WsState) -> Router {
    Router::new()
        .route("/ws/session", axum::routing::get(ws_upgrade))
        .with_state(state)
}

async fn ws_upgrade(State(state): State<WsState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session_ws(socket, state))
}

async fn handle_session_ws(socket: WebSocket, state: WsState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // AWAITING_AUTH: exactly one frame, within the window, carrying a valid
    // token. Anything else closes with 4001.
    match authenticate(&mut ws_rx, &state).await {
        Ok(()) => {}
        Err(reason) => {
            warn!(reason = %reason, "WebSocket authentication failed");
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_AUTH_FAILURE,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    }

    let outbound = Outbound::new();
    outbound.push(ServerFrame::AuthSuccess);
    debug!("WebSocket authenticated");

    // Sessions created on this connection; torn down when it goes away.
    let owned: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let writer_done = Arc::new(Notify::new());

    let writer = spawn_writer(
        ws_tx,
        outbound.clone(),
        state.manager.clone(),
        owned.clone(),
        writer_done.clone(),
    );

    read_loop(&mut ws_rx, &state, &outbound, &owned, &writer_done).await;

    // CLOSED: drain the queue, then tear down every owned session.
    outbound.close();
    let ids: Vec<String> = owned.lock().unwrap().drain(..).collect();
    for session_id in ids {
        state.manager.close_session(&session_id);
    }
    let _ = writer.await;
    debug!("WebSocket disconnected");
}

async fn authenticate(
    ws_rx: &mut SplitStream<WebSocket>,
    state: &WsState,
) -> Result<(), &'static str> {
    let first = tokio::time::timeout(state.auth_timeout, ws_rx.next()).await;
    let msg = match first {
        Err(_) => return Err("Authentication timeout"),
        Ok(None) => return Err("Connection closed before authentication"),
        Ok(Some(Err(_))) => return Err("Authentication failed"),
        Ok(Some(Ok(msg))) => msg,
    };
    let text = match msg {
        Message::Text(t) => t.to_string(),
        _ => return Err("Invalid auth message"),
    };
    match serde_json::from_str::<ClientFrame>(&text) {
        Ok(ClientFrame::Auth { token }) if state.token.verify(&token) => Ok(()),
        Ok(ClientFrame::Auth { .. }) => Err("Invalid or missing auth token"),
        _ => Err("Invalid auth message"),
    }
}

/// Writer pump: pops frames and pushes them onto the socket. On overflow it
/// cancels the connection's sessions and closes with a slow-consumer reason.
fn spawn_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    outbound: Outbound,
    manager: Arc<SessionManager>,
    owned: Arc<Mutex<Vec<String>>>,
    done: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = outbound.pop().await {
            let json = match serde_json::to_string(&frame) {
                Ok(j) => j,
                Err(e) => {
                    warn!(error = %e, "failed to serialize frame");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }

        if outbound.is_overflowed() {
            info!("closing slow consumer");
            let ids: Vec<String> = owned.lock().unwrap().clone();
            for session_id in &ids {
                let _ = manager.cancel(session_id, true).await;
            }
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_SLOW_CONSUMER,
                    reason: "slow consumer".into(),
                })))
                .await;
        }
        done.notify_one();
    })
}

async fn read_loop(
    ws_rx: &mut SplitStream<WebSocket>,
    state: &WsState,
    outbound: &Outbound,
    owned: &Arc<Mutex<Vec<String>>>,
    writer_done: &Arc<Notify>,
) {
    // The most recently created session is the default target for frames
    // that omit `session_id`.
    let mut last_session: Option<String> = None;

    loop {
        let msg = tokio::select! {
            _ = writer_done.notified() => break,
            read = tokio::time::timeout(state.read_idle_timeout, ws_rx.next()) => {
                match read {
                    Err(_) => {
                        info!("closing idle connection");
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(_))) => break,
                    Ok(Some(Ok(msg))) => msg,
                }
            }
        };

        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let frame = match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => frame,
            Err(_) => {
                outbound.push(ServerFrame::error("Unknown or malformed frame"));
                continue;
            }
        };

        match frame {
            ClientFrame::Auth { .. } => {
                outbound.push(ServerFrame::error("Already authenticated"));
            }
            ClientFrame::CreateSession { config } => {
                match state.manager.create(outbound.clone(), config).await {
                    Ok(session_id) => {
                        owned.lock().unwrap().push(session_id.clone());
                        last_session = Some(session_id);
                    }
                    Err(e @ (GatewayError::InvalidCwd(_) | GatewayError::SessionActive(_))) => {
                        outbound.push(ServerFrame::error(e.to_string()));
                    }
                    // Resolution/timeout failures already produced their
                    // error + session_end frames.
                    Err(_) => {}
                }
            }
            ClientFrame::Prompt {
                content,
                images,
                attachments,
                session_id,
            } => match target(session_id, &last_session) {
                Some(id) => {
                    if let Err(e) = state.manager.prompt(&id, content, images, attachments) {
                        outbound.push(ServerFrame::session_error(id, e.to_string()));
                    }
                }
                None => {
                    outbound.push(ServerFrame::error("No session created"));
                }
            },
            ClientFrame::ApprovalResponse {
                id,
                choice,
                session_id,
            } => {
                if let Some(target_id) = target(session_id, &last_session) {
                    state
                        .manager
                        .handle_approval_response(&target_id, &id, &choice);
                }
            }
            ClientFrame::Cancel {
                immediate,
                session_id,
            } => match target(session_id, &last_session) {
                Some(id) => {
                    if let Err(e) = state.manager.cancel(&id, immediate).await {
                        outbound.push(ServerFrame::session_error(id, e.to_string()));
                    }
                }
                None => {
                    outbound.push(ServerFrame::error("No session created"));
                }
            },
            ClientFrame::Command {
                name,
                args,
                session_id,
            } => {
                let target_id = target(session_id, &last_session);
                outbound.push(state.manager.command(target_id.as_deref(), &name, &args));
            }
            ClientFrame::Ping => {
                outbound.push(ServerFrame::Pong);
            }
        }
    }
}

fn target(explicit: Option<String>, last: &Option<String>) -> Option<String> {
    explicit.or_else(|| last.clone())
}
