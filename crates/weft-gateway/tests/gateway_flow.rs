//! End-to-end gateway tests: a scripted agent runtime drives the full
//! stack over a real WebSocket connection and the REST surface.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite;

use weft_gateway::config::GatewayConfig;
use weft_gateway::runtime::echo::EchoResolver;
use weft_gateway::runtime::{
    AgentRuntime, ApprovalSink, CreateSessionRequest, EventSender, SessionHandle,
};
use weft_shared::events::{BlockKind, EventScope, RuntimeEvent, ToolStatus};
use weft_shared::transcript::{Role, TranscriptEntry};

// ---------------------------------------------------------------------------
// Scripted runtime
// ---------------------------------------------------------------------------

/// One scripted action inside a turn.
enum Step {
    /// Emit a runtime event as-is.
    Event(RuntimeEvent),
    /// Emit a tool call, ask for approval, then emit the tool result
    /// (success unless the choice contains "deny").
    Approval {
        tool_id: &'static str,
        tool_name: &'static str,
        arguments: Value,
        prompt: &'static str,
        options: Vec<String>,
        timeout_secs: u64,
        default: &'static str,
    },
    /// Append an entry to the session transcript.
    Remember(TranscriptEntry),
    /// Hold the turn open for a while.
    Sleep(u64),
    /// Abort the turn with a runtime fault.
    Fail(&'static str),
}

/// Pops one session script per `create_session`, one turn script per
/// `execute`.
struct ScriptedRuntime {
    sessions: Mutex<VecDeque<VecDeque<Vec<Step>>>>,
}

impl ScriptedRuntime {
    fn new(sessions: Vec<Vec<Vec<Step>>>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(
                sessions
                    .into_iter()
                    .map(|turns| turns.into_iter().collect())
                    .collect(),
            ),
        })
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> anyhow::Result<Box<dyn SessionHandle>> {
        let turns = self
            .sessions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        Ok(Box::new(ScriptedSession {
            turns: Mutex::new(turns),
            events: request.sinks.events,
            approvals: request.sinks.approvals,
            transcript: Mutex::new(request.initial_transcript),
        }))
    }
}

struct ScriptedSession {
    turns: Mutex<VecDeque<Vec<Step>>>,
    events: EventSender,
    approvals: Arc<dyn ApprovalSink>,
    transcript: Mutex<Vec<TranscriptEntry>>,
}

#[async_trait]
impl SessionHandle for ScriptedSession {
    async fn execute(
        &self,
        prompt: &str,
        _images: Option<Vec<String>>,
        _attachments: Option<Vec<weft_shared::frames::Attachment>>,
    ) -> anyhow::Result<()> {
        self.transcript
            .lock()
            .unwrap()
            .push(TranscriptEntry::text(Role::User, prompt));
        let steps = self.turns.lock().unwrap().pop_front().unwrap_or_default();
        for step in steps {
            match step {
                Step::Event(event) => {
                    self.events.send(event);
                }
                Step::Approval {
                    tool_id,
                    tool_name,
                    arguments,
                    prompt,
                    options,
                    timeout_secs,
                    default,
                } => {
                    self.events.send(RuntimeEvent::ToolCall {
                        id: tool_id.to_string(),
                        tool_name: tool_name.to_string(),
                        arguments,
                        status: ToolStatus::Pending,
                        scope: EventScope::default(),
                    });
                    let choice = self
                        .approvals
                        .request(
                            prompt,
                            &options,
                            Duration::from_secs(timeout_secs),
                            default,
                        )
                        .await;
                    let approved = !choice.to_lowercase().contains("deny");
                    self.events.send(RuntimeEvent::ToolResult {
                        id: tool_id.to_string(),
                        tool_name: tool_name.to_string(),
                        output: if approved { "ok" } else { "denied" }.to_string(),
                        success: approved,
                        error: (!approved).then(|| "denied by user".to_string()),
                        scope: EventScope::default(),
                    });
                }
                Step::Remember(entry) => {
                    self.transcript.lock().unwrap().push(entry);
                }
                Step::Sleep(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                Step::Fail(message) => {
                    return Err(anyhow::anyhow!(message));
                }
            }
        }
        Ok(())
    }

    fn cancel(&self, _immediate: bool) {}

    fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct Gateway {
    addr: SocketAddr,
    token: String,
    state_root: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

async fn start_gateway(runtime: Arc<dyn AgentRuntime>) -> Gateway {
    let dir = tempfile::tempdir().unwrap();
    let state_root = dir.path().to_path_buf();
    let config = Arc::new(GatewayConfig::at(
        state_root.clone(),
        "127.0.0.1".to_string(),
        0,
    ));
    let (app, _is_new, token) =
        weft_gateway::build_app(config, Arc::new(EchoResolver), runtime).unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    Gateway {
        addr,
        token,
        state_root,
        _dir: dir,
    }
}

async fn ws_send(ws: &mut WsStream, value: Value) {
    ws.send(tungstenite::Message::Text(value.to_string()))
        .await
        .unwrap();
}

async fn ws_recv(ws: &mut WsStream) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("websocket error");
        match msg {
            tungstenite::Message::Text(text) => {
                return serde_json::from_str(&text).expect("invalid frame JSON");
            }
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => panic!("unexpected websocket message: {other:?}"),
        }
    }
}

async fn connect_authed(gateway: &Gateway) -> WsStream {
    let url = format!("ws://{}/ws/session", gateway.addr);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws_send(&mut ws, json!({"type": "auth", "token": gateway.token})).await;
    let frame = ws_recv(&mut ws).await;
    assert_eq!(frame["type"], "auth_success");
    ws
}

/// Create a session over an authed socket and return its id.
async fn create_session(ws: &mut WsStream, config: Value) -> String {
    ws_send(ws, json!({"type": "create_session", "config": config})).await;
    let created = ws_recv(ws).await;
    assert_eq!(created["type"], "session_created", "{created}");
    let debug = ws_recv(ws).await;
    assert_eq!(debug["type"], "bundle_debug_info");
    created["session_id"].as_str().unwrap().to_string()
}

fn simple_reply_turn(text: &'static str) -> Vec<Step> {
    vec![
        Step::Event(RuntimeEvent::ContentStart {
            index: 0,
            block_type: BlockKind::Text,
            scope: EventScope::default(),
        }),
        Step::Event(RuntimeEvent::ContentDelta {
            index: 0,
            delta: text.to_string(),
            scope: EventScope::default(),
        }),
        Step::Event(RuntimeEvent::ContentEnd {
            index: 0,
            content: text.to_string(),
            scope: EventScope::default(),
        }),
        Step::Remember(TranscriptEntry::text(Role::Assistant, text)),
    ]
}

fn approval_options() -> Vec<String> {
    vec![
        "Allow once".to_string(),
        "Allow always".to_string(),
        "Deny".to_string(),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejects_bad_auth_token() {
    let gateway = start_gateway(ScriptedRuntime::new(vec![])).await;
    let url = format!("ws://{}/ws/session", gateway.addr);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws_send(&mut ws, json!({"type": "auth", "token": "wrong"})).await;

    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match msg {
        tungstenite::Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 4001);
        }
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn happy_path_streaming_and_transcript() {
    let runtime = ScriptedRuntime::new(vec![vec![simple_reply_turn("Hi!")]]);
    let gateway = start_gateway(runtime).await;
    let mut ws = connect_authed(&gateway).await;

    let session_id = create_session(&mut ws, json!({"bundle": "foundation", "behaviors": []})).await;
    ws_send(&mut ws, json!({"type": "prompt", "content": "hello"})).await;

    let start = ws_recv(&mut ws).await;
    assert_eq!(start["type"], "content_start");
    assert_eq!(start["block_type"], "text");
    assert_eq!(start["index"], 0);
    assert_eq!(start["order"], 0);

    let delta = ws_recv(&mut ws).await;
    assert_eq!(delta["type"], "content_delta");
    assert_eq!(delta["index"], 0);
    assert_eq!(delta["delta"], "Hi!");

    let end = ws_recv(&mut ws).await;
    assert_eq!(end["type"], "content_end");
    assert_eq!(end["content"], "Hi!");

    let complete = ws_recv(&mut ws).await;
    assert_eq!(complete["type"], "prompt_complete");
    assert_eq!(complete["turn"], 1);

    // Two entries persisted: user "hello", assistant "Hi!".
    let transcript_path = gateway
        .state_root
        .join("web-sessions")
        .join(&session_id)
        .join("transcript.jsonl");
    let content = std::fs::read_to_string(transcript_path).unwrap();
    let lines: Vec<Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["role"], "user");
    assert_eq!(lines[0]["content"], "hello");
    assert_eq!(lines[1]["role"], "assistant");
    assert_eq!(lines[1]["content"], "Hi!");
}

#[tokio::test]
async fn tool_approval_flow_and_artifact_ledger() {
    let turn = vec![
        Step::Event(RuntimeEvent::ContentStart {
            index: 0,
            block_type: BlockKind::Text,
            scope: EventScope::default(),
        }),
        Step::Event(RuntimeEvent::ContentDelta {
            index: 0,
            delta: "writing".to_string(),
            scope: EventScope::default(),
        }),
        Step::Event(RuntimeEvent::ContentEnd {
            index: 0,
            content: "writing".to_string(),
            scope: EventScope::default(),
        }),
        Step::Approval {
            tool_id: "T1",
            tool_name: "write_file",
            arguments: json!({"file_path": "/tmp/weft-e2e-x.txt", "content": "data\n"}),
            prompt: "Allow write to /tmp/weft-e2e-x.txt?",
            options: approval_options(),
            timeout_secs: 300,
            default: "Deny",
        },
        Step::Event(RuntimeEvent::ContentStart {
            index: 0,
            block_type: BlockKind::Text,
            scope: EventScope::default(),
        }),
        Step::Event(RuntimeEvent::ContentEnd {
            index: 0,
            content: "done".to_string(),
            scope: EventScope::default(),
        }),
        Step::Remember(TranscriptEntry::text(Role::Assistant, "done")),
    ];
    let runtime = ScriptedRuntime::new(vec![vec![turn]]);
    let gateway = start_gateway(runtime).await;
    let mut ws = connect_authed(&gateway).await;

    let session_id = create_session(&mut ws, json!({})).await;
    ws_send(&mut ws, json!({"type": "prompt", "content": "write a file"})).await;

    assert_eq!(ws_recv(&mut ws).await["type"], "content_start");
    assert_eq!(ws_recv(&mut ws).await["type"], "content_delta");
    assert_eq!(ws_recv(&mut ws).await["type"], "content_end");

    let tool_call = ws_recv(&mut ws).await;
    assert_eq!(tool_call["type"], "tool_call");
    assert_eq!(tool_call["tool_name"], "write_file");
    assert_eq!(tool_call["id"], "T1");
    assert_eq!(tool_call["order"], 1);
    assert_eq!(tool_call["status"], "pending");

    let request = ws_recv(&mut ws).await;
    assert_eq!(request["type"], "approval_request");
    assert_eq!(request["prompt"], "Allow write to /tmp/weft-e2e-x.txt?");
    assert_eq!(request["timeout"], 300);
    assert_eq!(request["default"], "Deny");
    let approval_id = request["id"].as_str().unwrap();

    ws_send(
        &mut ws,
        json!({"type": "approval_response", "id": approval_id, "choice": "Allow once"}),
    )
    .await;

    let result = ws_recv(&mut ws).await;
    assert_eq!(result["type"], "tool_result");
    assert_eq!(result["id"], "T1");
    assert_eq!(result["success"], true);

    // New response phase: server index 0 maps to a fresh local index and
    // the order counter keeps climbing past the tool call.
    let start = ws_recv(&mut ws).await;
    assert_eq!(start["type"], "content_start");
    assert_eq!(start["index"], 1);
    assert_eq!(start["order"], 2);
    assert_eq!(ws_recv(&mut ws).await["type"], "content_end");
    assert_eq!(ws_recv(&mut ws).await["type"], "prompt_complete");

    // The ledger recorded the create.
    let client = reqwest::Client::new();
    let artifacts: Value = client
        .get(format!(
            "http://{}/api/sessions/{}/artifacts",
            gateway.addr, session_id
        ))
        .bearer_auth(&gateway.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let artifacts = artifacts.as_array().unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0]["file_path"], "/tmp/weft-e2e-x.txt");
    assert_eq!(artifacts[0]["operation"], "create");
}

#[tokio::test]
async fn allow_always_caches_the_decision() {
    let approval = || Step::Approval {
        tool_id: "T1",
        tool_name: "write_file",
        arguments: json!({"file_path": "/tmp/weft-e2e-cache.txt", "content": "x"}),
        prompt: "Allow write to /tmp/weft-e2e-cache.txt?",
        options: approval_options(),
        timeout_secs: 300,
        default: "Deny",
    };
    let second = Step::Approval {
        tool_id: "T2",
        tool_name: "write_file",
        arguments: json!({"file_path": "/tmp/weft-e2e-cache.txt", "content": "x"}),
        prompt: "Allow write to /tmp/weft-e2e-cache.txt?",
        options: approval_options(),
        timeout_secs: 300,
        default: "Deny",
    };
    let runtime = ScriptedRuntime::new(vec![vec![vec![approval()], vec![second]]]);
    let gateway = start_gateway(runtime).await;
    let mut ws = connect_authed(&gateway).await;
    create_session(&mut ws, json!({})).await;

    ws_send(&mut ws, json!({"type": "prompt", "content": "first"})).await;
    assert_eq!(ws_recv(&mut ws).await["type"], "tool_call");
    let request = ws_recv(&mut ws).await;
    assert_eq!(request["type"], "approval_request");
    ws_send(
        &mut ws,
        json!({
            "type": "approval_response",
            "id": request["id"],
            "choice": "Allow always"
        }),
    )
    .await;
    assert_eq!(ws_recv(&mut ws).await["type"], "tool_result");
    assert_eq!(ws_recv(&mut ws).await["type"], "prompt_complete");

    // Same fingerprint in the same session: no approval_request frame
    // between tool_call and tool_result.
    ws_send(&mut ws, json!({"type": "prompt", "content": "second"})).await;
    assert_eq!(ws_recv(&mut ws).await["type"], "tool_call");
    let next = ws_recv(&mut ws).await;
    assert_eq!(next["type"], "tool_result", "{next}");
    assert_eq!(next["success"], true);
    assert_eq!(ws_recv(&mut ws).await["type"], "prompt_complete");
}

#[tokio::test]
async fn approval_timeout_applies_default_and_drops_late_response() {
    let turn = vec![Step::Approval {
        tool_id: "T1",
        tool_name: "write_file",
        arguments: json!({"file_path": "/tmp/weft-e2e-timeout.txt", "content": "x"}),
        prompt: "Allow write?",
        options: approval_options(),
        timeout_secs: 1,
        default: "Deny",
    }];
    let runtime = ScriptedRuntime::new(vec![vec![turn]]);
    let gateway = start_gateway(runtime).await;
    let mut ws = connect_authed(&gateway).await;
    create_session(&mut ws, json!({})).await;

    ws_send(&mut ws, json!({"type": "prompt", "content": "try"})).await;
    assert_eq!(ws_recv(&mut ws).await["type"], "tool_call");
    let request = ws_recv(&mut ws).await;
    assert_eq!(request["type"], "approval_request");
    assert_eq!(request["timeout"], 1);

    // No response: the default applies after a second.
    let timeout_frame = ws_recv(&mut ws).await;
    assert_eq!(timeout_frame["type"], "approval_timeout");
    assert_eq!(timeout_frame["applied_default"], "Deny");

    let result = ws_recv(&mut ws).await;
    assert_eq!(result["type"], "tool_result");
    assert_eq!(result["success"], false);
    assert_eq!(ws_recv(&mut ws).await["type"], "prompt_complete");

    // A late response is silently dropped and the connection stays usable.
    ws_send(
        &mut ws,
        json!({"type": "approval_response", "id": request["id"], "choice": "Allow once"}),
    )
    .await;
    ws_send(&mut ws, json!({"type": "ping"})).await;
    assert_eq!(ws_recv(&mut ws).await["type"], "pong");
}

#[tokio::test]
async fn parallel_forks_bind_fifo_and_release() {
    let child_scope = |child: &str| EventScope {
        child_session_id: Some(child.to_string()),
        parent_tool_call_id: None,
        nesting_depth: 1,
    };
    let turn = vec![
        Step::Event(RuntimeEvent::ToolCall {
            id: "T_a".into(),
            tool_name: "task".into(),
            arguments: json!({"agent": "researcher"}),
            status: ToolStatus::Pending,
            scope: EventScope::default(),
        }),
        Step::Event(RuntimeEvent::ToolCall {
            id: "T_b".into(),
            tool_name: "task".into(),
            arguments: json!({"agent": "reviewer"}),
            status: ToolStatus::Pending,
            scope: EventScope::default(),
        }),
        Step::Event(RuntimeEvent::SessionFork {
            child_session_id: "child-a".into(),
            parent_tool_call_id: None,
            agent: Some("researcher".into()),
        }),
        Step::Event(RuntimeEvent::SessionFork {
            child_session_id: "child-b".into(),
            parent_tool_call_id: None,
            agent: Some("reviewer".into()),
        }),
        Step::Event(RuntimeEvent::ContentStart {
            index: 0,
            block_type: BlockKind::Text,
            scope: child_scope("child-a"),
        }),
        Step::Event(RuntimeEvent::ContentDelta {
            index: 0,
            delta: "from a".into(),
            scope: child_scope("child-a"),
        }),
        Step::Event(RuntimeEvent::ContentStart {
            index: 0,
            block_type: BlockKind::Text,
            scope: child_scope("child-b"),
        }),
        Step::Event(RuntimeEvent::ToolResult {
            id: "T_a".into(),
            tool_name: "task".into(),
            output: "a done".into(),
            success: true,
            error: None,
            scope: EventScope::default(),
        }),
        Step::Event(RuntimeEvent::ToolResult {
            id: "T_b".into(),
            tool_name: "task".into(),
            output: "b done".into(),
            success: true,
            error: None,
            scope: EventScope::default(),
        }),
    ];
    let runtime = ScriptedRuntime::new(vec![vec![turn]]);
    let gateway = start_gateway(runtime).await;
    let mut ws = connect_authed(&gateway).await;
    create_session(&mut ws, json!({})).await;

    ws_send(&mut ws, json!({"type": "prompt", "content": "delegate"})).await;

    assert_eq!(ws_recv(&mut ws).await["id"], "T_a");
    assert_eq!(ws_recv(&mut ws).await["id"], "T_b");

    let fork_a = ws_recv(&mut ws).await;
    assert_eq!(fork_a["type"], "session_fork");
    assert_eq!(fork_a["child_session_id"], "child-a");
    assert_eq!(fork_a["parent_tool_call_id"], "T_a");

    let fork_b = ws_recv(&mut ws).await;
    assert_eq!(fork_b["child_session_id"], "child-b");
    assert_eq!(fork_b["parent_tool_call_id"], "T_b");

    let start_a = ws_recv(&mut ws).await;
    assert_eq!(start_a["type"], "content_start");
    assert_eq!(start_a["child_session_id"], "child-a");
    assert_eq!(start_a["parent_tool_call_id"], "T_a");

    let delta_a = ws_recv(&mut ws).await;
    assert_eq!(delta_a["child_session_id"], "child-a");
    assert_eq!(delta_a["delta"], "from a");

    let start_b = ws_recv(&mut ws).await;
    assert_eq!(start_b["child_session_id"], "child-b");
    // Independent per-child lanes: both children start at index 0, order 0.
    assert_eq!(start_b["index"], 0);
    assert_eq!(start_b["order"], 0);

    // Completion releases each child's state and announces it.
    let end_a = ws_recv(&mut ws).await;
    assert_eq!(end_a["type"], "session_end");
    assert_eq!(end_a["child_session_id"], "child-a");
    assert_eq!(ws_recv(&mut ws).await["type"], "tool_result");

    let end_b = ws_recv(&mut ws).await;
    assert_eq!(end_b["type"], "session_end");
    assert_eq!(end_b["child_session_id"], "child-b");
    assert_eq!(ws_recv(&mut ws).await["type"], "tool_result");

    assert_eq!(ws_recv(&mut ws).await["type"], "prompt_complete");
}

#[tokio::test]
async fn resume_preserves_id_and_turn_count() {
    let first_session = vec![
        simple_reply_turn("one"),
        simple_reply_turn("two"),
        simple_reply_turn("three"),
    ];
    let resumed_session = vec![simple_reply_turn("four")];
    let runtime = ScriptedRuntime::new(vec![first_session, resumed_session]);
    let gateway = start_gateway(runtime).await;

    let mut ws = connect_authed(&gateway).await;
    let session_id = create_session(&mut ws, json!({})).await;
    for _ in 0..3 {
        ws_send(&mut ws, json!({"type": "prompt", "content": "go"})).await;
        loop {
            if ws_recv(&mut ws).await["type"] == "prompt_complete" {
                break;
            }
        }
    }
    ws.close(None).await.unwrap();
    // Let the server tear the session down before resuming it.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut ws = connect_authed(&gateway).await;
    let resumed_id =
        create_session(&mut ws, json!({"resume_session_id": session_id})).await;
    assert_eq!(resumed_id, session_id);

    ws_send(&mut ws, json!({"type": "prompt", "content": "again"})).await;
    loop {
        let frame = ws_recv(&mut ws).await;
        if frame["type"] == "prompt_complete" {
            assert_eq!(frame["turn"], 4);
            break;
        }
    }

    let transcript_path = gateway
        .state_root
        .join("web-sessions")
        .join(&session_id)
        .join("transcript.jsonl");
    let content = std::fs::read_to_string(transcript_path).unwrap();
    assert_eq!(content.lines().count(), 8);
}

#[tokio::test]
async fn second_prompt_while_executing_is_rejected() {
    let turn = vec![Step::Sleep(400), Step::Remember(TranscriptEntry::text(Role::Assistant, "slow"))];
    let runtime = ScriptedRuntime::new(vec![vec![turn]]);
    let gateway = start_gateway(runtime).await;
    let mut ws = connect_authed(&gateway).await;
    create_session(&mut ws, json!({})).await;

    ws_send(&mut ws, json!({"type": "prompt", "content": "slow"})).await;
    ws_send(&mut ws, json!({"type": "prompt", "content": "eager"})).await;

    let error = ws_recv(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert!(error["error"].as_str().unwrap().contains("already executing"));

    assert_eq!(ws_recv(&mut ws).await["type"], "prompt_complete");
}

#[tokio::test]
async fn runtime_fault_marks_session_terminal() {
    let turn = vec![Step::Fail("provider exploded")];
    let runtime = ScriptedRuntime::new(vec![vec![turn]]);
    let gateway = start_gateway(runtime).await;
    let mut ws = connect_authed(&gateway).await;
    let session_id = create_session(&mut ws, json!({})).await;

    ws_send(&mut ws, json!({"type": "prompt", "content": "boom"})).await;

    let error = ws_recv(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert!(error["error"].as_str().unwrap().contains("provider exploded"));

    let end = ws_recv(&mut ws).await;
    assert_eq!(end["type"], "session_end");
    assert_eq!(end["status"], "errored");

    // The session keeps its seat but is terminal: later frames get the
    // specific reason rather than "not found".
    ws_send(&mut ws, json!({"type": "prompt", "content": "again"})).await;
    let error = ws_recv(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert!(error["error"].as_str().unwrap().contains("has ended"));

    ws_send(&mut ws, json!({"type": "cancel"})).await;
    let error = ws_recv(&mut ws).await;
    assert!(error["error"].as_str().unwrap().contains("has ended"));

    // History operations see a dead session, not an active one: deleting
    // the errored session succeeds and drops the dead handle.
    let client = reqwest::Client::new();
    let deleted = client
        .delete(format!(
            "http://{}/api/sessions/history/{session_id}",
            gateway.addr
        ))
        .bearer_auth(&gateway.token)
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 200);
}

#[tokio::test]
async fn cooperative_cancel_drains_turn_and_marks_idle() {
    let turn = vec![
        Step::Sleep(200),
        Step::Remember(TranscriptEntry::text(Role::Assistant, "slow")),
    ];
    let runtime = ScriptedRuntime::new(vec![vec![turn]]);
    let gateway = start_gateway(runtime).await;
    let mut ws = connect_authed(&gateway).await;

    create_session(&mut ws, json!({})).await;
    ws_send(&mut ws, json!({"type": "prompt", "content": "slow"})).await;
    ws_send(&mut ws, json!({"type": "cancel", "immediate": false})).await;

    let ack = ws_recv(&mut ws).await;
    assert_eq!(ack["type"], "cancel_acknowledged");
    assert_eq!(ack["immediate"], false);

    // The in-flight turn drains within the deadline.
    assert_eq!(ws_recv(&mut ws).await["type"], "prompt_complete");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = reqwest::Client::new();
    let sessions: Value = client
        .get(format!("http://{}/api/sessions", gateway.addr))
        .bearer_auth(&gateway.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let sessions = sessions.as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["status"], "idle");
}

#[tokio::test]
async fn malformed_frames_do_not_close_the_connection() {
    let gateway = start_gateway(ScriptedRuntime::new(vec![])).await;
    let mut ws = connect_authed(&gateway).await;

    ws_send(&mut ws, json!({"type": "bogus_frame"})).await;
    let error = ws_recv(&mut ws).await;
    assert_eq!(error["type"], "error");

    ws_send(&mut ws, json!({"type": "prompt", "content": "no session"})).await;
    let error = ws_recv(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["error"], "No session created");

    ws_send(&mut ws, json!({"type": "ping"})).await;
    assert_eq!(ws_recv(&mut ws).await["type"], "pong");
}

#[tokio::test]
async fn command_dispatch_over_websocket() {
    let runtime = ScriptedRuntime::new(vec![vec![]]);
    let gateway = start_gateway(runtime).await;
    let mut ws = connect_authed(&gateway).await;
    let session_id = create_session(&mut ws, json!({})).await;

    ws_send(&mut ws, json!({"type": "command", "name": "status"})).await;
    let result = ws_recv(&mut ws).await;
    assert_eq!(result["type"], "command_result");
    assert_eq!(result["command"], "status");
    assert_eq!(result["result"]["session_id"], session_id);
    assert_eq!(result["result"]["bundle"], "foundation");

    ws_send(&mut ws, json!({"type": "command", "name": "nope"})).await;
    let result = ws_recv(&mut ws).await;
    assert!(result["result"]["error"]
        .as_str()
        .unwrap()
        .contains("Unknown command"));
}

#[tokio::test]
async fn rest_surface_round_trip() {
    let gateway = start_gateway(ScriptedRuntime::new(vec![])).await;
    let base = format!("http://{}", gateway.addr);
    let client = reqwest::Client::new();

    // Health needs no token.
    let health: Value = client
        .get(format!("{base}/api/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");

    // Everything else does.
    let unauthorized = client
        .get(format!("{base}/api/preferences"))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthorized.status(), 401);

    let verify: Value = client
        .get(format!("{base}/api/auth/verify"))
        .bearer_auth(&gateway.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(verify["authenticated"], true);

    // Loopback callers can fetch the token.
    let local: Value = client
        .get(format!("{base}/api/auth/local-token"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(local["token"], gateway.token.as_str());

    // Preferences round trip.
    let updated: Value = client
        .put(format!("{base}/api/preferences"))
        .bearer_auth(&gateway.token)
        .json(&json!({"default_bundle": "weft-dev", "show_thinking": false}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["default_bundle"], "weft-dev");
    assert_eq!(updated["show_thinking"], false);

    // Bundle and behavior listings include the builtins.
    let bundles: Value = client
        .get(format!("{base}/api/bundles"))
        .bearer_auth(&gateway.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(bundles
        .as_array()
        .unwrap()
        .iter()
        .any(|b| b["name"] == "foundation"));

    let behaviors: Value = client
        .get(format!("{base}/api/behaviors"))
        .bearer_auth(&gateway.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(behaviors
        .as_array()
        .unwrap()
        .iter()
        .any(|b| b["name"] == "sessions"));

    // Extraction of a markdown document.
    let extracted: Value = client
        .post(format!("{base}/api/extract"))
        .bearer_auth(&gateway.token)
        .json(&json!({
            "filename": "notes.md",
            "content": base64_encode("# hello"),
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(extracted["text"], "# hello");
}

fn base64_encode(text: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(text.as_bytes())
}

#[tokio::test]
async fn session_history_listing_and_delete() {
    let runtime = ScriptedRuntime::new(vec![vec![simple_reply_turn("done")]]);
    let gateway = start_gateway(runtime).await;
    let mut ws = connect_authed(&gateway).await;
    let session_id = create_session(&mut ws, json!({})).await;
    ws_send(&mut ws, json!({"type": "prompt", "content": "go"})).await;
    loop {
        if ws_recv(&mut ws).await["type"] == "prompt_complete" {
            break;
        }
    }

    let base = format!("http://{}", gateway.addr);
    let client = reqwest::Client::new();

    // Deleting an active session is refused.
    let refused = client
        .delete(format!("{base}/api/sessions/history/{session_id}"))
        .bearer_auth(&gateway.token)
        .send()
        .await
        .unwrap();
    assert_eq!(refused.status(), 409);

    ws.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let history: Value = client
        .get(format!("{base}/api/sessions/history"))
        .bearer_auth(&gateway.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = history.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["session_id"], session_id.as_str());
    assert_eq!(entries[0]["turn_count"], 1);

    // Rename, then delete.
    let renamed = client
        .put(format!("{base}/api/sessions/history/{session_id}/rename"))
        .bearer_auth(&gateway.token)
        .json(&json!({"name": "my run"}))
        .send()
        .await
        .unwrap();
    assert_eq!(renamed.status(), 200);

    let deleted = client
        .delete(format!("{base}/api/sessions/history/{session_id}"))
        .bearer_auth(&gateway.token)
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 200);

    let history: Value = client
        .get(format!("{base}/api/sessions/history"))
        .bearer_auth(&gateway.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(history.as_array().unwrap().is_empty());
}
