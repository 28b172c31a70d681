//! Session manager: lifecycle, routing, and teardown of agent sessions.
//!
//! Each session owns one runtime handle, one streaming adapter (driven by a
//! dedicated event pump task), one approval broker shared with any child
//! sessions, and a pointer into the transcript store. REST handlers read
//! session state through copy-out snapshots; mutation happens on the
//! session's own tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use weft_shared::events::RuntimeEvent;
use weft_shared::frames::{
    Attachment, MessageLevel, ServerFrame, SessionConfig, SessionStatus,
};
use weft_shared::transcript::{Role, TranscriptEntry};

use crate::adapter::StreamAdapter;
use crate::approvals::ApprovalBroker;
use crate::artifacts::ArtifactLedger;
use crate::bundles::BundleIndex;
use crate::error::GatewayError;
use crate::runtime::{
    mask_secrets, AgentRuntime, CreateSessionRequest, DisplaySink, EventSender, MountPlan,
    PumpMessage, SessionHandle, SessionSinks,
};
use crate::security;
use crate::transcripts::{SessionMetadata, TranscriptStore};
use crate::ws::outbound::Outbound;

const DEFAULT_BUNDLE: &str = "foundation";

/// How long `cancel` waits for an in-flight turn to drain before marking
/// the session idle anyway.
const CANCEL_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

pub struct ActiveSession {
    pub id: String,
    pub outbound: Outbound,
    pub approvals: Arc<ApprovalBroker>,
    plan: MountPlan,
    handle: Arc<dyn SessionHandle>,
    adapter: Arc<Mutex<StreamAdapter>>,
    metadata: Arc<Mutex<SessionMetadata>>,
    events_tx: EventSender,
    executing: AtomicBool,
    /// Transcript entries already flushed to disk for this session.
    persisted_entries: AtomicUsize,
    exec_task: Mutex<Option<JoinHandle<()>>>,
}

impl ActiveSession {
    pub fn metadata_snapshot(&self) -> SessionMetadata {
        self.metadata.lock().unwrap().clone()
    }

    pub fn child_session_ids(&self) -> Vec<String> {
        self.adapter.lock().unwrap().child_session_ids()
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    /// A terminal session keeps its seat in the table so later frames get
    /// the specific "already terminal" reason instead of "not found".
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.metadata.lock().unwrap().status,
            SessionStatus::Ended | SessionStatus::Errored
        )
    }
}

/// Forwards runtime display messages to the connection as frames.
struct FrameDisplay {
    outbound: Outbound,
}

impl DisplaySink for FrameDisplay {
    fn show(&self, level: MessageLevel, message: &str, source: Option<&str>) {
        self.outbound.push(ServerFrame::DisplayMessage {
            level,
            message: message.to_string(),
            source: source.map(String::from),
            nesting: 0,
        });
    }
}

pub struct SessionManager {
    bundles: Arc<BundleIndex>,
    runtime: Arc<dyn AgentRuntime>,
    transcripts: Arc<TranscriptStore>,
    artifacts: Arc<ArtifactLedger>,
    create_timeout: Duration,
    active: RwLock<HashMap<String, Arc<ActiveSession>>>,
}

impl SessionManager {
    pub fn new(
        bundles: Arc<BundleIndex>,
        runtime: Arc<dyn AgentRuntime>,
        transcripts: Arc<TranscriptStore>,
        artifacts: Arc<ArtifactLedger>,
        create_timeout: Duration,
    ) -> Self {
        Self {
            bundles,
            runtime,
            transcripts,
            artifacts,
            create_timeout,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Create a session (or resume one) and announce it on the connection.
    pub async fn create(
        &self,
        outbound: Outbound,
        config: SessionConfig,
    ) -> Result<String, GatewayError> {
        let cwd = security::validate_session_cwd(config.cwd.as_deref())
            .map_err(GatewayError::InvalidCwd)?;

        let session_id = match &config.resume_session_id {
            Some(id) => id.clone(),
            None => mint_session_id(),
        };
        if self.active.read().unwrap().contains_key(&session_id) {
            return Err(GatewayError::SessionActive(session_id));
        }

        let bundle = config
            .bundle
            .clone()
            .unwrap_or_else(|| DEFAULT_BUNDLE.to_string());
        let behaviors = config.behaviors.clone().unwrap_or_default();
        let show_thinking = config.show_thinking.unwrap_or(true);

        // Reconfigure carries text-only history; resume loads the stored
        // transcript verbatim.
        let initial_transcript = match config.initial_transcript {
            Some(entries) => filter_text_history(entries),
            None => match &config.resume_session_id {
                Some(id) => self.transcripts.load_transcript(id),
                None => Vec::new(),
            },
        };
        let persisted = match &config.resume_session_id {
            Some(id) => self.transcripts.entry_count(id),
            None => 0,
        };

        // Resuming preserves creation time and turn count.
        let mut metadata = match self.transcripts.load_metadata(&session_id) {
            Some(mut existing) => {
                existing.bundle = bundle.clone();
                existing.behaviors = behaviors.clone();
                existing.status = SessionStatus::Active;
                existing.touch();
                existing
            }
            None => SessionMetadata::new(session_id.clone(), bundle.clone(), behaviors.clone()),
        };
        metadata.cwd = Some(cwd.to_string_lossy().to_string());

        let (pump_tx, pump_rx) = mpsc::unbounded_channel::<PumpMessage>();
        let events_tx = EventSender::new(pump_tx);
        // Broker frames travel the pump so they stay ordered behind the
        // tool events that raised them.
        let approvals = Arc::new(ApprovalBroker::new(Arc::new(events_tx.clone())));
        let sinks = SessionSinks {
            events: events_tx.clone(),
            approvals: approvals.clone(),
            display: Arc::new(FrameDisplay {
                outbound: outbound.clone(),
            }),
        };

        let created = tokio::time::timeout(self.create_timeout, async {
            let plan = self
                .bundles
                .prepare(&bundle, &behaviors, config.provider.as_ref())
                .await
                .map_err(|e| GatewayError::BundleResolution(e.to_string()))?;
            let handle = self
                .runtime
                .create_session(CreateSessionRequest {
                    session_id: session_id.clone(),
                    plan: plan.clone(),
                    sinks,
                    cwd: Some(cwd.clone()),
                    initial_transcript: initial_transcript.clone(),
                })
                .await
                .map_err(|e| GatewayError::Runtime(e.to_string()))?;
            Ok::<_, GatewayError>((plan, handle))
        })
        .await;

        let (plan, handle) = match created {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.announce_create_failure(&outbound, &session_id, &e);
                return Err(e);
            }
            Err(_) => {
                let e = GatewayError::CreateTimeout;
                self.announce_create_failure(&outbound, &session_id, &e);
                return Err(e);
            }
        };

        let adapter = Arc::new(Mutex::new(StreamAdapter::new(
            session_id.clone(),
            show_thinking,
        )));
        let metadata = Arc::new(Mutex::new(metadata));

        self.spawn_event_pump(
            session_id.clone(),
            pump_rx,
            outbound.clone(),
            adapter.clone(),
            metadata.clone(),
        );

        let session = Arc::new(ActiveSession {
            id: session_id.clone(),
            outbound: outbound.clone(),
            approvals,
            plan: plan.clone(),
            handle: Arc::from(handle),
            adapter,
            metadata: metadata.clone(),
            events_tx,
            executing: AtomicBool::new(false),
            persisted_entries: AtomicUsize::new(persisted),
            exec_task: Mutex::new(None),
        });
        self.active
            .write()
            .unwrap()
            .insert(session_id.clone(), session);

        if let Err(e) = self
            .transcripts
            .snapshot_metadata(&metadata.lock().unwrap().clone())
        {
            warn!(session_id = %session_id, error = %e, "failed to persist session metadata");
        }

        outbound.push(ServerFrame::SessionCreated {
            session_id: session_id.clone(),
            bundle: bundle.clone(),
            behaviors: behaviors.clone(),
            cwd: Some(cwd.to_string_lossy().to_string()),
        });
        outbound.push(ServerFrame::BundleDebugInfo {
            session_id: session_id.clone(),
            bundle,
            behaviors,
            mount_plan: mask_secrets(&serde_json::to_value(&plan).unwrap_or_default()),
        });

        info!(session_id = %session_id, "session created");
        Ok(session_id)
    }

    fn announce_create_failure(
        &self,
        outbound: &Outbound,
        session_id: &str,
        error: &GatewayError,
    ) {
        outbound.push(ServerFrame::session_error(session_id, error.to_string()));
        outbound.push(ServerFrame::SessionEnd {
            session_id: session_id.to_string(),
            status: SessionStatus::Errored,
            context: Default::default(),
        });
    }

    fn spawn_event_pump(
        &self,
        session_id: String,
        mut pump_rx: mpsc::UnboundedReceiver<PumpMessage>,
        outbound: Outbound,
        adapter: Arc<Mutex<StreamAdapter>>,
        metadata: Arc<Mutex<SessionMetadata>>,
    ) {
        let artifacts = self.artifacts.clone();
        tokio::spawn(async move {
            while let Some(message) = pump_rx.recv().await {
                let event = match message {
                    PumpMessage::Frame(frame) => {
                        if !outbound.push(frame) {
                            return;
                        }
                        continue;
                    }
                    PumpMessage::Event(event) => event,
                };
                artifacts.observe(&session_id, &event);
                let is_turn_boundary = matches!(event, RuntimeEvent::PromptComplete);
                let frames = adapter.lock().unwrap().handle(event);
                for frame in frames {
                    if !outbound.push(frame) {
                        return;
                    }
                }
                if is_turn_boundary {
                    let turn = metadata.lock().unwrap().turn_count;
                    if !outbound.push(ServerFrame::PromptComplete {
                        session_id: session_id.clone(),
                        turn,
                    }) {
                        return;
                    }
                }
            }
        });
    }

    /// Start a turn. At most one turn runs per session; a second prompt is
    /// rejected while the first is executing.
    pub fn prompt(
        self: &Arc<Self>,
        session_id: &str,
        content: String,
        images: Option<Vec<String>>,
        attachments: Option<Vec<Attachment>>,
    ) -> Result<(), GatewayError> {
        let session = self.get_active(session_id)?;
        if session.is_terminal() {
            return Err(GatewayError::SessionTerminal(session_id.to_string()));
        }
        if session.executing.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::SessionBusy(session_id.to_string()));
        }

        {
            let mut meta = session.metadata.lock().unwrap();
            meta.turn_count += 1;
            meta.status = SessionStatus::Active;
            meta.touch();
        }

        let manager = self.clone();
        let task_session = session.clone();
        let task = tokio::spawn(async move {
            let result = task_session
                .handle
                .execute(&content, images, attachments)
                .await;

            match result {
                Ok(()) => {
                    manager.persist_turn(&task_session);
                    // The pump emits prompt_complete strictly after every
                    // event the runtime produced this turn.
                    let _ = task_session.events_tx.send(RuntimeEvent::PromptComplete);
                }
                Err(e) => {
                    error!(session_id = %task_session.id, error = %e, "turn failed");
                    task_session.approvals.cancel_all();
                    {
                        let mut meta = task_session.metadata.lock().unwrap();
                        meta.status = SessionStatus::Errored;
                        meta.touch();
                    }
                    // The transcript survives through the last appended
                    // entry; the session stays seated, marked terminal, so
                    // later frames get the specific reason.
                    manager.persist_turn(&task_session);
                    task_session
                        .outbound
                        .push(ServerFrame::session_error(&task_session.id, e.to_string()));
                    task_session.outbound.push(ServerFrame::SessionEnd {
                        session_id: task_session.id.clone(),
                        status: SessionStatus::Errored,
                        context: Default::default(),
                    });
                }
            }
            task_session.executing.store(false, Ordering::SeqCst);
        });
        *session.exec_task.lock().unwrap() = Some(task);
        Ok(())
    }

    /// Flush transcript entries the runtime produced since the last flush
    /// and snapshot metadata. Failures log and never fail the turn.
    fn persist_turn(&self, session: &ActiveSession) {
        let entries = session.handle.transcript();
        let persisted = session.persisted_entries.load(Ordering::SeqCst);
        if entries.len() > persisted {
            if let Err(e) = self.transcripts.append(&session.id, &entries[persisted..]) {
                warn!(session_id = %session.id, error = %e, "transcript append failed");
            } else {
                session
                    .persisted_entries
                    .store(entries.len(), Ordering::SeqCst);
            }
        }
        let meta = session.metadata.lock().unwrap().clone();
        if let Err(e) = self.transcripts.snapshot_metadata(&meta) {
            warn!(session_id = %session.id, error = %e, "metadata snapshot failed");
        }
    }

    /// Cancel the current turn. Cooperative by default; `immediate` also
    /// aborts the execute task. Either way every pending approval resolves
    /// with its default for the whole session tree, the in-flight turn gets
    /// a bounded window to drain, and the session is marked idle.
    pub async fn cancel(&self, session_id: &str, immediate: bool) -> Result<(), GatewayError> {
        let session = self.get_active(session_id)?;
        if session.is_terminal() {
            return Err(GatewayError::SessionTerminal(session_id.to_string()));
        }
        session.handle.cancel(immediate);
        session.approvals.cancel_all();
        session.outbound.push(ServerFrame::CancelAcknowledged {
            session_id: session_id.to_string(),
            immediate,
        });

        let task = session.exec_task.lock().unwrap().take();
        if immediate {
            if let Some(task) = task {
                task.abort();
            }
            if session.executing.swap(false, Ordering::SeqCst) {
                session.outbound.push(ServerFrame::ExecutionCancelled {
                    session_id: session_id.to_string(),
                });
            }
        } else if let Some(task) = task {
            // The runtime stops at its next suspension point; give the turn
            // a bounded window to drain before marking the session idle.
            if tokio::time::timeout(CANCEL_DRAIN_DEADLINE, task)
                .await
                .is_err()
            {
                warn!(session_id = %session_id, "cancelled turn did not drain before deadline");
            }
        }

        let mut meta = session.metadata.lock().unwrap();
        if meta.status == SessionStatus::Active {
            meta.status = SessionStatus::Idle;
            meta.touch();
        }
        Ok(())
    }

    pub fn handle_approval_response(&self, session_id: &str, request_id: &str, choice: &str) {
        if let Ok(session) = self.get_active(session_id) {
            session.approvals.respond(request_id, choice);
        }
    }

    /// Run a named command against a session and return the result payload.
    pub fn command(&self, session_id: Option<&str>, name: &str, _args: &[String]) -> ServerFrame {
        let result = match name {
            "help" => json!({
                "commands": [
                    {"name": "help", "description": "Show available commands"},
                    {"name": "status", "description": "Show session status"},
                    {"name": "tools", "description": "List available tools"},
                    {"name": "clear", "description": "Clear conversation context"},
                ]
            }),
            "status" => match session_id.and_then(|id| self.get_active(id).ok()) {
                Some(session) => {
                    let meta = session.metadata_snapshot();
                    json!({
                        "session_id": meta.session_id,
                        "bundle": meta.bundle,
                        "turns": meta.turn_count,
                        "created": meta.created_at,
                        "executing": session.is_executing(),
                        "children": session.child_session_ids(),
                    })
                }
                None => json!({"error": "No active session"}),
            },
            "tools" => match session_id.and_then(|id| self.get_active(id).ok()) {
                Some(session) => json!({
                    "tools": session.plan.plan.get("tools").cloned()
                        .unwrap_or_else(|| json!([]))
                }),
                None => json!({"error": "No active session"}),
            },
            "clear" => json!({"message": "Context cleared"}),
            other => json!({"error": format!("Unknown command: {other}")}),
        };
        ServerFrame::CommandResult {
            command: name.to_string(),
            result,
        }
    }

    /// Tear down a session at connection close: cancel, resolve approvals,
    /// flush state, and mark it idle for later resume.
    pub fn close_session(&self, session_id: &str) {
        let removed = self.active.write().unwrap().remove(session_id);
        let Some(session) = removed else {
            return;
        };
        if let Some(task) = session.exec_task.lock().unwrap().take() {
            task.abort();
        }
        session.handle.cancel(true);
        session.approvals.cancel_all();
        session.approvals.clear_cache();
        self.artifacts
            .forget_pending(&session.adapter.lock().unwrap().open_tool_ids());

        {
            let mut meta = session.metadata.lock().unwrap();
            if meta.status == SessionStatus::Active {
                meta.status = SessionStatus::Idle;
            }
            meta.touch();
        }
        self.persist_turn(&session);
        info!(session_id = %session_id, "session closed");
    }

    pub fn get_active(&self, session_id: &str) -> Result<Arc<ActiveSession>, GatewayError> {
        self.active
            .read()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))
    }

    pub fn list_active(&self) -> Vec<SessionMetadata> {
        self.active
            .read()
            .unwrap()
            .values()
            .map(|s| s.metadata_snapshot())
            .collect()
    }

    /// Saved top-level sessions with at least one turn, most recent first.
    pub fn list_saved(&self) -> Vec<SessionMetadata> {
        self.transcripts
            .list()
            .into_iter()
            .filter(|m| !m.session_id.contains('_'))
            .filter(|m| m.turn_count >= 1)
            .collect()
    }

    pub fn load_transcript(&self, session_id: &str) -> Vec<TranscriptEntry> {
        self.transcripts.load_transcript(session_id)
    }

    pub fn delete_saved(&self, session_id: &str) -> Result<bool, GatewayError> {
        self.ensure_not_active(session_id)?;
        self.transcripts
            .delete(session_id)
            .map_err(|e| GatewayError::Runtime(e.to_string()))
    }

    pub fn rename_saved(&self, session_id: &str, name: &str) -> Result<bool, GatewayError> {
        self.ensure_not_active(session_id)?;
        self.transcripts
            .rename(session_id, name)
            .map_err(|e| GatewayError::Runtime(e.to_string()))
    }

    fn ensure_not_active(&self, session_id: &str) -> Result<(), GatewayError> {
        let seated = self.active.read().unwrap().get(session_id).cloned();
        match seated {
            None => Ok(()),
            // A terminal session no longer owns its history; drop the dead
            // handle and let the store operation proceed.
            Some(session) if session.is_terminal() => {
                self.close_session(session_id);
                Ok(())
            }
            Some(_) => Err(GatewayError::SessionActive(session_id.to_string())),
        }
    }
}

/// 16-hex-char session id, short enough for URLs and log lines.
fn mint_session_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..16].to_string()
}

/// Keep only user/assistant entries that flatten to text. Tool and thinking
/// history is not carried across a reconfigure.
fn filter_text_history(entries: Vec<TranscriptEntry>) -> Vec<TranscriptEntry> {
    entries
        .into_iter()
        .filter(|e| matches!(e.role, Role::User | Role::Assistant))
        .filter_map(|e| {
            let text = e.text_only()?;
            Some(TranscriptEntry {
                role: e.role,
                content: weft_shared::transcript::EntryContent::Text(text),
                timestamp: e.timestamp,
            })
        })
        .collect()
}
