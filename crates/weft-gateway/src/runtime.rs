//! The agent-runtime collaborator contract.
//!
//! The gateway does not implement the runtime; it consumes one through
//! these traits. `prepare` turns a bundle reference into an opaque mount
//! plan, `create_session` instantiates a runtime session wired to the
//! gateway's sinks, and the returned handle drives turns.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use weft_shared::events::RuntimeEvent;
use weft_shared::frames::{MessageLevel, ServerFrame};
use weft_shared::transcript::TranscriptEntry;

use crate::approvals::FrameSink;

/// One message on a session's ordered pump: a runtime event, or a frame
/// injected into the same stream (approval requests, so they cannot
/// overtake the tool event that raised them).
#[derive(Debug)]
pub enum PumpMessage {
    Event(RuntimeEvent),
    Frame(ServerFrame),
}

/// The event sink handed to the runtime. Feeds the session's pump channel.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<PumpMessage>,
}

impl EventSender {
    pub fn new(tx: mpsc::UnboundedSender<PumpMessage>) -> Self {
        Self { tx }
    }

    /// Push a runtime event. Returns false once the session is torn down.
    pub fn send(&self, event: RuntimeEvent) -> bool {
        self.tx.send(PumpMessage::Event(event)).is_ok()
    }
}

impl FrameSink for EventSender {
    fn send_frame(&self, frame: ServerFrame) -> bool {
        self.tx.send(PumpMessage::Frame(frame)).is_ok()
    }
}

/// Opaque-ish structure the bundle collaborator returns and the runtime
/// consumes. The gateway only inspects it to build the debug frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountPlan {
    pub bundle: String,
    pub behaviors: Vec<String>,
    #[serde(default)]
    pub plan: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleDescription {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub agents: Vec<String>,
}

/// Resolves bundle references and composes behaviors into a mount plan.
#[async_trait]
pub trait BundleResolver: Send + Sync {
    async fn prepare(
        &self,
        bundle: &str,
        behaviors: &[String],
        provider_override: Option<&Value>,
    ) -> Result<MountPlan>;

    /// Describe a bundle reference without mounting it (used by the
    /// validate endpoints).
    async fn describe(&self, reference: &str) -> Result<BundleDescription>;
}

/// Receives approval requests raised by runtime tools.
#[async_trait]
pub trait ApprovalSink: Send + Sync {
    async fn request(
        &self,
        prompt: &str,
        options: &[String],
        timeout: Duration,
        default: &str,
    ) -> String;
}

/// Receives user-facing notifications from hooks and modules.
pub trait DisplaySink: Send + Sync {
    fn show(&self, level: MessageLevel, message: &str, source: Option<&str>);
}

/// Everything a runtime session needs to talk back to the gateway.
pub struct SessionSinks {
    pub events: EventSender,
    pub approvals: Arc<dyn ApprovalSink>,
    pub display: Arc<dyn DisplaySink>,
}

pub struct CreateSessionRequest {
    pub session_id: String,
    pub plan: MountPlan,
    pub sinks: SessionSinks,
    pub cwd: Option<std::path::PathBuf>,
    pub initial_transcript: Vec<TranscriptEntry>,
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn create_session(&self, request: CreateSessionRequest) -> Result<Box<dyn SessionHandle>>;
}

/// A live runtime session. `execute` drives the sinks until the turn
/// completes; `cancel` is cooperative unless `immediate`.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    async fn execute(
        &self,
        prompt: &str,
        images: Option<Vec<String>>,
        attachments: Option<Vec<weft_shared::frames::Attachment>>,
    ) -> Result<()>;

    fn cancel(&self, immediate: bool);

    /// Canonical transcript after the last completed turn.
    fn transcript(&self) -> Vec<TranscriptEntry>;
}

/// Recursively replace secret-looking values before anything reaches a
/// client. Keys are matched exactly, the way the runtime names them.
pub fn mask_secrets(value: &Value) -> Value {
    const SECRET_KEYS: &[&str] = &["api_key", "secret", "password", "token"];
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if SECRET_KEYS.contains(&k.as_str()) {
                        (k.clone(), Value::String("***".to_string()))
                    } else {
                        (k.clone(), mask_secrets(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(mask_secrets).collect()),
        other => other.clone(),
    }
}

pub mod echo {
    //! A placeholder runtime for running the gateway without a real agent.
    //! Echoes each prompt back as a single streamed text block. Development
    //! only; the binary wires it in when no other runtime is configured.

    use std::sync::Mutex;

    use weft_shared::events::BlockKind;
    use weft_shared::transcript::Role;

    use super::*;

    pub struct EchoResolver;

    #[async_trait]
    impl BundleResolver for EchoResolver {
        async fn prepare(
            &self,
            bundle: &str,
            behaviors: &[String],
            _provider_override: Option<&Value>,
        ) -> Result<MountPlan> {
            Ok(MountPlan {
                bundle: bundle.to_string(),
                behaviors: behaviors.to_vec(),
                plan: serde_json::json!({"modules": ["echo"]}),
            })
        }

        async fn describe(&self, reference: &str) -> Result<BundleDescription> {
            Ok(BundleDescription {
                name: reference.to_string(),
                version: "0.0.0".to_string(),
                description: "echo placeholder".to_string(),
                tools: Vec::new(),
                providers: Vec::new(),
                agents: Vec::new(),
            })
        }
    }

    pub struct EchoRuntime;

    #[async_trait]
    impl AgentRuntime for EchoRuntime {
        async fn create_session(
            &self,
            request: CreateSessionRequest,
        ) -> Result<Box<dyn SessionHandle>> {
            Ok(Box::new(EchoSession {
                events: request.sinks.events,
                transcript: Mutex::new(request.initial_transcript),
            }))
        }
    }

    struct EchoSession {
        events: EventSender,
        transcript: Mutex<Vec<TranscriptEntry>>,
    }

    #[async_trait]
    impl SessionHandle for EchoSession {
        async fn execute(
            &self,
            prompt: &str,
            _images: Option<Vec<String>>,
            _attachments: Option<Vec<weft_shared::frames::Attachment>>,
        ) -> Result<()> {
            let reply = format!("echo: {prompt}");
            self.events.send(RuntimeEvent::ContentStart {
                index: 0,
                block_type: BlockKind::Text,
                scope: Default::default(),
            });
            self.events.send(RuntimeEvent::ContentDelta {
                index: 0,
                delta: reply.clone(),
                scope: Default::default(),
            });
            self.events.send(RuntimeEvent::ContentEnd {
                index: 0,
                content: reply.clone(),
                scope: Default::default(),
            });

            let mut transcript = self.transcript.lock().unwrap();
            transcript.push(TranscriptEntry::text(Role::User, prompt));
            transcript.push(TranscriptEntry::text(Role::Assistant, reply));
            Ok(())
        }

        fn cancel(&self, _immediate: bool) {}

        fn transcript(&self) -> Vec<TranscriptEntry> {
            self.transcript.lock().unwrap().clone()
        }
    }
}
