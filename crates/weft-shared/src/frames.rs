//! Framed WebSocket protocol between browser clients and the gateway.
//!
//! Client frames arrive as `{"type": "...", ...}`; server frames go out the
//! same way. Block-scoped and tool-scoped server frames optionally carry a
//! [`NestedContext`] so clients can route output belonging to delegated
//! child sessions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{BlockKind, ToolStatus};
use crate::transcript::TranscriptEntry;

/// Session configuration carried by `create_session`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behaviors: Option<Vec<String>>,
    /// Provider override record, passed through to the bundle collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_thinking: Option<bool>,
    /// Conversation history to restore (reconfigure-with-history).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_transcript: Option<Vec<TranscriptEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Adopt this session id and its stored transcript.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        token: String,
    },
    CreateSession {
        #[serde(default)]
        config: SessionConfig,
    },
    Prompt {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        images: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachments: Option<Vec<Attachment>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    ApprovalResponse {
        id: String,
        choice: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Cancel {
        #[serde(default)]
        immediate: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Command {
        name: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub filename: String,
    /// Base64-encoded file content.
    pub content: String,
}

/// Nested-session context attached to block- and tool-scoped frames.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NestedContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nesting_depth: Option<u32>,
}

impl NestedContext {
    pub fn is_top_level(&self) -> bool {
        self.child_session_id.is_none() && self.parent_tool_call_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Ended,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthSuccess,
    SessionCreated {
        session_id: String,
        bundle: String,
        behaviors: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    BundleDebugInfo {
        session_id: String,
        bundle: String,
        behaviors: Vec<String>,
        /// Mount plan with secret-looking fields masked.
        mount_plan: Value,
    },
    SessionStart {
        session_id: String,
        #[serde(flatten)]
        context: NestedContext,
    },
    SessionEnd {
        session_id: String,
        status: SessionStatus,
        #[serde(flatten)]
        context: NestedContext,
    },
    ContentStart {
        session_id: String,
        block_type: BlockKind,
        index: u64,
        order: u64,
        #[serde(flatten)]
        context: NestedContext,
    },
    ContentDelta {
        session_id: String,
        index: u64,
        delta: String,
        #[serde(flatten)]
        context: NestedContext,
    },
    ContentEnd {
        session_id: String,
        index: u64,
        content: String,
        #[serde(flatten)]
        context: NestedContext,
    },
    ThinkingDelta {
        session_id: String,
        index: u64,
        delta: String,
        #[serde(flatten)]
        context: NestedContext,
    },
    ThinkingFinal {
        session_id: String,
        index: u64,
        content: String,
        #[serde(flatten)]
        context: NestedContext,
    },
    ToolCall {
        session_id: String,
        id: String,
        tool_name: String,
        arguments: Value,
        status: ToolStatus,
        order: u64,
        #[serde(flatten)]
        context: NestedContext,
    },
    ToolResult {
        session_id: String,
        id: String,
        tool_name: String,
        output: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(flatten)]
        context: NestedContext,
    },
    ApprovalRequest {
        id: String,
        prompt: String,
        options: Vec<String>,
        /// Seconds until the default applies.
        timeout: u64,
        #[serde(rename = "default")]
        default_choice: String,
    },
    ApprovalTimeout {
        id: String,
        applied_default: String,
    },
    SessionFork {
        session_id: String,
        child_session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_tool_call_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
    },
    DisplayMessage {
        level: MessageLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(default)]
        nesting: u32,
    },
    PromptComplete {
        session_id: String,
        turn: u32,
    },
    CommandResult {
        command: String,
        result: Value,
    },
    ContextCompaction {
        session_id: String,
        #[serde(default)]
        payload: Value,
    },
    ProviderRequest {
        session_id: String,
        #[serde(default)]
        payload: Value,
    },
    ProviderResponse {
        session_id: String,
        #[serde(default)]
        payload: Value,
    },
    CancelAcknowledged {
        session_id: String,
        immediate: bool,
    },
    ExecutionCancelled {
        session_id: String,
    },
    /// Passthrough for runtime events with no dedicated frame.
    Diagnostic {
        session_id: String,
        event: String,
        #[serde(default)]
        payload: Value,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Pong,
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            error: message.into(),
            session_id: None,
        }
    }

    pub fn session_error(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            error: message.into(),
            session_id: Some(session_id.into()),
        }
    }
}
