//! Canonical event stream produced by the agent runtime.
//!
//! The runtime pushes these into the gateway's event sink; the streaming
//! adapter turns them into client frames. Events raised inside a delegated
//! child session are forwarded with an [`EventScope`] identifying the child
//! and the tool call that owns it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where an event originated. Default scope (all `None`, depth 0) means the
/// top-level session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub nesting_depth: u32,
}

fn is_zero(depth: &u32) -> bool {
    *depth == 0
}

impl EventScope {
    pub fn is_nested(&self) -> bool {
        self.parent_tool_call_id.is_some()
            || (self.child_session_id.is_some() && self.nesting_depth > 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Running,
    Complete,
    Error,
}

impl ToolStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ToolStatus::Complete | ToolStatus::Error)
    }
}

/// Events the runtime emits, tagged by name. `server_index` values reset per
/// model response; the adapter remaps them before anything reaches a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    ContentStart {
        index: u64,
        block_type: BlockKind,
        #[serde(flatten)]
        scope: EventScope,
    },
    ContentDelta {
        index: u64,
        delta: String,
        #[serde(flatten)]
        scope: EventScope,
    },
    ContentEnd {
        index: u64,
        content: String,
        #[serde(flatten)]
        scope: EventScope,
    },
    ThinkingDelta {
        delta: String,
        #[serde(flatten)]
        scope: EventScope,
    },
    ThinkingFinal {
        content: String,
        #[serde(flatten)]
        scope: EventScope,
    },
    ToolCall {
        id: String,
        tool_name: String,
        arguments: Value,
        status: ToolStatus,
        #[serde(flatten)]
        scope: EventScope,
    },
    ToolResult {
        id: String,
        tool_name: String,
        output: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(flatten)]
        scope: EventScope,
    },
    SessionFork {
        child_session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_tool_call_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
    },
    SessionStart {
        #[serde(flatten)]
        scope: EventScope,
    },
    SessionEnd {
        #[serde(flatten)]
        scope: EventScope,
    },
    PromptComplete,
    ContextCompaction {
        #[serde(default)]
        payload: Value,
    },
    ProviderRequest {
        #[serde(default)]
        payload: Value,
    },
    ProviderResponse {
        #[serde(default)]
        payload: Value,
    },
    /// Anything the runtime emits that the gateway has no dedicated handling
    /// for. Passed through to clients as a diagnostic frame.
    #[serde(untagged)]
    Raw {
        event: String,
        #[serde(default)]
        payload: Value,
    },
}

impl RuntimeEvent {
    /// Delegation tools spawn child sessions; the adapter binds the next
    /// `SessionFork` to the oldest unbound delegation call.
    pub fn is_delegation_tool(tool_name: &str) -> bool {
        matches!(tool_name, "task" | "spawn_agent" | "agent")
    }
}
