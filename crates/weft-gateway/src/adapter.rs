//! Streaming adapter: turns the runtime's event stream into client frames.
//!
//! The runtime identifies streaming blocks by `(session, server_index)`
//! where the server index resets at every model response. The adapter
//! remaps those onto dense local indices and stamps every block and tool
//! call with a session-scoped monotone `order`, so the client can render a
//! single chronological timeline across interleaved content, tool calls,
//! and nested child sessions.
//!
//! Driven serially by the session's event pump task; no internal locking.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};
use weft_shared::events::{BlockKind, EventScope, RuntimeEvent, ToolStatus};
use weft_shared::frames::{NestedContext, ServerFrame, SessionStatus};

/// Index-remapping state for one streaming lane (the main session or one
/// child session).
#[derive(Debug, Default)]
struct Lane {
    /// server_index -> (local_index, block kind). Cleared at each response
    /// boundary; the dense local allocation below survives.
    block_map: HashMap<u64, (u64, BlockKind)>,
    next_local_index: u64,
    order_counter: u64,
    /// Local index of the open thinking block, if any.
    open_thinking: Option<u64>,
}

impl Lane {
    fn allocate(&mut self, kind: BlockKind, server_index: u64) -> (u64, u64) {
        let local = self.next_local_index;
        self.next_local_index += 1;
        let order = self.order_counter;
        self.order_counter += 1;
        self.block_map.insert(server_index, (local, kind));
        (local, order)
    }

    fn next_order(&mut self) -> u64 {
        let order = self.order_counter;
        self.order_counter += 1;
        order
    }

    /// The runtime restarts server indices after each tool round.
    fn end_response_phase(&mut self) {
        self.block_map.clear();
    }

    /// A prompt boundary also restarts the dense local allocation.
    fn end_turn(&mut self) {
        self.block_map.clear();
        self.next_local_index = 0;
        self.open_thinking = None;
    }
}

#[derive(Debug)]
struct ToolCallState {
    status: ToolStatus,
    order: u64,
    child_session_id: Option<String>,
}

/// Per-session translation state. One instance per top-level session.
pub struct StreamAdapter {
    session_id: String,
    show_thinking: bool,
    main: Lane,
    tools: HashMap<String, ToolCallState>,
    /// Delegation tool calls awaiting a `session_fork`, oldest first.
    pending_delegations: VecDeque<String>,
    /// Forks that arrived before their `tool_call`, oldest first.
    unbound_forks: VecDeque<String>,
    /// child session id -> owning parent tool call id.
    child_to_parent: HashMap<String, String>,
    /// parent tool call id -> child lane.
    children: HashMap<String, Lane>,
}

impl StreamAdapter {
    pub fn new(session_id: impl Into<String>, show_thinking: bool) -> Self {
        Self {
            session_id: session_id.into(),
            show_thinking,
            main: Lane::default(),
            tools: HashMap::new(),
            pending_delegations: VecDeque::new(),
            unbound_forks: VecDeque::new(),
            child_to_parent: HashMap::new(),
            children: HashMap::new(),
        }
    }

    /// Translate one runtime event into zero or more client frames.
    pub fn handle(&mut self, event: RuntimeEvent) -> Vec<ServerFrame> {
        match event {
            RuntimeEvent::ContentStart {
                index,
                block_type,
                scope,
            } => self.on_content_start(index, block_type, &scope),
            RuntimeEvent::ContentDelta {
                index,
                delta,
                scope,
            } => self.on_content_delta(index, delta, &scope),
            RuntimeEvent::ContentEnd {
                index,
                content,
                scope,
            } => self.on_content_end(index, content, &scope),
            RuntimeEvent::ThinkingDelta { delta, scope } => self.on_thinking_delta(delta, &scope),
            RuntimeEvent::ThinkingFinal { content, scope } => {
                self.on_thinking_final(content, &scope)
            }
            RuntimeEvent::ToolCall {
                id,
                tool_name,
                arguments,
                status,
                scope,
            } => self.on_tool_call(id, tool_name, arguments, status, &scope),
            RuntimeEvent::ToolResult {
                id,
                tool_name,
                output,
                success,
                error,
                scope,
            } => self.on_tool_result(id, tool_name, output, success, error, &scope),
            RuntimeEvent::SessionFork {
                child_session_id,
                parent_tool_call_id,
                agent,
            } => self.on_session_fork(child_session_id, parent_tool_call_id, agent),
            RuntimeEvent::SessionStart { scope } => vec![ServerFrame::SessionStart {
                session_id: self.session_id.clone(),
                context: self.context_for(&scope),
            }],
            RuntimeEvent::SessionEnd { scope } => {
                if scope.is_nested() {
                    vec![ServerFrame::SessionEnd {
                        session_id: self.session_id.clone(),
                        status: SessionStatus::Ended,
                        context: self.context_for(&scope),
                    }]
                } else {
                    // The top-level end frame is emitted by the session
                    // manager, which knows the terminal status.
                    Vec::new()
                }
            }
            RuntimeEvent::PromptComplete => {
                // The turn frame itself comes from the session manager with
                // the turn number; here we only reset per-turn state.
                self.main.end_turn();
                Vec::new()
            }
            RuntimeEvent::ContextCompaction { payload } => vec![ServerFrame::ContextCompaction {
                session_id: self.session_id.clone(),
                payload,
            }],
            RuntimeEvent::ProviderRequest { payload } => vec![ServerFrame::ProviderRequest {
                session_id: self.session_id.clone(),
                payload,
            }],
            RuntimeEvent::ProviderResponse { payload } => vec![ServerFrame::ProviderResponse {
                session_id: self.session_id.clone(),
                payload,
            }],
            RuntimeEvent::Raw { event, payload } => {
                debug!(event = %event, "passing through unhandled runtime event");
                vec![ServerFrame::Diagnostic {
                    session_id: self.session_id.clone(),
                    event,
                    payload,
                }]
            }
        }
    }

    fn on_content_start(
        &mut self,
        server_index: u64,
        kind: BlockKind,
        scope: &EventScope,
    ) -> Vec<ServerFrame> {
        if kind == BlockKind::Thinking && !self.show_thinking {
            return Vec::new();
        }
        let context = self.context_for(scope);
        let Some(lane) = self.lane_for(scope) else {
            return Vec::new();
        };
        let (local, order) = lane.allocate(kind, server_index);
        if kind == BlockKind::Thinking {
            lane.open_thinking = Some(local);
        }
        vec![ServerFrame::ContentStart {
            session_id: self.session_id.clone(),
            block_type: kind,
            index: local,
            order,
            context,
        }]
    }

    fn on_content_delta(
        &mut self,
        server_index: u64,
        delta: String,
        scope: &EventScope,
    ) -> Vec<ServerFrame> {
        let context = self.context_for(scope);
        let show_thinking = self.show_thinking;
        let Some(lane) = self.lane_for(scope) else {
            return Vec::new();
        };
        match lane.block_map.get(&server_index) {
            Some(&(local, kind)) => {
                if kind == BlockKind::Thinking && !show_thinking {
                    return Vec::new();
                }
                vec![ServerFrame::ContentDelta {
                    session_id: self.session_id.clone(),
                    index: local,
                    delta,
                    context,
                }]
            }
            None => {
                // Out-of-order delta with no preceding start: never
                // synthesize a block for it.
                debug!(server_index, "dropping delta without content_start");
                Vec::new()
            }
        }
    }

    fn on_content_end(
        &mut self,
        server_index: u64,
        content: String,
        scope: &EventScope,
    ) -> Vec<ServerFrame> {
        let context = self.context_for(scope);
        let show_thinking = self.show_thinking;
        let Some(lane) = self.lane_for(scope) else {
            return Vec::new();
        };
        match lane.block_map.get(&server_index) {
            Some(&(local, kind)) => {
                if lane.open_thinking == Some(local) {
                    lane.open_thinking = None;
                }
                if kind == BlockKind::Thinking && !show_thinking {
                    return Vec::new();
                }
                vec![ServerFrame::ContentEnd {
                    session_id: self.session_id.clone(),
                    index: local,
                    content,
                    context,
                }]
            }
            None => {
                debug!(server_index, "dropping content_end without content_start");
                Vec::new()
            }
        }
    }

    /// Thinking deltas update the most recent streaming thinking block; if
    /// none is open the start was implicit and a block is created here.
    fn on_thinking_delta(&mut self, delta: String, scope: &EventScope) -> Vec<ServerFrame> {
        if !self.show_thinking {
            return Vec::new();
        }
        let context = self.context_for(scope);
        let session_id = self.session_id.clone();
        let Some(lane) = self.lane_for(scope) else {
            return Vec::new();
        };
        let mut frames = Vec::new();
        let index = match lane.open_thinking {
            Some(index) => index,
            None => {
                let local = lane.next_local_index;
                lane.next_local_index += 1;
                let order = lane.next_order();
                lane.open_thinking = Some(local);
                frames.push(ServerFrame::ContentStart {
                    session_id: session_id.clone(),
                    block_type: BlockKind::Thinking,
                    index: local,
                    order,
                    context: context.clone(),
                });
                local
            }
        };
        frames.push(ServerFrame::ThinkingDelta {
            session_id,
            index,
            delta,
            context,
        });
        frames
    }

    fn on_thinking_final(&mut self, content: String, scope: &EventScope) -> Vec<ServerFrame> {
        if !self.show_thinking {
            return Vec::new();
        }
        let context = self.context_for(scope);
        let session_id = self.session_id.clone();
        let Some(lane) = self.lane_for(scope) else {
            return Vec::new();
        };
        let index = match lane.open_thinking.take() {
            Some(index) => index,
            None => {
                let local = lane.next_local_index;
                lane.next_local_index += 1;
                lane.next_order();
                local
            }
        };
        vec![ServerFrame::ThinkingFinal {
            session_id,
            index,
            content,
            context,
        }]
    }

    fn on_tool_call(
        &mut self,
        id: String,
        tool_name: String,
        arguments: serde_json::Value,
        status: ToolStatus,
        scope: &EventScope,
    ) -> Vec<ServerFrame> {
        let context = self.context_for(scope);
        let session_id = self.session_id.clone();

        // A repeated id is a status update (pending -> running); the order
        // assigned at the original call sticks.
        if let Some(existing) = self.tools.get_mut(&id) {
            if existing.status.is_terminal() {
                warn!(tool_id = %id, "ignoring tool_call after terminal state");
                return Vec::new();
            }
            existing.status = status;
            let order = existing.order;
            return vec![ServerFrame::ToolCall {
                session_id,
                id,
                tool_name,
                arguments,
                status,
                order,
                context,
            }];
        }

        let order = match self.lane_for(scope) {
            Some(lane) => lane.next_order(),
            None => return Vec::new(),
        };

        // A fork carrying an explicit parent id may have arrived first.
        let prebound_child = self
            .child_to_parent
            .iter()
            .find(|(_, parent)| parent.as_str() == id)
            .map(|(child, _)| child.clone());

        self.tools.insert(
            id.clone(),
            ToolCallState {
                status,
                order,
                child_session_id: prebound_child.clone(),
            },
        );

        let mut frames = vec![ServerFrame::ToolCall {
            session_id,
            id: id.clone(),
            tool_name: tool_name.clone(),
            arguments,
            status,
            order,
            context,
        }];

        // Delegation tools own the next fork. If a fork already arrived
        // (fork-before-tool_call ordering), bind it now.
        if scope.is_nested() || !RuntimeEvent::is_delegation_tool(&tool_name) || prebound_child.is_some()
        {
            return frames;
        }
        if let Some(child) = self.unbound_forks.pop_front() {
            frames.extend(self.bind_fork(child, id, None));
        } else {
            self.pending_delegations.push_back(id);
        }
        frames
    }

    fn on_tool_result(
        &mut self,
        id: String,
        tool_name: String,
        output: String,
        success: bool,
        error: Option<String>,
        scope: &EventScope,
    ) -> Vec<ServerFrame> {
        let context = self.context_for(scope);

        let terminal = if success {
            ToolStatus::Complete
        } else {
            ToolStatus::Error
        };
        if self
            .tools
            .get(&id)
            .is_some_and(|state| state.status.is_terminal())
        {
            warn!(tool_id = %id, "duplicate tool_result dropped");
            return Vec::new();
        }
        self.tools
            .entry(id.clone())
            .and_modify(|state| state.status = terminal)
            .or_insert(ToolCallState {
                status: terminal,
                order: 0,
                child_session_id: None,
            });

        // Server indices restart at 0 for the next model response; local
        // allocation keeps climbing within the turn.
        if let Some(lane) = self.lane_for(scope) {
            lane.end_response_phase();
        }

        // A delegation tool that never got its fork stops waiting for one.
        self.pending_delegations.retain(|t| t != &id);

        let mut frames = Vec::new();

        // Tearing down the owning tool call releases the child lane
        // atomically with the terminal transition.
        if let Some(child) = self
            .tools
            .get_mut(&id)
            .and_then(|state| state.child_session_id.take())
        {
            self.children.remove(&id);
            self.child_to_parent.remove(&child);
            frames.push(ServerFrame::SessionEnd {
                session_id: self.session_id.clone(),
                status: SessionStatus::Ended,
                context: NestedContext {
                    child_session_id: Some(child),
                    parent_tool_call_id: Some(id.clone()),
                    nesting_depth: Some(1),
                },
            });
        }

        frames.push(ServerFrame::ToolResult {
            session_id: self.session_id.clone(),
            id,
            tool_name,
            output,
            success,
            error,
            context,
        });
        frames
    }

    fn on_session_fork(
        &mut self,
        child_session_id: String,
        parent_tool_call_id: Option<String>,
        agent: Option<String>,
    ) -> Vec<ServerFrame> {
        match parent_tool_call_id {
            Some(parent) => self.bind_fork(child_session_id, parent, agent),
            // FIFO among siblings: the oldest unbound delegation call owns
            // this fork. If the tool_call has not arrived yet, park it.
            None => match self.pending_delegations.pop_front() {
                Some(parent) => self.bind_fork(child_session_id, parent, agent),
                None => {
                    debug!(child = %child_session_id, "fork before tool_call, parking");
                    self.unbound_forks.push_back(child_session_id);
                    Vec::new()
                }
            },
        }
    }

    fn bind_fork(
        &mut self,
        child_session_id: String,
        parent_tool_call_id: String,
        agent: Option<String>,
    ) -> Vec<ServerFrame> {
        self.child_to_parent
            .insert(child_session_id.clone(), parent_tool_call_id.clone());
        self.children
            .insert(parent_tool_call_id.clone(), Lane::default());
        if let Some(state) = self.tools.get_mut(&parent_tool_call_id) {
            state.child_session_id = Some(child_session_id.clone());
        }
        vec![ServerFrame::SessionFork {
            session_id: self.session_id.clone(),
            child_session_id,
            parent_tool_call_id: Some(parent_tool_call_id),
            agent,
        }]
    }

    /// Route an event to the main lane or the owning child lane.
    fn lane_for(&mut self, scope: &EventScope) -> Option<&mut Lane> {
        if !scope.is_nested() {
            return Some(&mut self.main);
        }
        let parent = match &scope.parent_tool_call_id {
            Some(p) => p.clone(),
            None => {
                let child = scope.child_session_id.as_deref()?;
                self.child_to_parent.get(child)?.clone()
            }
        };
        match self.children.get_mut(&parent) {
            Some(lane) => Some(lane),
            None => {
                debug!(parent_tool_call = %parent, "event for unbound child dropped");
                None
            }
        }
    }

    fn context_for(&self, scope: &EventScope) -> NestedContext {
        if !scope.is_nested() {
            return NestedContext::default();
        }
        let parent = scope.parent_tool_call_id.clone().or_else(|| {
            scope
                .child_session_id
                .as_deref()
                .and_then(|c| self.child_to_parent.get(c).cloned())
        });
        let child = scope.child_session_id.clone().or_else(|| {
            parent.as_deref().and_then(|p| {
                self.tools
                    .get(p)
                    .and_then(|state| state.child_session_id.clone())
            })
        });
        NestedContext {
            child_session_id: child,
            parent_tool_call_id: parent,
            nesting_depth: Some(scope.nesting_depth.max(1)),
        }
    }

    /// Tool ids that never reached a terminal state (for teardown).
    pub fn open_tool_ids(&self) -> Vec<String> {
        self.tools
            .iter()
            .filter(|(_, state)| !state.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Live child session ids, for status reporting.
    pub fn child_session_ids(&self) -> Vec<String> {
        self.child_to_parent.keys().cloned().collect()
    }
}
