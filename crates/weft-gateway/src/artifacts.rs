//! Artifact ledger: a file-change timeline derived from tool activity.
//!
//! The session event pump feeds every `tool_call`/`tool_result` through
//! [`ArtifactLedger::observe`]. File-mutating tools leave an entry with the
//! affected path, the before/after snapshots when available, and a unified
//! diff when both sides are textual and small enough. Diff failures degrade
//! to a bare path+operation record; nothing in here can fail a turn.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use similar::TextDiff;
use weft_shared::events::RuntimeEvent;

use crate::transcripts::now_iso;

/// Tools whose results can mutate files.
const FILE_TOOLS: &[&str] = &["write_file", "edit_file", "patch_file", "bash"];

/// Shell fragments that suggest a bash command wrote to a file.
const BASH_WRITE_MARKERS: &[&str] = &["cat >", "echo >", "tee ", "sed -i", "mv ", "rm "];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactOperation {
    Create,
    Edit,
    Delete,
    Bash,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactEntry {
    pub id: u64,
    pub session_id: String,
    pub file_path: String,
    pub operation: ArtifactOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    pub timestamp: String,
}

/// A tool call observed but not yet resolved.
#[derive(Debug, Clone)]
struct PendingFileOp {
    tool_name: String,
    arguments: Value,
    content_before: Option<String>,
}

struct LedgerInner {
    next_id: u64,
    entries: Vec<ArtifactEntry>,
    pending: HashMap<String, PendingFileOp>,
}

pub struct ArtifactLedger {
    inner: RwLock<LedgerInner>,
    diff_limit: usize,
}

impl ArtifactLedger {
    pub fn new(diff_limit: usize) -> Self {
        Self {
            inner: RwLock::new(LedgerInner {
                next_id: 1,
                entries: Vec::new(),
                pending: HashMap::new(),
            }),
            diff_limit,
        }
    }

    /// Observe a runtime event for a session. Only tool lifecycles matter;
    /// everything else is ignored.
    pub fn observe(&self, session_id: &str, event: &RuntimeEvent) {
        match event {
            RuntimeEvent::ToolCall {
                id,
                tool_name,
                arguments,
                ..
            } if FILE_TOOLS.contains(&tool_name.as_str()) => {
                let content_before = file_path_from_arguments(tool_name, arguments)
                    .and_then(|p| std::fs::read_to_string(Path::new(&p)).ok());
                let mut inner = self.inner.write().unwrap();
                inner.pending.insert(
                    id.clone(),
                    PendingFileOp {
                        tool_name: tool_name.clone(),
                        arguments: arguments.clone(),
                        content_before,
                    },
                );
            }
            RuntimeEvent::ToolResult {
                id, success, ..
            } => {
                let pending = {
                    let mut inner = self.inner.write().unwrap();
                    inner.pending.remove(id)
                };
                if let Some(op) = pending {
                    if *success {
                        self.record(session_id, op);
                    }
                }
            }
            _ => {}
        }
    }

    fn record(&self, session_id: &str, op: PendingFileOp) {
        let Some(resolved) = resolve_operation(&op) else {
            return;
        };

        let diff = match (&resolved.content_before, &resolved.content_after) {
            (Some(before), Some(after))
                if before.len() <= self.diff_limit && after.len() <= self.diff_limit =>
            {
                Some(unified_diff(before, after, &resolved.file_path))
            }
            (None, Some(after)) if after.len() <= self.diff_limit => {
                Some(unified_diff("", after, &resolved.file_path))
            }
            _ => None,
        };

        let mut inner = self.inner.write().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push(ArtifactEntry {
            id,
            session_id: session_id.to_string(),
            file_path: resolved.file_path,
            operation: resolved.operation,
            content_before: resolved.content_before,
            content_after: resolved.content_after,
            diff,
            timestamp: now_iso(),
        });
    }

    /// Entries for one session in insertion order.
    pub fn list(&self, session_id: &str) -> Vec<ArtifactEntry> {
        self.inner
            .read()
            .unwrap()
            .entries
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Drop per-session state when the session ends.
    pub fn forget_pending(&self, tool_ids: &[String]) {
        let mut inner = self.inner.write().unwrap();
        for id in tool_ids {
            inner.pending.remove(id);
        }
    }
}

struct ResolvedOp {
    file_path: String,
    operation: ArtifactOperation,
    content_before: Option<String>,
    content_after: Option<String>,
}

fn resolve_operation(op: &PendingFileOp) -> Option<ResolvedOp> {
    match op.tool_name.as_str() {
        "write_file" => {
            let file_path = string_arg(&op.arguments, "file_path")?;
            let content_after = string_arg(&op.arguments, "content");
            let operation = if op.content_before.is_none() {
                ArtifactOperation::Create
            } else {
                ArtifactOperation::Edit
            };
            Some(ResolvedOp {
                file_path,
                operation,
                content_before: op.content_before.clone(),
                content_after,
            })
        }
        "edit_file" | "patch_file" => {
            let file_path = string_arg(&op.arguments, "file_path")?;
            // Re-read after the edit for the full after-image; fall back to
            // the old/new fragments carried in the arguments.
            let content_after = std::fs::read_to_string(Path::new(&file_path))
                .ok()
                .or_else(|| string_arg(&op.arguments, "new_string"));
            let content_before = op
                .content_before
                .clone()
                .or_else(|| string_arg(&op.arguments, "old_string"));
            Some(ResolvedOp {
                file_path,
                operation: ArtifactOperation::Edit,
                content_before,
                content_after,
            })
        }
        "bash" => {
            let command = string_arg(&op.arguments, "command")?;
            if !BASH_WRITE_MARKERS.iter().any(|m| command.contains(m)) {
                return None;
            }
            let file_path = extract_path_from_command(&command)?;
            let operation = if command.trim_start().starts_with("rm ") {
                ArtifactOperation::Delete
            } else {
                ArtifactOperation::Bash
            };
            Some(ResolvedOp {
                file_path,
                operation,
                content_before: None,
                content_after: None,
            })
        }
        _ => None,
    }
}

fn string_arg(arguments: &Value, key: &str) -> Option<String> {
    arguments.get(key)?.as_str().map(String::from)
}

/// Extract the file path a tool call targets, mirroring the per-tool
/// argument shapes used in [`resolve_operation`].
fn file_path_from_arguments(tool_name: &str, arguments: &Value) -> Option<String> {
    match tool_name {
        "write_file" | "edit_file" | "patch_file" => string_arg(arguments, "file_path"),
        "bash" => {
            let command = string_arg(arguments, "command")?;
            extract_path_from_command(&command)
        }
        _ => None,
    }
}

/// First path-looking token in a shell command.
fn extract_path_from_command(command: &str) -> Option<String> {
    command
        .split_whitespace()
        .find(|part| part.contains('/') && !part.starts_with('-'))
        .map(String::from)
}

fn unified_diff(before: &str, after: &str, file_path: &str) -> String {
    TextDiff::from_lines(before, after)
        .unified_diff()
        .header(&format!("a/{file_path}"), &format!("b/{file_path}"))
        .to_string()
}
