//! Per-session transcript persistence.
//!
//! Each session owns `web-sessions/<id>/` with a `metadata.json` snapshot
//! and an append-only `transcript.jsonl`. Lines are flushed at turn
//! boundaries; a crash can lose mid-stream entries but never leaves the log
//! unparseable (malformed trailing lines are skipped on load).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use weft_shared::frames::SessionStatus;
use weft_shared::transcript::{Role, TranscriptEntry};

use crate::config::write_json_atomic;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMetadata {
    pub session_id: String,
    pub bundle: String,
    #[serde(default)]
    pub behaviors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub turn_count: u32,
    pub created_at: String,
    pub updated_at: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
}

impl SessionMetadata {
    pub fn new(session_id: String, bundle: String, behaviors: Vec<String>) -> Self {
        let now = now_iso();
        Self {
            session_id,
            bundle,
            behaviors,
            name: None,
            turn_count: 0,
            created_at: now.clone(),
            updated_at: now,
            status: SessionStatus::Active,
            cwd: None,
            parent_session_id: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_iso();
    }
}

/// Seconds-precision UTC timestamp with `Z` suffix, stable for JSON sorting.
pub fn now_iso() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_epoch_secs(secs as i64)
}

fn format_epoch_secs(secs: i64) -> String {
    let dt = time::OffsetDateTime::from_unix_timestamp(secs)
        .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        dt.year(),
        u8::from(dt.month()),
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second()
    )
}

pub struct TranscriptStore {
    root: PathBuf,
}

impl TranscriptStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create {}", root.display()))?;
        Ok(Self { root })
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn transcript_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("transcript.jsonl")
    }

    fn metadata_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("metadata.json")
    }

    /// Ensure the session directory exists (first use creates it).
    pub fn open(&self, session_id: &str) -> Result<()> {
        std::fs::create_dir_all(self.session_dir(session_id))?;
        Ok(())
    }

    /// Append entries to the JSONL log, one object per line. Timestamps are
    /// stamped here if the runtime did not provide them.
    pub fn append(&self, session_id: &str, entries: &[TranscriptEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.open(session_id)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.transcript_path(session_id))?;
        for entry in entries {
            let mut entry = entry.clone();
            if entry.timestamp.is_none() {
                entry.timestamp = Some(now_iso());
            }
            let line = serde_json::to_string(&entry)?;
            writeln!(file, "{line}")?;
        }
        file.flush()?;
        Ok(())
    }

    /// Load the transcript, skipping blank and malformed lines (a partial
    /// trailing line after a crash must not poison the whole log).
    pub fn load_transcript(&self, session_id: &str) -> Vec<TranscriptEntry> {
        let content = match std::fs::read_to_string(self.transcript_path(session_id)) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Number of persisted entries, used to append only the tail of a turn.
    pub fn entry_count(&self, session_id: &str) -> usize {
        self.load_transcript(session_id).len()
    }

    pub fn snapshot_metadata(&self, meta: &SessionMetadata) -> Result<()> {
        self.open(&meta.session_id)?;
        write_json_atomic(&self.metadata_path(&meta.session_id), meta)
    }

    pub fn load_metadata(&self, session_id: &str) -> Option<SessionMetadata> {
        let content = std::fs::read_to_string(self.metadata_path(session_id)).ok()?;
        let mut meta: SessionMetadata = serde_json::from_str(&content).ok()?;

        // Metadata can go stale if the process died mid-turn; trust the
        // transcript for the turn count when it disagrees.
        let user_turns = self.count_user_turns(session_id);
        if user_turns > meta.turn_count {
            meta.turn_count = user_turns;
        }
        Some(meta)
    }

    fn count_user_turns(&self, session_id: &str) -> u32 {
        self.load_transcript(session_id)
            .iter()
            .filter(|e| e.role == Role::User)
            .count() as u32
    }

    /// Metadata summaries for every stored session, most recent first.
    pub fn list(&self) -> Vec<SessionMetadata> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };
        let mut sessions: Vec<SessionMetadata> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let id = e.file_name().to_string_lossy().to_string();
                self.load_metadata(&id)
            })
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    pub fn delete(&self, session_id: &str) -> Result<bool> {
        let dir = self.session_dir(session_id);
        if !dir.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to delete {}", dir.display()))?;
        Ok(true)
    }

    pub fn rename(&self, session_id: &str, name: &str) -> Result<bool> {
        let mut meta = match self.load_metadata(session_id) {
            Some(m) => m,
            None => return Ok(false),
        };
        meta.name = Some(name.to_string());
        meta.touch();
        self.snapshot_metadata(&meta)?;
        Ok(true)
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.metadata_path(session_id).exists() || self.transcript_path(session_id).exists()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
