//! Gateway configuration and on-disk state layout.
//!
//! All persistent state lives under a single state root (default `~/.weft`,
//! overridable with `WEFT_HOME`). The gateway never relies on ambient
//! process-wide state: everything it needs is carried in this struct and
//! handed to constructors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;

const DEFAULT_PORT: u16 = 8787;
const DEFAULT_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub state_root: PathBuf,
    pub listen_host: String,
    pub listen_port: u16,
    pub cors_origins: Vec<String>,
    /// Deadline for bundle resolution + runtime session construction.
    pub session_create_timeout: Duration,
    /// Close the socket after this long without any client frame.
    pub read_idle_timeout: Duration,
    /// The first frame must be `auth` within this window.
    pub auth_timeout: Duration,
    /// Largest before/after snapshot the artifact ledger will diff.
    pub artifact_diff_limit: usize,
}

impl GatewayConfig {
    pub fn load() -> Result<Self> {
        let state_root = if let Ok(home) = std::env::var("WEFT_HOME") {
            PathBuf::from(home)
        } else {
            let home = dirs_next::home_dir()
                .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
            home.join(".weft")
        };
        std::fs::create_dir_all(&state_root)?;

        let listen_host =
            std::env::var("WEFT_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let listen_port = std::env::var("WEFT_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        Ok(Self::at(state_root, listen_host, listen_port))
    }

    /// Build a config rooted at an explicit directory. Used by tests.
    pub fn at(state_root: PathBuf, listen_host: String, listen_port: u16) -> Self {
        Self {
            state_root,
            listen_host,
            listen_port,
            cors_origins: default_cors_origins(),
            session_create_timeout: Duration::from_secs(30),
            read_idle_timeout: Duration::from_secs(90),
            auth_timeout: Duration::from_secs(5),
            artifact_diff_limit: 256 * 1024,
        }
    }

    pub fn auth_file(&self) -> PathBuf {
        self.state_root.join("web-auth.json")
    }

    pub fn preferences_file(&self) -> PathBuf {
        self.state_root.join("web-preferences.json")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_root.join("web-sessions")
    }
}

/// Origins allowed to call the REST surface. Wildcards from the environment
/// are rejected in favor of the localhost defaults.
fn default_cors_origins() -> Vec<String> {
    if let Ok(raw) = std::env::var("WEFT_ALLOWED_ORIGINS") {
        let origins: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty() && *o != "*")
            .map(String::from)
            .collect();
        if !origins.is_empty() {
            return origins;
        }
        tracing::warn!("CORS wildcard rejected, using localhost defaults");
    }
    vec![
        "http://localhost:3000".to_string(),
        "http://localhost:5173".to_string(),
        "http://127.0.0.1:3000".to_string(),
        "http://127.0.0.1:5173".to_string(),
    ]
}

/// Atomic JSON write shared by the small stores (temp file + rename).
pub(crate) fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_layout_paths() {
        let config = GatewayConfig::at(PathBuf::from("/tmp/weft-test"), "127.0.0.1".into(), 0);
        assert_eq!(
            config.auth_file(),
            PathBuf::from("/tmp/weft-test/web-auth.json")
        );
        assert_eq!(
            config.sessions_dir(),
            PathBuf::from("/tmp/weft-test/web-sessions")
        );
    }

    #[test]
    fn atomic_write_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["a"], 1);
        assert!(!dir.path().join("out.json.tmp").exists());
    }
}
