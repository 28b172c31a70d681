//! Single-user bearer token.
//!
//! Priority: `WEFT_WEB_TOKEN` env > `web-auth.json` > freshly generated.
//! Generated tokens are 32 random bytes, base64url without padding, written
//! atomically with 0600 permissions so the token survives restarts.

use std::path::Path;

use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::write_json_atomic;

#[derive(Debug, Serialize, Deserialize)]
struct AuthFile {
    token: String,
}

#[derive(Debug, Clone)]
pub struct AuthToken {
    token: String,
    pub is_new: bool,
}

impl AuthToken {
    pub fn as_str(&self) -> &str {
        &self.token
    }

    /// Constant-time comparison against a presented token.
    pub fn verify(&self, presented: &str) -> bool {
        constant_time_eq(&self.token, presented)
    }
}

pub fn get_or_create_token(auth_file: &Path) -> Result<AuthToken> {
    if let Ok(env_token) = std::env::var("WEFT_WEB_TOKEN") {
        if !env_token.is_empty() {
            return Ok(AuthToken {
                token: env_token,
                is_new: false,
            });
        }
    }

    if let Some(token) = read_token_file(auth_file) {
        return Ok(AuthToken {
            token,
            is_new: false,
        });
    }

    let token = generate_secure_token();
    write_json_atomic(auth_file, &AuthFile {
        token: token.clone(),
    })?;
    restrict_permissions(auth_file);

    Ok(AuthToken {
        token,
        is_new: true,
    })
}

fn read_token_file(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let parsed: AuthFile = serde_json::from_str(&content).ok()?;
    if parsed.token.is_empty() {
        None
    } else {
        Some(parsed.token)
    }
}

/// Generate a 32-byte base64url token (~43 chars).
fn generate_secure_token() -> String {
    let mut bytes = [0u8; 32];
    getrandom::fill(&mut bytes).expect("failed to generate random bytes");
    URL_SAFE_NO_PAD.encode(bytes)
}

fn restrict_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// Constant-time comparison of two strings.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    a_bytes.len() == b_bytes.len() && a_bytes.ct_eq(b_bytes).unwrap_u8() == 1
}
