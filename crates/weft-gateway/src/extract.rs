//! Server-side document text extraction for `POST /api/extract`.
//!
//! Lets the browser attach documents as plain text in the prompt. Plain
//! text and markdown are decoded here; binary formats are reported as
//! unsupported rather than guessed at.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct ExtractRequest {
    pub filename: String,
    /// Base64-encoded file content.
    pub content: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ExtractResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl ExtractResult {
    fn error(message: impl Into<String>) -> Self {
        Self {
            text: None,
            error: Some(message.into()),
            warning: None,
        }
    }
}

pub fn extract_text(filename: &str, content_b64: &str) -> ExtractResult {
    if content_b64.is_empty() {
        return ExtractResult::error("No content provided");
    }

    let bytes = match STANDARD.decode(content_b64) {
        Ok(b) => b,
        Err(e) => return ExtractResult::error(format!("Invalid base64 content: {e}")),
    };

    let lower = filename.to_lowercase();
    if lower.ends_with(".txt") || lower.ends_with(".md") || lower.ends_with(".markdown") {
        let text = String::from_utf8_lossy(&bytes).to_string();
        let warning = if text.trim().is_empty() {
            Some("File contains no text".to_string())
        } else {
            None
        };
        ExtractResult {
            text: Some(text),
            error: None,
            warning,
        }
    } else if lower.ends_with(".pdf") || lower.ends_with(".docx") {
        ExtractResult::error(format!(
            "Extraction for this format is not available: {filename}"
        ))
    } else {
        ExtractResult::error(format!("Unsupported file type: {filename}"))
    }
}
