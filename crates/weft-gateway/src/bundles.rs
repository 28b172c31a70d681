//! Bundle index: the app-layer view over the bundle collaborator.
//!
//! Lists built-in and user-registered bundles/behaviors, validates registry
//! URIs (scheme + path containment, then a load probe through the
//! collaborator), and keeps registration separate from validation so the UI
//! can probe a URI before committing it.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::preferences::{CustomEntry, PreferenceStore, RegistryKind};
use crate::runtime::{BundleDescription, BundleResolver};
use crate::security;

/// Bundles every install knows about.
const BUILTIN_BUNDLES: &[(&str, &str)] = &[
    ("foundation", "Core foundation bundle with tools and agents"),
    ("weft-dev", "Bundle for gateway ecosystem development"),
];

/// Behaviors every install knows about.
const BUILTIN_BEHAVIORS: &[(&str, &str)] = &[
    ("streaming-ui", "Real-time streaming display"),
    ("logging", "Event logging to JSONL"),
    ("redaction", "Secret and PII redaction"),
    ("progress-monitor", "Analysis paralysis detection"),
    ("todo-reminder", "Task list reminders"),
    ("sessions", "Session management and naming"),
];

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RegistryItem {
    pub name: String,
    pub description: String,
    pub is_custom: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_info: Option<BundleDescription>,
}

#[derive(Debug, Serialize)]
pub struct RegistrationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct BundleIndex {
    resolver: Arc<dyn BundleResolver>,
    preferences: Arc<PreferenceStore>,
}

impl BundleIndex {
    pub fn new(resolver: Arc<dyn BundleResolver>, preferences: Arc<PreferenceStore>) -> Self {
        Self {
            resolver,
            preferences,
        }
    }

    pub fn list(&self, kind: RegistryKind) -> Vec<RegistryItem> {
        let builtins = match kind {
            RegistryKind::Bundle => BUILTIN_BUNDLES,
            RegistryKind::Behavior => BUILTIN_BEHAVIORS,
        };
        let mut items: Vec<RegistryItem> = builtins
            .iter()
            .map(|(name, description)| RegistryItem {
                name: (*name).to_string(),
                description: (*description).to_string(),
                is_custom: false,
                uri: None,
            })
            .collect();

        let prefs = self.preferences.load();
        let customs = match kind {
            RegistryKind::Bundle => prefs.custom_bundles,
            RegistryKind::Behavior => prefs.custom_behaviors,
        };
        items.extend(customs.into_iter().map(|entry| RegistryItem {
            name: entry.name,
            description: entry.description,
            is_custom: true,
            uri: Some(entry.uri),
        }));
        items
    }

    pub async fn describe(&self, name: &str) -> anyhow::Result<BundleDescription> {
        self.resolver.describe(name).await
    }

    /// Validate a registry URI without registering it.
    pub async fn validate_uri(&self, uri: &str) -> ValidationResult {
        if let Err(error) = security::validate_uri_scheme(uri) {
            return ValidationResult {
                valid: false,
                uri: uri.to_string(),
                error: Some(error),
                bundle_info: None,
            };
        }

        if uri.starts_with("file://") {
            if let Err(error) = security::validate_file_uri(uri) {
                return ValidationResult {
                    valid: false,
                    uri: uri.to_string(),
                    error: Some(error),
                    bundle_info: None,
                };
            }
        }

        match self.resolver.describe(uri).await {
            Ok(info) => ValidationResult {
                valid: true,
                uri: uri.to_string(),
                error: None,
                bundle_info: Some(info),
            },
            Err(e) => ValidationResult {
                valid: false,
                uri: uri.to_string(),
                error: Some(format!("Failed to load bundle: {e}")),
                bundle_info: None,
            },
        }
    }

    /// Validate, then persist a custom entry in the registry.
    pub async fn register_custom(
        &self,
        kind: RegistryKind,
        uri: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> RegistrationResult {
        let validation = self.validate_uri(uri).await;
        if !validation.valid {
            return RegistrationResult {
                success: false,
                name: None,
                description: None,
                uri: None,
                error: validation.error,
            };
        }

        let info = validation.bundle_info.unwrap_or(BundleDescription {
            name: "custom".to_string(),
            version: String::new(),
            description: String::new(),
            tools: Vec::new(),
            providers: Vec::new(),
            agents: Vec::new(),
        });
        let final_name = name.map(String::from).unwrap_or_else(|| info.name.clone());
        let final_description = description
            .map(String::from)
            .unwrap_or_else(|| info.description.clone());

        let entry = CustomEntry {
            uri: uri.to_string(),
            name: final_name.clone(),
            description: final_description.clone(),
        };
        if let Err(e) = self.preferences.add_custom(kind, entry) {
            return RegistrationResult {
                success: false,
                name: None,
                description: None,
                uri: None,
                error: Some(e.to_string()),
            };
        }

        RegistrationResult {
            success: true,
            name: Some(final_name),
            description: Some(final_description),
            uri: Some(uri.to_string()),
            error: None,
        }
    }

    pub fn unregister_custom(&self, kind: RegistryKind, name: &str) -> RegistrationResult {
        match self.preferences.remove_custom(kind, name) {
            Ok(true) => RegistrationResult {
                success: true,
                name: Some(name.to_string()),
                description: None,
                uri: None,
                error: None,
            },
            Ok(false) => RegistrationResult {
                success: false,
                name: None,
                description: None,
                uri: None,
                error: Some(format!("'{name}' not found")),
            },
            Err(e) => RegistrationResult {
                success: false,
                name: None,
                description: None,
                uri: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn prepare(
        &self,
        bundle: &str,
        behaviors: &[String],
        provider_override: Option<&Value>,
    ) -> anyhow::Result<crate::runtime::MountPlan> {
        self.resolver.prepare(bundle, behaviors, provider_override).await
    }
}
