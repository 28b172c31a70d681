//! User preferences and the custom bundle/behavior registry.
//!
//! One JSON file under the state root. Single-user model: whoever runs the
//! gateway owns the whole file, so a process-wide mutex around load/save is
//! all the locking this needs.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::write_json_atomic;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Preferences {
    pub default_bundle: String,
    pub default_behaviors: Vec<String>,
    pub show_thinking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_cwd: Option<String>,
    #[serde(default)]
    pub custom_bundles: Vec<CustomEntry>,
    #[serde(default)]
    pub custom_behaviors: Vec<CustomEntry>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            default_bundle: "foundation".to_string(),
            default_behaviors: vec!["sessions".to_string()],
            show_thinking: true,
            default_cwd: None,
            custom_bundles: Vec::new(),
            custom_behaviors: Vec::new(),
        }
    }
}

/// A user-registered bundle or behavior, addressed by URI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomEntry {
    pub uri: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    Bundle,
    Behavior,
}

pub struct PreferenceStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PreferenceStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Load preferences, falling back to defaults on a missing or corrupt
    /// file (a bad preferences file should never brick the gateway).
    pub fn load(&self) -> Preferences {
        let _guard = self.lock.lock().unwrap();
        self.read_unlocked()
    }

    pub fn save(&self, prefs: &Preferences) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        write_json_atomic(&self.path, prefs)
    }

    /// Apply partial updates; `None` fields are left untouched.
    pub fn update(&self, updates: PreferencesUpdate) -> Result<Preferences> {
        let _guard = self.lock.lock().unwrap();
        let mut prefs = self.read_unlocked();
        if let Some(bundle) = updates.default_bundle {
            prefs.default_bundle = bundle;
        }
        if let Some(behaviors) = updates.default_behaviors {
            prefs.default_behaviors = behaviors;
        }
        if let Some(show) = updates.show_thinking {
            prefs.show_thinking = show;
        }
        if let Some(cwd) = updates.default_cwd {
            prefs.default_cwd = cwd;
        }
        write_json_atomic(&self.path, &prefs)?;
        Ok(prefs)
    }

    /// Register or update a custom entry, keyed by URI.
    pub fn add_custom(&self, kind: RegistryKind, entry: CustomEntry) -> Result<Preferences> {
        let _guard = self.lock.lock().unwrap();
        let mut prefs = self.read_unlocked();
        {
            let list = match kind {
                RegistryKind::Bundle => &mut prefs.custom_bundles,
                RegistryKind::Behavior => &mut prefs.custom_behaviors,
            };
            if let Some(existing) = list.iter_mut().find(|e| e.uri == entry.uri) {
                existing.name = entry.name;
                existing.description = entry.description;
            } else {
                list.push(entry);
            }
        }
        write_json_atomic(&self.path, &prefs)?;
        Ok(prefs)
    }

    /// Remove a custom entry by name. Returns false if nothing matched.
    pub fn remove_custom(&self, kind: RegistryKind, name: &str) -> Result<bool> {
        let _guard = self.lock.lock().unwrap();
        let mut prefs = self.read_unlocked();
        let list = match kind {
            RegistryKind::Bundle => &mut prefs.custom_bundles,
            RegistryKind::Behavior => &mut prefs.custom_behaviors,
        };
        let before = list.len();
        list.retain(|e| e.name != name);
        let removed = list.len() != before;
        if removed {
            write_json_atomic(&self.path, &prefs)?;
        }
        Ok(removed)
    }

    fn read_unlocked(&self) -> Preferences {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Preferences::default(),
        }
    }
}

/// Partial update payload for `PUT /api/preferences`.
#[derive(Debug, Default, Deserialize)]
pub struct PreferencesUpdate {
    pub default_bundle: Option<String>,
    pub default_behaviors: Option<Vec<String>>,
    pub show_thinking: Option<bool>,
    /// `Some(None)` clears the default working directory.
    #[serde(default, deserialize_with = "double_option::deserialize")]
    pub default_cwd: Option<Option<String>>,
}

/// Distinguishes "field absent" from "field set to null".
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Some(Option::<String>::deserialize(de)?))
    }
}
