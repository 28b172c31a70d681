//! Path and URI validation.
//!
//! Working directories and `file://` registry URIs come from the browser and
//! must stay inside the user's own territory: under the home directory or a
//! short allow-list of scratch roots, never under system prefixes, and never
//! containing `..` once resolved.

use std::path::{Path, PathBuf};

/// Prefixes that are never valid targets for file URIs.
const DENIED_PREFIXES: &[&str] = &[
    "/etc", "/var", "/usr", "/bin", "/sbin", "/System", "/Library",
];

/// Scratch roots allowed in addition to the home directory.
const ALLOWED_SCRATCH_ROOTS: &[&str] = &["/tmp", "/private/tmp"];

/// Validate a session working directory. `None` falls back to home.
pub fn validate_session_cwd(cwd: Option<&str>) -> Result<PathBuf, String> {
    let home = dirs_next::home_dir().ok_or("cannot determine home directory")?;

    let raw = match cwd {
        None => return Ok(home),
        Some(c) => c,
    };

    if raw.contains("..") {
        return Err(format!("path contains denied pattern '..': {raw}"));
    }

    let expanded = expand_home(raw, &home);
    let resolved = expanded
        .canonicalize()
        .map_err(|e| format!("cannot resolve {}: {e}", expanded.display()))?;

    if !resolved.is_dir() {
        return Err(format!("not a directory: {}", resolved.display()));
    }

    if !is_contained(&resolved, &home) {
        return Err(format!(
            "working directory must be under {} or an allowed scratch root",
            home.display()
        ));
    }

    Ok(resolved)
}

/// Validate a `file://` URI for custom bundle/behavior registration and
/// return the resolved path. Validation is separate from registration so the
/// UI can probe URIs before committing them.
pub fn validate_file_uri(uri: &str) -> Result<PathBuf, String> {
    let raw = uri
        .strip_prefix("file://")
        .ok_or("URI must start with file://")?;
    if raw.is_empty() {
        return Err("empty file path".into());
    }

    let home = dirs_next::home_dir().ok_or("cannot determine home directory")?;
    let expanded = expand_home(raw, &home);

    let resolved = expanded
        .canonicalize()
        .map_err(|_| format!("path does not exist: {}", expanded.display()))?;

    let resolved_str = resolved.to_string_lossy();
    if resolved_str.contains("..") {
        return Err("path traversal not allowed".into());
    }

    for denied in DENIED_PREFIXES {
        if path_has_prefix(&resolved, Path::new(denied)) {
            return Err(format!("access to {denied} not allowed"));
        }
    }

    if !is_contained(&resolved, &home) {
        return Err("path must be under the home directory or an allowed scratch root".into());
    }

    Ok(resolved)
}

/// Check a registry URI scheme without touching the filesystem.
pub fn validate_uri_scheme(uri: &str) -> Result<(), String> {
    if uri.starts_with("file://") {
        return Ok(());
    }
    if let Some(rest) = uri.strip_prefix("git+") {
        if rest.starts_with("https://") {
            return Ok(());
        }
        return Err("git URL must use HTTPS".into());
    }
    Err("URI must start with 'git+https://' or 'file://'".into())
}

fn expand_home(raw: &str, home: &Path) -> PathBuf {
    if raw == "~" {
        home.to_path_buf()
    } else if let Some(rest) = raw.strip_prefix("~/") {
        home.join(rest)
    } else {
        PathBuf::from(raw)
    }
}

/// Containment test against home plus the scratch allow-list.
fn is_contained(path: &Path, home: &Path) -> bool {
    if path_has_prefix(path, home) {
        return true;
    }
    ALLOWED_SCRATCH_ROOTS
        .iter()
        .any(|root| path_has_prefix(path, Path::new(root)))
}

fn path_has_prefix(path: &Path, prefix: &Path) -> bool {
    path.starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cwd_none_falls_back_to_home() {
        let home = dirs_next::home_dir().unwrap();
        assert_eq!(validate_session_cwd(None).unwrap(), home);
    }

    #[test]
    fn cwd_rejects_traversal() {
        let err = validate_session_cwd(Some("/tmp/../etc")).unwrap_err();
        assert!(err.contains(".."));
    }

    #[test]
    fn cwd_rejects_missing_directory() {
        assert!(validate_session_cwd(Some("/tmp/weft-definitely-missing-dir")).is_err());
    }

    #[test]
    fn cwd_accepts_tmp_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = validate_session_cwd(Some(dir.path().to_str().unwrap())).unwrap();
        assert!(resolved.is_dir());
    }

    #[test]
    fn file_uri_requires_scheme() {
        assert!(validate_file_uri("/tmp/x").is_err());
        assert!(validate_file_uri("file://").is_err());
    }

    #[test]
    fn file_uri_rejects_denied_prefixes() {
        let err = validate_file_uri("file:///etc/passwd").unwrap_err();
        assert!(err.contains("/etc"), "{err}");
    }

    #[test]
    fn file_uri_accepts_existing_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.yaml");
        std::fs::write(&path, "name: test").unwrap();
        let uri = format!("file://{}", path.display());
        let resolved = validate_file_uri(&uri).unwrap();
        assert!(resolved.ends_with("bundle.yaml"));
    }

    #[test]
    fn uri_scheme_validation() {
        assert!(validate_uri_scheme("git+https://github.com/org/repo").is_ok());
        assert!(validate_uri_scheme("file:///tmp/x").is_ok());
        assert!(validate_uri_scheme("git+ssh://github.com/org/repo").is_err());
        assert!(validate_uri_scheme("http://example.com").is_err());
    }
}
