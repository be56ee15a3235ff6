//! OpenCode binary discovery.

use std::path::PathBuf;

use opengui_error::HostError;

pub(crate) const BINARY_NAME: &str = "opencode";
pub(crate) const BINARY_PATH_ENV: &str = "OPENCODE_PATH";

/// Resolve the server binary. Search order: explicit override, then the
/// `OPENCODE_PATH` environment variable, then `PATH`.
pub(crate) fn resolve_binary(override_path: Option<&PathBuf>) -> Result<PathBuf, HostError> {
    if let Some(path) = override_path {
        if path.exists() {
            return Ok(path.clone());
        }
        tracing::warn!(path = %path.display(), "configured opencode path does not exist, falling back");
    }

    if let Some(path) = std::env::var_os(BINARY_PATH_ENV).map(PathBuf::from) {
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(path = %path.display(), "{BINARY_PATH_ENV} does not exist, falling back");
    }

    find_in_path(BINARY_NAME).ok_or(HostError::BinaryNotFound)
}

fn find_in_path(binary_name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let candidate = path.join(binary_name);
        if candidate.exists() {
            return Some(candidate);
        }
        if cfg!(windows) {
            for ext in ["exe", "cmd", "bat"] {
                let candidate = path.join(format!("{binary_name}.{ext}"));
                if candidate.exists() {
                    return Some(candidate);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_override_wins_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opencode");
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();

        let resolved = resolve_binary(Some(&path)).unwrap();
        assert_eq!(resolved, path);
    }
}
