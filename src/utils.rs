//! Utility functions for directory management
//!
//! This module provides helper functions following the XDG Base Directory specification
//! for portable configuration and state storage across Linux distributions.
//!
//! # Directory Structure
//!
//! - Config: `~/.config/portsync/` - `config.json`
//! - State: `~/.local/state/portsync/` - run log and run lock
//!
//! `PORTSYNC_STATE_DIR` overrides the state directory. When no home
//! directory can be determined (some service managers), state goes to
//! `/var/lib/portsync`.

use directories::ProjectDirs;
use std::path::PathBuf;

const SYSTEM_STATE_DIR: &str = "/var/lib/portsync";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "portsync", "portsync")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_state_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("PORTSYNC_STATE_DIR") {
        return PathBuf::from(dir);
    }
    project_dirs()
        .and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from(SYSTEM_STATE_DIR))
}

pub fn ensure_state_dir() -> std::io::Result<PathBuf> {
    use std::fs::DirBuilder;
    use std::os::unix::fs::DirBuilderExt;

    let dir = get_state_dir();
    DirBuilder::new()
        .mode(0o700) // User read/write/execute only
        .recursive(true)
        .create(&dir)?;
    Ok(dir)
}

/// Truncates a string to a maximum length and adds an ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        // Find the nearest character boundary to avoid splitting multi-byte characters
        let end = s
            .char_indices()
            .map(|(idx, _)| idx)
            .take_while(|&idx| idx <= max_len.saturating_sub(3))
            .last()
            .unwrap_or(0);
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("short", 10), "short");
        assert_eq!(truncate_string("a much longer message", 10), "a much ...");
        assert!(truncate_string("ünïcödé ünïcödé", 8).ends_with("..."));
    }

    #[test]
    fn test_state_dir_override() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var("PORTSYNC_STATE_DIR", "/tmp/portsync-state-test");
        }
        let dir = get_state_dir();
        unsafe {
            std::env::remove_var("PORTSYNC_STATE_DIR");
        }
        assert_eq!(dir, PathBuf::from("/tmp/portsync-state-test"));
    }
}
