//! Cleanup of the tool's own on-disk session files.
//!
//! The tool keeps one rollout file per session somewhere under
//! `$CODEX_HOME/sessions/<yyyy>/<mm>/<dd>/`, named `rollout-<ts>-<id>.jsonl`.
//! Removing a tracking record never touches those; this is the explicit,
//! opt-in path for discarding them as well.

use std::io;
use std::path::{Path, PathBuf};

use relay_core::SessionId;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Delete every rollout file for `id` under `codex_home/sessions`.
/// Returns the paths that were removed; a missing sessions directory is not
/// an error.
pub fn discard_tool_session(codex_home: &Path, id: &SessionId) -> io::Result<Vec<PathBuf>> {
    let raw = id.as_str();
    if raw.is_empty() || raw.contains(['/', '\\']) || raw.contains("..") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to match session id {raw:?}"),
        ));
    }

    let root = codex_home.join("sessions");
    if !root.is_dir() {
        debug!(path = %root.display(), "no tool sessions directory");
        return Ok(Vec::new());
    }

    let suffix = format!("{raw}.jsonl");
    let mut removed = Vec::new();
    for entry in WalkDir::new(&root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let matches = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.ends_with(&suffix));
        if !matches {
            continue;
        }
        std::fs::remove_file(entry.path())?;
        debug!(path = %entry.path().display(), "discarded tool session file");
        removed.push(entry.into_path());
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "{}\n").unwrap();
    }

    #[test]
    fn removes_matching_rollouts_only() {
        let home = tempfile::tempdir().unwrap();
        let day = home.path().join("sessions/2025/01/02");
        let target = day.join("rollout-2025-01-02T10-00-00-abc123.jsonl");
        let other = day.join("rollout-2025-01-02T11-00-00-def456.jsonl");
        touch(&target);
        touch(&other);

        let removed = discard_tool_session(home.path(), &SessionId::from_raw("abc123")).unwrap();
        assert_eq!(removed, vec![target.clone()]);
        assert!(!target.exists());
        assert!(other.exists());
    }

    #[test]
    fn missing_sessions_dir_is_empty() {
        let home = tempfile::tempdir().unwrap();
        let removed = discard_tool_session(home.path(), &SessionId::from_raw("abc")).unwrap();
        assert!(removed.is_empty());
    }

    #[test]
    fn rejects_path_like_ids() {
        let home = tempfile::tempdir().unwrap();
        for bad in ["", "../x", "a/b"] {
            let err = discard_tool_session(home.path(), &SessionId::from_raw(bad)).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        }
    }
}
