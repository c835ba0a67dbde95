//! Project-root resolution and the on-disk location of each project's table.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// File name of the per-project session table.
pub const TABLE_FILE: &str = "sessions.json";

/// Nearest ancestor of `hint` (inclusive) containing a `.git` entry, or the
/// absolutized hint itself when there is none.
pub fn resolve_project_root(hint: &Path) -> PathBuf {
    let absolute = if hint.is_absolute() {
        hint.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(hint))
            .unwrap_or_else(|_| hint.to_path_buf())
    };
    let start = absolute.canonicalize().unwrap_or(absolute);

    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
        .unwrap_or(start)
}

/// Directory under `base` that holds the table for `project_root`:
/// `<last path component>-<first 12 hex digits of sha256(root)>`.
pub fn table_dir(base: &Path, project_root: &Path) -> PathBuf {
    let digest = Sha256::digest(project_root.to_string_lossy().as_bytes());
    let hash: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();

    let name: String = project_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let name = if name.is_empty() { "root".to_string() } else { name };

    base.join(format!("{name}-{hash}"))
}
