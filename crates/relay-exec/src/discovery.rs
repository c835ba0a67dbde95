use std::path::{Path, PathBuf};

use relay_core::RelayError;
use tracing::debug;

/// Resolve the tool executable. A bare name is looked up on `PATH`; anything
/// containing a separator is taken as a path and must exist.
pub fn locate_tool(program: &str) -> Result<PathBuf, RelayError> {
    let not_found = || RelayError::ToolNotFound {
        program: program.to_string(),
    };
    if program.is_empty() {
        return Err(not_found());
    }

    let candidate = Path::new(program);
    let resolved = if candidate.components().count() > 1 {
        candidate.is_file().then(|| candidate.to_path_buf())
    } else {
        which::which(program).ok()
    };

    match resolved {
        Some(path) => {
            debug!(program, path = %path.display(), "tool located");
            Ok(path)
        }
        None => Err(not_found()),
    }
}
