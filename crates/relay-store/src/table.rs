use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::time::SystemTime;

use relay_core::SessionId;
use tracing::warn;

use crate::error::StoreError;
use crate::record::SessionRecord;

pub(crate) type Table = BTreeMap<SessionId, SessionRecord>;

/// Identity of the on-disk table at the moment it was read or written,
/// used to notice rewrites by other processes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

pub(crate) async fn fingerprint(path: &Path) -> Option<Fingerprint> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some(Fingerprint {
        modified: meta.modified().ok(),
        len: meta.len(),
    })
}

/// Read the table. A missing file is an empty table; so is an unreadable or
/// corrupt one, which is logged and otherwise ignored.
pub(crate) async fn load(path: &Path) -> Table {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Table::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "session table unreadable, starting empty");
            return Table::new();
        }
    };

    match serde_json::from_slice::<Table>(&bytes) {
        Ok(table) => table,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "session table corrupt, starting empty");
            Table::new()
        }
    }
}

/// Write the table via a temp file in the same directory renamed over the
/// target, so readers only ever see a complete document.
pub(crate) async fn write_atomic(path: &Path, table: &Table) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(table)?;
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::Io(format!("no parent directory for {}", path.display())))?;
        std::fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| StoreError::Io(e.error.to_string()))?;
        Ok(())
    })
    .await
    .map_err(|e| StoreError::Io(format!("write task failed: {e}")))?
}
