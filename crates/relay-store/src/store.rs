//! Per-project session tracking.
//!
//! Each project root owns one JSON table on disk and one cached copy in
//! memory. Every mutation of a project runs under that project's async lock,
//! which is the write queue: concurrent callers line up, each applies its
//! change to the current table and persists it with an atomic rename before
//! the next one starts. The cache is refreshed whenever the file's
//! fingerprint no longer matches what this process last read or wrote.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use relay_core::SessionId;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::StoreError;
use crate::project::{resolve_project_root, table_dir, TABLE_FILE};
use crate::record::{SessionRecord, SessionStatus, SessionType};
use crate::table::{self, Fingerprint, Table};

#[derive(Default)]
struct CachedTable {
    loaded: bool,
    fingerprint: Option<Fingerprint>,
    sessions: Table,
}

struct ProjectScope {
    table_path: PathBuf,
    state: Mutex<CachedTable>,
}

impl ProjectScope {
    async fn refresh(&self, state: &mut CachedTable) {
        let current = table::fingerprint(&self.table_path).await;
        if state.loaded && current == state.fingerprint {
            return;
        }
        state.sessions = table::load(&self.table_path).await;
        state.fingerprint = current;
        state.loaded = true;
        debug!(path = %self.table_path.display(), sessions = state.sessions.len(), "session table loaded");
    }
}

/// Durable, per-project store of session tracking records.
pub struct SessionStore {
    base_dir: PathBuf,
    scopes: DashMap<PathBuf, Arc<ProjectScope>>,
}

impl SessionStore {
    /// `base_dir` holds one subdirectory per project root.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            scopes: DashMap::new(),
        }
    }

    /// Path of the table that `cwd` resolves to.
    pub fn table_path(&self, cwd: &Path) -> PathBuf {
        let root = resolve_project_root(cwd);
        table_dir(&self.base_dir, &root).join(TABLE_FILE)
    }

    fn scope(&self, cwd: &Path) -> Arc<ProjectScope> {
        let root = resolve_project_root(cwd);
        let scope = self.scopes.entry(root.clone()).or_insert_with(|| {
            Arc::new(ProjectScope {
                table_path: table_dir(&self.base_dir, &root).join(TABLE_FILE),
                state: Mutex::new(CachedTable::default()),
            })
        });
        Arc::clone(scope.value())
    }

    async fn read<T>(&self, cwd: &Path, f: impl FnOnce(&Table) -> T) -> T {
        let scope = self.scope(cwd);
        let mut state = scope.state.lock().await;
        scope.refresh(&mut state).await;
        f(&state.sessions)
    }

    /// Apply `f` to a copy of the table and persist it if anything changed.
    /// The cache only adopts the new table once it is on disk.
    async fn mutate<T>(
        &self,
        cwd: &Path,
        f: impl FnOnce(&mut Table) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let scope = self.scope(cwd);
        let mut state = scope.state.lock().await;
        scope.refresh(&mut state).await;

        let mut next = state.sessions.clone();
        let out = f(&mut next)?;
        if next != state.sessions {
            table::write_atomic(&scope.table_path, &next).await?;
            state.fingerprint = table::fingerprint(&scope.table_path).await;
            state.sessions = next;
        }
        Ok(out)
    }

    /// Insert or overwrite a record.
    #[instrument(skip(self, record), fields(session_id = %record.id))]
    pub async fn track(&self, cwd: &Path, record: SessionRecord) -> Result<(), StoreError> {
        self.mutate(cwd, |table| {
            table.insert(record.id.clone(), record);
            Ok(())
        })
        .await
    }

    pub async fn get(&self, cwd: &Path, id: &SessionId) -> Option<SessionRecord> {
        self.read(cwd, |table| table.get(id).cloned()).await
    }

    /// Set the status and refresh `last_resumed_at`, which doubles as the
    /// last-activity timestamp sweeps look at.
    #[instrument(skip(self, id), fields(session_id = %id))]
    pub async fn update_status(
        &self,
        cwd: &Path,
        id: &SessionId,
        status: SessionStatus,
    ) -> Result<SessionRecord, StoreError> {
        self.mutate(cwd, |table| {
            let record = table
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            record.status = status;
            record.last_resumed_at = Some(Utc::now());
            Ok(record.clone())
        })
        .await
    }

    #[instrument(skip(self, id), fields(session_id = %id))]
    pub async fn mark_resumed(&self, cwd: &Path, id: &SessionId) -> Result<SessionRecord, StoreError> {
        self.mutate(cwd, |table| {
            let record = table
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            record.last_resumed_at = Some(Utc::now());
            Ok(record.clone())
        })
        .await
    }

    /// Point each record's lineage at the other. Only records that exist are
    /// touched; returns how many were updated.
    #[instrument(skip(self, a, b), fields(a = %a, b = %b))]
    pub async fn link(&self, cwd: &Path, a: &SessionId, b: &SessionId) -> Result<usize, StoreError> {
        self.mutate(cwd, |table| {
            let mut linked = 0;
            if let Some(record) = table.get_mut(a) {
                record.linked_session_id = Some(b.clone());
                linked += 1;
            }
            if let Some(record) = table.get_mut(b) {
                record.linked_session_id = Some(a.clone());
                linked += 1;
            }
            Ok(linked)
        })
        .await
    }

    #[instrument(skip(self, id), fields(session_id = %id))]
    pub async fn remove(&self, cwd: &Path, id: &SessionId) -> Result<bool, StoreError> {
        self.mutate(cwd, |table| Ok(table.remove(id).is_some()))
            .await
    }

    /// Remove several records in one write; returns the ids that existed.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn remove_multiple(
        &self,
        cwd: &Path,
        ids: &[SessionId],
    ) -> Result<Vec<SessionId>, StoreError> {
        self.mutate(cwd, |table| {
            Ok(ids
                .iter()
                .filter(|id| table.remove(*id).is_some())
                .cloned()
                .collect())
        })
        .await
    }

    /// All records, newest first.
    pub async fn list_all(&self, cwd: &Path) -> Vec<SessionRecord> {
        self.list_where(cwd, |_| true).await
    }

    pub async fn list_by_type(&self, cwd: &Path, session_type: SessionType) -> Vec<SessionRecord> {
        self.list_where(cwd, |r| r.session_type == session_type).await
    }

    pub async fn list_active(&self, cwd: &Path) -> Vec<SessionRecord> {
        self.list_where(cwd, |r| r.status == SessionStatus::Active).await
    }

    async fn list_where(
        &self,
        cwd: &Path,
        keep: impl Fn(&SessionRecord) -> bool,
    ) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = self
            .read(cwd, |table| table.values().filter(|r| keep(*r)).cloned().collect())
            .await;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Drop tracking records whose last activity is older than
    /// `max_age_hours`. Only metadata is removed; the tool's own session
    /// files are left alone.
    #[instrument(skip(self))]
    pub async fn sweep(&self, cwd: &Path, max_age_hours: f64) -> Result<Vec<SessionId>, StoreError> {
        // An age past the representable range means nothing is old enough.
        let Some(cutoff) = sweep_cutoff(max_age_hours) else {
            debug!(max_age_hours, "sweep age out of range, nothing to remove");
            return Ok(Vec::new());
        };

        let removed = self
            .mutate(cwd, |table| {
                let stale: Vec<SessionId> = table
                    .values()
                    .filter(|r| r.last_activity() < cutoff)
                    .map(|r| r.id.clone())
                    .collect();
                for id in &stale {
                    table.remove(id);
                }
                Ok(stale)
            })
            .await?;

        if !removed.is_empty() {
            info!(removed = removed.len(), "swept stale session records");
        }
        Ok(removed)
    }
}

fn sweep_cutoff(max_age_hours: f64) -> Option<DateTime<Utc>> {
    if max_age_hours.is_nan() {
        return None;
    }
    let max_age = Duration::try_milliseconds((max_age_hours * 3_600_000.0) as i64)?;
    Utc::now().checked_sub_signed(max_age)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _home: tempfile::TempDir,
        project: tempfile::TempDir,
        store: SessionStore,
    }

    fn setup() -> Fixture {
        let home = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        std::fs::create_dir(project.path().join(".git")).unwrap();
        let store = SessionStore::new(home.path().join("sessions"));
        Fixture {
            _home: home,
            project,
            store,
        }
    }

    fn record(id: &str, session_type: SessionType) -> SessionRecord {
        SessionRecord::new(SessionId::from_raw(id), session_type)
    }

    fn aged(id: &str, hours: i64) -> SessionRecord {
        let mut r = record(id, SessionType::Exec);
        r.created_at = Utc::now() - Duration::hours(hours);
        r
    }

    #[tokio::test]
    async fn track_and_get_roundtrip() {
        let fx = setup();
        let cwd = fx.project.path();
        let mut original = record("s1", SessionType::Review);
        original.instruction = Some("review the diff".into());
        original.base_ref = Some("main".into());
        original.head_ref = Some("feature".into());

        fx.store.track(cwd, original.clone()).await.unwrap();
        assert_eq!(fx.store.get(cwd, &original.id).await.unwrap(), original);
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let fx = setup();
        assert!(fx.store.get(fx.project.path(), &SessionId::from_raw("nope")).await.is_none());
    }

    #[tokio::test]
    async fn persisted_across_store_instances() {
        let fx = setup();
        let cwd = fx.project.path();
        fx.store.track(cwd, record("s1", SessionType::Write)).await.unwrap();

        let reopened = SessionStore::new(fx._home.path().join("sessions"));
        assert!(reopened.get(cwd, &SessionId::from_raw("s1")).await.is_some());
    }

    #[tokio::test]
    async fn nested_dirs_share_project_table() {
        let fx = setup();
        let nested = fx.project.path().join("src");
        std::fs::create_dir(&nested).unwrap();

        fx.store.track(&nested, record("s1", SessionType::Write)).await.unwrap();
        assert!(fx.store.get(fx.project.path(), &SessionId::from_raw("s1")).await.is_some());
        assert_eq!(fx.store.table_path(&nested), fx.store.table_path(fx.project.path()));
    }

    #[tokio::test]
    async fn projects_do_not_share_state() {
        let fx = setup();
        let other = tempfile::tempdir().unwrap();
        std::fs::create_dir(other.path().join(".git")).unwrap();

        fx.store.track(fx.project.path(), record("s1", SessionType::Write)).await.unwrap();
        assert!(fx.store.get(other.path(), &SessionId::from_raw("s1")).await.is_none());
        assert!(fx.store.list_all(other.path()).await.is_empty());
    }

    #[tokio::test]
    async fn update_status_preserves_fields_and_refreshes_activity() {
        let fx = setup();
        let cwd = fx.project.path();
        let mut original = aged("s1", 3);
        original.instruction = Some("do it".into());
        original.linked_session_id = Some(SessionId::from_raw("s0"));
        fx.store.track(cwd, original.clone()).await.unwrap();

        let updated = fx
            .store
            .update_status(cwd, &original.id, SessionStatus::Active)
            .await
            .unwrap();

        assert_eq!(updated.status, SessionStatus::Active);
        assert!(updated.last_activity() > original.last_activity());
        assert_eq!(updated.instruction, original.instruction);
        assert_eq!(updated.linked_session_id, original.linked_session_id);
        assert_eq!(updated.created_at, original.created_at);
        assert_eq!(updated.session_type, original.session_type);
        assert_eq!(fx.store.get(cwd, &original.id).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn update_status_missing_is_not_found() {
        let fx = setup();
        let result = fx
            .store
            .update_status(fx.project.path(), &SessionId::from_raw("ghost"), SessionStatus::Abandoned)
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn mark_resumed_sets_timestamp_only() {
        let fx = setup();
        let cwd = fx.project.path();
        fx.store.track(cwd, record("s1", SessionType::Write)).await.unwrap();

        let resumed = fx.store.mark_resumed(cwd, &SessionId::from_raw("s1")).await.unwrap();
        assert!(resumed.last_resumed_at.is_some());
        assert_eq!(resumed.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn link_is_bidirectional() {
        let fx = setup();
        let cwd = fx.project.path();
        fx.store.track(cwd, record("write-1", SessionType::Write)).await.unwrap();
        fx.store.track(cwd, record("review-1", SessionType::Review)).await.unwrap();

        let a = SessionId::from_raw("write-1");
        let b = SessionId::from_raw("review-1");
        assert_eq!(fx.store.link(cwd, &a, &b).await.unwrap(), 2);

        assert_eq!(fx.store.get(cwd, &a).await.unwrap().linked_session_id, Some(b.clone()));
        assert_eq!(fx.store.get(cwd, &b).await.unwrap().linked_session_id, Some(a));
    }

    #[tokio::test]
    async fn link_skips_missing_records() {
        let fx = setup();
        let cwd = fx.project.path();
        fx.store.track(cwd, record("write-1", SessionType::Write)).await.unwrap();

        let a = SessionId::from_raw("write-1");
        let ghost = SessionId::from_raw("ghost");
        assert_eq!(fx.store.link(cwd, &a, &ghost).await.unwrap(), 1);
        assert!(fx.store.get(cwd, &ghost).await.is_none());
    }

    #[tokio::test]
    async fn remove_and_remove_multiple() {
        let fx = setup();
        let cwd = fx.project.path();
        for id in ["a", "b", "c"] {
            fx.store.track(cwd, record(id, SessionType::Exec)).await.unwrap();
        }

        assert!(fx.store.remove(cwd, &SessionId::from_raw("a")).await.unwrap());
        assert!(!fx.store.remove(cwd, &SessionId::from_raw("a")).await.unwrap());

        let removed = fx
            .store
            .remove_multiple(
                cwd,
                &[
                    SessionId::from_raw("b"),
                    SessionId::from_raw("ghost"),
                    SessionId::from_raw("c"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(removed, vec![SessionId::from_raw("b"), SessionId::from_raw("c")]);
        assert!(fx.store.list_all(cwd).await.is_empty());
    }

    #[tokio::test]
    async fn listing_filters_and_orders_newest_first() {
        let fx = setup();
        let cwd = fx.project.path();
        let mut old_write = aged("old", 5);
        old_write.session_type = SessionType::Write;
        let mut new_write = aged("new", 1);
        new_write.session_type = SessionType::Write;
        let mut review = aged("rev", 2);
        review.session_type = SessionType::Review;
        review.status = SessionStatus::Active;
        for r in [old_write, new_write, review] {
            fx.store.track(cwd, r).await.unwrap();
        }

        let ids = |records: Vec<SessionRecord>| -> Vec<String> {
            records.into_iter().map(|r| r.id.to_string()).collect()
        };
        assert_eq!(ids(fx.store.list_all(cwd).await), vec!["new", "rev", "old"]);
        assert_eq!(ids(fx.store.list_by_type(cwd, SessionType::Write).await), vec!["new", "old"]);
        assert_eq!(ids(fx.store.list_active(cwd).await), vec!["rev"]);
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_records() {
        let fx = setup();
        let cwd = fx.project.path();
        fx.store.track(cwd, aged("stale", 2)).await.unwrap();
        fx.store.track(cwd, aged("fresh", 0)).await.unwrap();
        let mut resumed = aged("resumed", 5);
        resumed.last_resumed_at = Some(Utc::now() - Duration::minutes(10));
        fx.store.track(cwd, resumed).await.unwrap();

        let removed = fx.store.sweep(cwd, 1.0).await.unwrap();
        assert_eq!(removed, vec![SessionId::from_raw("stale")]);
        assert!(fx.store.get(cwd, &SessionId::from_raw("fresh")).await.is_some());
        assert!(fx.store.get(cwd, &SessionId::from_raw("resumed")).await.is_some());
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let fx = setup();
        let cwd = fx.project.path();
        fx.store.track(cwd, aged("stale", 30)).await.unwrap();
        fx.store.track(cwd, aged("fresh", 0)).await.unwrap();

        assert_eq!(fx.store.sweep(cwd, 24.0).await.unwrap().len(), 1);
        assert!(fx.store.sweep(cwd, 24.0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_with_huge_age_removes_nothing() {
        let fx = setup();
        let cwd = fx.project.path();
        fx.store.track(cwd, aged("old", 30)).await.unwrap();
        fx.store.track(cwd, aged("fresh", 0)).await.unwrap();

        for hours in [1e12, f64::INFINITY, f64::MAX, f64::NAN] {
            assert!(fx.store.sweep(cwd, hours).await.unwrap().is_empty(), "hours = {hours}");
        }
        assert_eq!(fx.store.list_all(cwd).await.len(), 2);
    }

    #[test]
    fn cutoff_out_of_range_is_none() {
        assert!(sweep_cutoff(1e12).is_none());
        assert!(sweep_cutoff(f64::INFINITY).is_none());
        assert!(sweep_cutoff(1.0).is_some_and(|c| c < Utc::now()));
    }

    #[tokio::test]
    async fn corrupt_table_loads_empty_and_recovers() {
        let fx = setup();
        let cwd = fx.project.path();
        let path = fx.store.table_path(cwd);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json at all").unwrap();

        assert!(fx.store.list_all(cwd).await.is_empty());
        fx.store.track(cwd, record("s1", SessionType::Write)).await.unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(raw.get("s1").is_some());
    }

    #[tokio::test]
    async fn picks_up_rewrites_from_other_processes() {
        let fx = setup();
        let cwd = fx.project.path();
        fx.store.track(cwd, record("mine", SessionType::Write)).await.unwrap();

        // A second store stands in for another supervisor process.
        let other = SessionStore::new(fx._home.path().join("sessions"));
        other.track(cwd, record("theirs", SessionType::Exec)).await.unwrap();

        let ids: Vec<String> = fx
            .store
            .list_all(cwd)
            .await
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        assert!(ids.contains(&"mine".to_string()));
        assert!(ids.contains(&"theirs".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mutations_are_not_lost() {
        let fx = setup();
        let store = Arc::new(fx.store);
        let cwd = fx.project.path().to_path_buf();

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            let cwd = cwd.clone();
            handles.push(tokio::spawn(async move {
                let id = SessionId::from_raw(format!("s{i}"));
                store.track(&cwd, SessionRecord::new(id.clone(), SessionType::Exec)).await.unwrap();
                store.update_status(&cwd, &id, SessionStatus::Abandoned).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let reopened = SessionStore::new(fx._home.path().join("sessions"));
        let all = reopened.list_all(&cwd).await;
        assert_eq!(all.len(), 32);
        assert!(all.iter().all(|r| r.status == SessionStatus::Abandoned));
    }
}
