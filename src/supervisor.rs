//! Wires the orchestrator, the progress hub and the session store together.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use relay_core::{ErrorReport, OperationId, RelayError, SandboxMode, SessionId};
use relay_exec::{normalize, run_new, run_resumed, RunOptions, RunOutcome};
use relay_server::{HubConfig, OperationReporter, ProgressHub};
use relay_settings::{HubSettings, RelaySettings};
use relay_store::artifacts::discard_tool_session;
use relay_store::{SessionRecord, SessionStatus, SessionStore, SessionType};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const START_PREVIEW: usize = 200;

/// Uniform result of every supervisor operation: a success flag, the data
/// on success, the error report on failure.
#[derive(Debug, Serialize)]
pub struct Report<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl<T> Report<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: RelayError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.report()),
        }
    }
}

impl<T> From<Result<T, RelayError>> for Report<T> {
    fn from(result: Result<T, RelayError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(e),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunRequest {
    pub instruction: String,
    pub cwd: PathBuf,
    pub resume: Option<SessionId>,
    pub session_type: SessionType,
    pub model: Option<String>,
    pub sandbox: Option<SandboxMode>,
    pub timeout: Option<Duration>,
    pub base_ref: Option<String>,
    pub head_ref: Option<String>,
}

impl RunRequest {
    pub fn new(instruction: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            instruction: instruction.into(),
            cwd: cwd.into(),
            resume: None,
            session_type: SessionType::Exec,
            model: None,
            sandbox: None,
            timeout: None,
            base_ref: None,
            head_ref: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub success: bool,
    pub operation_id: OperationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveSummary {
    pub removed: Vec<SessionId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub discarded_files: Vec<PathBuf>,
}

pub fn hub_config(settings: &HubSettings) -> HubConfig {
    HubConfig {
        port: settings.port,
        ingest_body_limit: settings.ingest_body_limit,
        forward_queue_cap: settings.forward_queue_cap,
        retry_delay: Duration::from_millis(settings.retry_delay_ms),
        flush_timeout: Duration::from_millis(settings.flush_timeout_ms),
        ..HubConfig::default()
    }
}

pub struct Supervisor {
    settings: RelaySettings,
    store: SessionStore,
    hub: Option<Arc<ProgressHub>>,
}

impl Supervisor {
    pub fn new(settings: RelaySettings, hub: Option<Arc<ProgressHub>>) -> Self {
        let store = SessionStore::new(settings.sessions.dir());
        Self {
            settings,
            store,
            hub,
        }
    }

    /// Build a supervisor and, if enabled, join the machine's progress hub.
    /// A hub that cannot start only disables live progress.
    pub async fn start(settings: RelaySettings) -> Self {
        let hub = if settings.hub.enabled {
            match ProgressHub::start(hub_config(&settings.hub)).await {
                Ok(hub) => {
                    info!(role = %hub.role(), port = hub.port(), "progress hub ready");
                    Some(Arc::new(hub))
                }
                Err(e) => {
                    warn!(port = settings.hub.port, error = %e, "progress hub unavailable");
                    None
                }
            }
        } else {
            None
        };
        Self::new(settings, hub)
    }

    pub async fn shutdown(&self) {
        if let Some(hub) = &self.hub {
            hub.stop().await;
        }
    }

    /// Run one invocation end to end: progress, tool, session bookkeeping.
    pub async fn run(&self, request: RunRequest, cancel: CancellationToken) -> RunReport {
        let operation_id = OperationId::new();
        let reporter = self
            .hub
            .as_ref()
            .map(|hub| Arc::new(OperationReporter::new(Arc::clone(hub), operation_id.clone())));
        if let Some(reporter) = &reporter {
            reporter.begin(preview(&request.instruction));
        }
        info!(operation_id = %operation_id, resume = ?request.resume, "run started");

        let resumed_record = match &request.resume {
            Some(id) => self.begin_resume(&request.cwd, id).await,
            None => false,
        };

        let options = self.run_options(&request, &operation_id, reporter.clone(), cancel);
        let result = match &request.resume {
            Some(id) => run_resumed(id, &request.instruction, &options).await,
            None => run_new(&request.instruction, &options).await,
        };

        match result {
            Ok(outcome) => {
                let session_id = outcome.result.session_id.clone();
                if let Some(id) = &session_id {
                    self.record_outcome(&request, id, outcome.success, resumed_record)
                        .await;
                }
                if let Some(reporter) = &reporter {
                    match &outcome.error {
                        Some(error) => reporter.fail(error.message.clone()),
                        None if outcome.result.summary.is_empty() => reporter.finish("completed"),
                        None => reporter.finish(outcome.result.summary.clone()),
                    }
                }
                info!(
                    operation_id = %operation_id,
                    session_id = ?session_id,
                    success = outcome.success,
                    "run finished"
                );
                RunReport {
                    success: outcome.success,
                    operation_id,
                    session_id,
                    error: outcome.error.clone(),
                    outcome: Some(outcome),
                }
            }
            Err(err) => {
                if let (Some(id), true) = (&request.resume, resumed_record) {
                    self.set_status(&request.cwd, id, SessionStatus::Abandoned).await;
                }
                if let Some(reporter) = &reporter {
                    reporter.fail(err.to_string());
                }
                warn!(operation_id = %operation_id, error = %err, "run failed");
                RunReport {
                    success: false,
                    operation_id,
                    session_id: request.resume.clone(),
                    outcome: None,
                    error: Some(err.report()),
                }
            }
        }
    }

    fn run_options(
        &self,
        request: &RunRequest,
        operation_id: &OperationId,
        reporter: Option<Arc<OperationReporter>>,
        cancel: CancellationToken,
    ) -> RunOptions {
        let codex = &self.settings.codex;
        let mut options = RunOptions::new(&request.cwd);
        options.program = codex.binary.clone();
        options.model = request.model.clone().or_else(|| codex.default_model.clone());
        options.sandbox = request.sandbox.unwrap_or(codex.sandbox);
        options.timeout = request.timeout.unwrap_or_else(|| codex.timeout());
        options.cancel = cancel;
        if let Some(reporter) = reporter {
            let operation_id = operation_id.clone();
            options.on_line = Some(Arc::new(move |line: &str| {
                if let Some(event) = normalize(line, &operation_id) {
                    reporter.forward(event);
                }
            }));
        }
        options
    }

    /// Mark a tracked session active before resuming it. Returns whether a
    /// record existed.
    async fn begin_resume(&self, cwd: &Path, id: &SessionId) -> bool {
        if self.store.get(cwd, id).await.is_none() {
            return false;
        }
        match self.store.update_status(cwd, id, SessionStatus::Active).await {
            Ok(_) => true,
            Err(e) => {
                warn!(session_id = %id, error = %e, "could not mark session active");
                false
            }
        }
    }

    async fn record_outcome(&self, request: &RunRequest, id: &SessionId, success: bool, existed: bool) {
        let status = if success {
            SessionStatus::Completed
        } else {
            SessionStatus::Abandoned
        };
        if existed || self.store.get(&request.cwd, id).await.is_some() {
            self.set_status(&request.cwd, id, status).await;
            return;
        }

        let mut record = SessionRecord::new(id.clone(), request.session_type);
        record.instruction = Some(request.instruction.clone());
        record.base_ref = request.base_ref.clone();
        record.head_ref = request.head_ref.clone();
        record.status = status;
        if let Err(e) = self.store.track(&request.cwd, record).await {
            warn!(session_id = %id, error = %e, "could not track session");
        }
    }

    /// Best effort; failures are logged and swallowed.
    async fn set_status(&self, cwd: &Path, id: &SessionId, status: SessionStatus) {
        if let Err(e) = self.store.update_status(cwd, id, status).await {
            warn!(session_id = %id, status = %status, error = %e, "could not update session status");
        }
    }

    pub async fn list_sessions(
        &self,
        cwd: &Path,
        session_type: Option<SessionType>,
        active_only: bool,
    ) -> Report<Vec<SessionRecord>> {
        let mut records = match session_type {
            Some(t) => self.store.list_by_type(cwd, t).await,
            None if active_only => self.store.list_active(cwd).await,
            None => self.store.list_all(cwd).await,
        };
        if active_only {
            records.retain(|r| r.status == SessionStatus::Active);
        }
        Report::ok(records)
    }

    pub async fn show_session(&self, cwd: &Path, id: &SessionId) -> Report<SessionRecord> {
        self.store
            .get(cwd, id)
            .await
            .ok_or_else(|| RelayError::SessionNotFound(id.to_string()))
            .into()
    }

    /// Remove tracking records; with `discard_artifacts`, also delete the
    /// tool's own session files for each id.
    pub async fn remove_sessions(
        &self,
        cwd: &Path,
        ids: &[SessionId],
        discard_artifacts: bool,
    ) -> Report<RemoveSummary> {
        let removed = match self.store.remove_multiple(cwd, ids).await {
            Ok(removed) => removed,
            Err(e) => return Report::err(e.into()),
        };

        let mut summary = RemoveSummary {
            removed,
            discarded_files: Vec::new(),
        };
        if discard_artifacts {
            let codex_home = self.settings.codex.home_dir();
            for id in ids {
                match discard_tool_session(&codex_home, id) {
                    Ok(files) => summary.discarded_files.extend(files),
                    Err(e) => warn!(session_id = %id, error = %e, "could not discard tool session"),
                }
            }
        }
        Report::ok(summary)
    }

    pub async fn sweep_sessions(&self, cwd: &Path, max_age_hours: f64) -> Report<Vec<SessionId>> {
        self.store
            .sweep(cwd, max_age_hours)
            .await
            .map_err(RelayError::from)
            .into()
    }

    pub async fn link_sessions(&self, cwd: &Path, a: &SessionId, b: &SessionId) -> Report<usize> {
        match self.store.link(cwd, a, b).await {
            Ok(0) => Report::err(RelayError::SessionNotFound(format!("{a}, {b}"))),
            Ok(n) => Report::ok(n),
            Err(e) => Report::err(e.into()),
        }
    }
}

fn preview(instruction: &str) -> String {
    let first = instruction.lines().next().unwrap_or_default().trim();
    if first.chars().count() <= START_PREVIEW {
        return first.to_string();
    }
    let mut out: String = first.chars().take(START_PREVIEW - 3).collect();
    out.push_str("...");
    out
}
