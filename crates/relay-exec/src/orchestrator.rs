//! Runs the tool to completion under a timeout and a cancellation token.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_core::{ErrorReport, RelayError, SandboxMode, SessionId};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::locate_tool;
use crate::invocation::{build_args, InvocationMode};
use crate::result::{parse_output, ParsedResult};
use crate::terminate::{prepare, ProcessTree};

/// How long to keep reading stdout after the tool exits, in case a
/// descendant still holds the pipe open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);
/// Characters of stderr carried in an execution-failure message.
const STDERR_TAIL: usize = 1000;

pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct RunOptions {
    /// Tool executable: a bare name looked up on `PATH`, or a path.
    pub program: String,
    pub cwd: PathBuf,
    pub model: Option<String>,
    /// Ignored for resumed runs.
    pub sandbox: SandboxMode,
    pub timeout: Duration,
    /// Called with every complete stdout line, as it arrives.
    pub on_line: Option<LineCallback>,
    pub cancel: CancellationToken,
}

impl RunOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: "codex".to_string(),
            cwd: cwd.into(),
            model: None,
            sandbox: SandboxMode::default(),
            timeout: Duration::from_secs(600),
            on_line: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("program", &self.program)
            .field("cwd", &self.cwd)
            .field("model", &self.model)
            .field("sandbox", &self.sandbox)
            .field("timeout", &self.timeout)
            .field("on_line", &self.on_line.is_some())
            .finish_non_exhaustive()
    }
}

/// Result of a run that reached process exit.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    #[serde(flatten)]
    pub result: ParsedResult,
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub success: bool,
    /// Always set when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

/// Start a fresh session.
pub async fn run_new(instruction: &str, options: &RunOptions) -> Result<RunOutcome, RelayError> {
    let mode = InvocationMode::New {
        sandbox: options.sandbox,
    };
    run(mode, instruction, options).await
}

/// Continue `session_id`. When the tool does not announce a session on
/// resume, the outcome carries `session_id` itself.
pub async fn run_resumed(
    session_id: &SessionId,
    instruction: &str,
    options: &RunOptions,
) -> Result<RunOutcome, RelayError> {
    let mode = InvocationMode::Resume {
        session_id: session_id.clone(),
    };
    run(mode, instruction, options).await
}

async fn run(
    mode: InvocationMode,
    instruction: &str,
    options: &RunOptions,
) -> Result<RunOutcome, RelayError> {
    let program = locate_tool(&options.program)?;
    let args = build_args(&options.cwd, options.model.as_deref(), &mode);

    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .current_dir(&options.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    prepare(&mut cmd);

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => RelayError::ToolNotFound {
            program: options.program.clone(),
        },
        _ => RelayError::ExecutionFailed(format!("failed to spawn {}: {e}", program.display())),
    })?;
    let tree = ProcessTree::of(&child);
    info!(
        program = %program.display(),
        cwd = %options.cwd.display(),
        pid = tree.leader(),
        resume = matches!(mode, InvocationMode::Resume { .. }),
        "tool started"
    );

    let stdin_task = feed_stdin(&mut child, instruction);
    let stderr_capture = StderrCapture::start(&mut child);
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RelayError::ExecutionFailed("stdout not captured".into()))?;

    let supervised = supervise(&mut child, stdout, options).await;
    if let Some(task) = stdin_task {
        task.abort();
    }

    let (status, collected) = match supervised {
        Ok(done) => done,
        Err(err) => {
            warn!(error = %err, "stopping tool");
            if let Err(e) = tree.terminate(&mut child).await {
                warn!(error = %e, "failed to terminate tool");
            }
            if let Some(capture) = stderr_capture {
                capture.abort();
            }
            return Err(err);
        }
    };

    // Descendants outliving the tool would otherwise keep running and hold
    // the pipes open.
    tree.kill_remaining().await;
    let stderr = match stderr_capture {
        Some(capture) => capture.finish().await,
        None => String::new(),
    };

    let mut result = parse_output(&collected);
    if result.session_id.is_none() {
        if let InvocationMode::Resume { session_id } = &mode {
            result.session_id = Some(session_id.clone());
        }
    }

    let success = status.success();
    let exit_code = status.code();
    info!(exit_code, success, files = result.files_created.len() + result.files_modified.len(), "tool exited");

    if success && result.session_id.is_none() {
        return Err(RelayError::InvalidOutput(
            "tool exited without reporting a session id".into(),
        ));
    }

    let error = (!success).then(|| {
        let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        let mut message = format!("exit code {code}");
        let tail = tail_chars(stderr.trim(), STDERR_TAIL);
        if !tail.is_empty() {
            message.push_str(": ");
            message.push_str(tail);
        }
        RelayError::ExecutionFailed(message).report()
    });

    Ok(RunOutcome {
        result,
        exit_code,
        stderr,
        success,
        error,
    })
}

/// Stream stdout until EOF and wait for exit, racing cancellation and the
/// deadline. Returns the exit status and the full stdout. Once the exit
/// status is in, cancellation and the deadline only cut the drain short.
async fn supervise(
    child: &mut Child,
    stdout: ChildStdout,
    options: &RunOptions,
) -> Result<(ExitStatus, String), RelayError> {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut collected = String::new();
    let mut status: Option<ExitStatus> = None;

    let deadline = tokio::time::sleep(options.timeout);
    tokio::pin!(deadline);
    let drain = tokio::time::sleep(Duration::MAX);
    tokio::pin!(drain);

    loop {
        tokio::select! {
            biased;
            () = options.cancel.cancelled() => match status {
                Some(_) => break,
                None => return Err(RelayError::Canceled),
            },
            () = &mut deadline => match status {
                Some(_) => break,
                None => return Err(RelayError::Timeout(options.timeout)),
            },
            res = child.wait(), if status.is_none() => {
                status = Some(res.map_err(wait_failed)?);
                drain.as_mut().reset(tokio::time::Instant::now() + DRAIN_GRACE);
            }
            () = &mut drain, if status.is_some() => {
                debug!("stdout still open after exit, stopped reading");
                break;
            }
            read = reader.read_until(b'\n', &mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(_) => {
                        let raw = String::from_utf8_lossy(&buf);
                        let line = raw.trim_end_matches(['\n', '\r']);
                        if let Some(on_line) = &options.on_line {
                            on_line(line);
                        }
                        collected.push_str(line);
                        collected.push('\n');
                        buf.clear();
                    }
                    Err(e) => {
                        warn!(error = %e, "stdout read failed");
                        break;
                    }
                }
            }
        }
    }

    if let Some(status) = status {
        return Ok((status, collected));
    }

    tokio::select! {
        biased;
        () = options.cancel.cancelled() => Err(RelayError::Canceled),
        () = &mut deadline => Err(RelayError::Timeout(options.timeout)),
        res = child.wait() => Ok((res.map_err(wait_failed)?, collected)),
    }
}

fn wait_failed(e: std::io::Error) -> RelayError {
    RelayError::ExecutionFailed(format!("waiting for tool failed: {e}"))
}

fn feed_stdin(child: &mut Child, instruction: &str) -> Option<JoinHandle<()>> {
    let mut stdin = child.stdin.take()?;
    let bytes = instruction.as_bytes().to_vec();
    Some(tokio::spawn(async move {
        if let Err(e) = stdin.write_all(&bytes).await {
            debug!(error = %e, "tool closed stdin early");
            return;
        }
        let _ = stdin.shutdown().await;
    }))
}

/// Stderr read in the background into a shared buffer, so whatever arrived
/// is kept even if the pipe never closes.
struct StderrCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl StderrCapture {
    fn start(child: &mut Child) -> Option<Self> {
        let mut stderr = child.stderr.take()?;
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let task = tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                match stderr.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                }
            }
        });
        Some(Self { buf, task })
    }

    /// Wait a bounded time for EOF, then return what was read.
    async fn finish(mut self) -> String {
        if tokio::time::timeout(DRAIN_GRACE, &mut self.task).await.is_err() {
            debug!("stderr still open after exit, keeping partial output");
            self.task.abort();
        }
        let text = String::from_utf8_lossy(&self.buf.lock()).into_owned();
        text
    }

    fn abort(self) {
        self.task.abort();
    }
}

fn tail_chars(s: &str, limit: usize) -> &str {
    let count = s.chars().count();
    if count <= limit {
        return s;
    }
    let skip = count - limit;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::ErrorKind;

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("abc", 10), "abc");
        assert_eq!(tail_chars("ééé", 2), "éé");
    }

    #[tokio::test]
    async fn missing_tool_fails_fast() {
        let mut options = RunOptions::new(std::env::temp_dir());
        options.program = "relay-no-such-tool-123".into();
        let err = run_new("hi", &options).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolNotFound);
    }

    #[test]
    fn debug_hides_callback() {
        let mut options = RunOptions::new("/tmp");
        options.on_line = Some(Arc::new(|_| {}));
        let text = format!("{options:?}");
        assert!(text.contains("on_line: true"));
    }

    #[test]
    fn outcome_serializes_flat() {
        let outcome = RunOutcome {
            result: ParsedResult {
                session_id: Some(SessionId::from_raw("s1")),
                summary: "done".into(),
                ..Default::default()
            },
            exit_code: Some(0),
            stderr: String::new(),
            success: true,
            error: None,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["exitCode"], 0);
        assert_eq!(json["success"], true);
        assert!(json.get("error").is_none());
        assert!(json.get("rawEvents").is_none());
    }

    #[cfg(unix)]
    mod fake_tool {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        /// Write an executable shell script standing in for the tool.
        fn script(dir: &Path, body: &str) -> String {
            let path = dir.join("fake-codex");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().into_owned()
        }

        fn options(dir: &Path, body: &str) -> RunOptions {
            let mut options = RunOptions::new(dir);
            options.program = script(dir, body);
            options.timeout = Duration::from_secs(10);
            options
        }

        const HAPPY: &str = r#"cat > /dev/null
echo '{"type":"session.started","session_id":"s1"}'
echo '{"type":"item.completed","item":{"type":"file_change","changes":[{"path":"a.txt","kind":"add"}]}}'
echo '{"type":"item.completed","item":{"type":"agent_message","text":"done"}}'"#;

        #[tokio::test]
        async fn successful_run() {
            let dir = tempfile::tempdir().unwrap();
            let outcome = run_new("write a.txt", &options(dir.path(), HAPPY)).await.unwrap();

            assert!(outcome.success);
            assert_eq!(outcome.exit_code, Some(0));
            assert!(outcome.error.is_none());
            assert_eq!(outcome.result.session_id, Some(SessionId::from_raw("s1")));
            assert_eq!(outcome.result.files_created, vec!["a.txt"]);
            assert!(outcome.result.files_modified.is_empty());
            assert_eq!(outcome.result.summary, "done");
        }

        #[tokio::test]
        async fn nonzero_exit_still_yields_result() {
            let dir = tempfile::tempdir().unwrap();
            let body = format!("{HAPPY}\necho 'model overloaded' >&2\nexit 1");
            let outcome = run_new("write a.txt", &options(dir.path(), &body)).await.unwrap();

            assert!(!outcome.success);
            assert_eq!(outcome.exit_code, Some(1));
            assert_eq!(outcome.result.session_id, Some(SessionId::from_raw("s1")));
            assert_eq!(outcome.result.files_created, vec!["a.txt"]);
            assert_eq!(outcome.result.summary, "done");
            assert_eq!(outcome.stderr.trim(), "model overloaded");

            let error = outcome.error.unwrap();
            assert_eq!(error.kind, ErrorKind::ExecutionFailed);
            assert!(error.recoverable);
            assert!(error.message.contains("exit code 1"));
            assert!(error.message.contains("model overloaded"));
        }

        #[tokio::test]
        async fn instruction_goes_through_stdin_and_args_are_exact() {
            let dir = tempfile::tempdir().unwrap();
            let out = dir.path().join("captured");
            let body = format!(
                "cat > '{stdin}'\necho \"$@\" > '{args}'\necho '{{\"type\":\"thread.started\",\"thread_id\":\"t1\"}}'",
                stdin = out.with_extension("stdin").display(),
                args = out.with_extension("args").display(),
            );
            let mut opts = options(dir.path(), &body);
            opts.model = Some("gpt-5-codex".into());
            opts.sandbox = SandboxMode::WorkspaceWrite;

            run_new("it's \"quoted\"; rm -rf /", &opts).await.unwrap();

            let stdin = std::fs::read_to_string(out.with_extension("stdin")).unwrap();
            assert_eq!(stdin, "it's \"quoted\"; rm -rf /");
            let args = std::fs::read_to_string(out.with_extension("args")).unwrap();
            assert_eq!(
                args.trim(),
                format!(
                    "exec --json --skip-git-repo-check -C {} -m gpt-5-codex -s workspace-write -",
                    dir.path().display()
                )
            );
        }

        #[tokio::test]
        async fn resume_falls_back_to_given_session() {
            let dir = tempfile::tempdir().unwrap();
            let args = dir.path().join("args");
            let body = format!(
                "cat > /dev/null\necho \"$@\" > '{}'\necho '{{\"type\":\"item.completed\",\"item\":{{\"type\":\"agent_message\",\"text\":\"again\"}}}}'",
                args.display()
            );
            let outcome = run_resumed(&SessionId::from_raw("s9"), "continue", &options(dir.path(), &body))
                .await
                .unwrap();

            assert_eq!(outcome.result.session_id, Some(SessionId::from_raw("s9")));
            let args = std::fs::read_to_string(args).unwrap();
            assert!(args.contains("resume s9 -"));
            assert!(!args.contains("-s "));
        }

        #[tokio::test]
        async fn missing_session_id_is_invalid_output() {
            let dir = tempfile::tempdir().unwrap();
            let body = "cat > /dev/null\necho 'not json'";
            let err = run_new("x", &options(dir.path(), body)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidOutput);
            assert!(!err.is_recoverable());
        }

        #[tokio::test]
        async fn lines_reach_callback_in_order() {
            let dir = tempfile::tempdir().unwrap();
            let seen = Arc::new(Mutex::new(Vec::<String>::new()));
            let sink = Arc::clone(&seen);
            let mut opts = options(dir.path(), HAPPY);
            opts.on_line = Some(Arc::new(move |line| sink.lock().push(line.to_string())));

            run_new("x", &opts).await.unwrap();

            let seen = seen.lock();
            assert_eq!(seen.len(), 3);
            assert!(seen[0].contains("session.started"));
            assert!(seen[2].contains("agent_message"));
        }

        fn gone(pid: u32) -> bool {
            // SAFETY: signal 0 only checks that the process exists.
            if unsafe { libc::kill(pid as libc::pid_t, 0) } != 0 {
                return true;
            }
            std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .map(|stat| stat.rsplit(')').next().is_some_and(|r| r.trim_start().starts_with('Z')))
                .unwrap_or(false)
        }

        async fn wait_gone(pid: u32) -> bool {
            for _ in 0..100 {
                if gone(pid) {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            false
        }

        #[tokio::test]
        async fn timeout_kills_process_tree() {
            let dir = tempfile::tempdir().unwrap();
            let pids = dir.path().join("pids");
            let body = format!(
                "echo $$ > '{p}'\nsleep 60 &\necho $! >> '{p}'\necho '{{\"type\":\"thread.started\",\"thread_id\":\"t\"}}'\nwait",
                p = pids.display()
            );
            let mut opts = options(dir.path(), &body);
            opts.timeout = Duration::from_millis(500);

            let err = run_new("x", &opts).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Timeout);
            assert!(err.is_recoverable());

            let pids: Vec<u32> = std::fs::read_to_string(&pids)
                .unwrap()
                .lines()
                .map(|l| l.trim().parse().unwrap())
                .collect();
            assert_eq!(pids.len(), 2);
            for pid in pids {
                assert!(wait_gone(pid).await, "pid {pid} survived");
            }
        }

        #[tokio::test]
        async fn cancellation_kills_and_reports_canceled() {
            let dir = tempfile::tempdir().unwrap();
            let opts = options(dir.path(), "cat > /dev/null\nsleep 60");
            let cancel = opts.cancel.clone();

            let handle = tokio::spawn(async move { run_new("x", &opts).await });
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();

            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Canceled);
            assert!(!err.is_recoverable());
        }

        #[tokio::test]
        async fn exit_status_wins_over_deadline_during_drain() {
            let dir = tempfile::tempdir().unwrap();
            let pid_file = dir.path().join("pid");
            // The background sleep inherits stdout; the deadline fires while
            // the drain is still waiting on it.
            let body = format!("{HAPPY}\nsleep 60 &\necho $! > '{}'\nexit 0", pid_file.display());
            let mut opts = options(dir.path(), &body);
            opts.timeout = Duration::from_secs(1);

            let outcome = run_new("x", &opts).await.unwrap();
            assert!(outcome.success);
            assert_eq!(outcome.result.session_id, Some(SessionId::from_raw("s1")));

            let pid: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
            assert!(wait_gone(pid).await, "descendant {pid} outlived the run");
        }

        #[tokio::test]
        async fn stderr_kept_when_descendant_holds_pipe() {
            let dir = tempfile::tempdir().unwrap();
            let body = format!("{HAPPY}\necho 'model overloaded' >&2\nsleep 30 &\nexit 1");
            let outcome = run_new("x", &options(dir.path(), &body)).await.unwrap();

            assert!(!outcome.success);
            assert_eq!(outcome.stderr.trim(), "model overloaded");
            let error = outcome.error.unwrap();
            assert!(error.message.contains("model overloaded"), "{}", error.message);
        }

        #[tokio::test]
        async fn exit_with_lingering_descendant_does_not_hang() {
            let dir = tempfile::tempdir().unwrap();
            // The background sleep inherits stdout and keeps it open.
            let body = format!("{HAPPY}\nsleep 30 &\nexit 0");
            let mut opts = options(dir.path(), &body);
            opts.timeout = Duration::from_secs(20);

            let started = std::time::Instant::now();
            let outcome = run_new("x", &opts).await.unwrap();
            assert!(outcome.success);
            assert!(started.elapsed() < Duration::from_secs(10));
        }
    }
}
