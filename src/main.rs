mod supervisor;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use relay_core::{SandboxMode, SessionId};
use relay_server::{HubRole, ProgressHub};
use relay_settings::{load_settings_or_default, settings_path, RelaySettings};
use relay_store::SessionType;
use relay_telemetry::{init_telemetry, parse_level, TelemetryConfig};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::supervisor::{hub_config, RunRequest, Supervisor};

/// Supervise `codex exec` runs, stream their progress and track sessions.
#[derive(Debug, Parser)]
#[command(name = "relay", version)]
struct Cli {
    /// Project directory; defaults to the current directory.
    #[arg(long = "cd", short = 'C', global = true, value_name = "DIR")]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run an instruction, optionally resuming an earlier session.
    Run(RunArgs),

    /// Inspect and maintain tracked sessions.
    #[command(subcommand)]
    Sessions(SessionsCommand),

    /// Serve the progress hub until interrupted.
    Hub,
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// Resume this session instead of starting a new one.
    #[arg(long, value_name = "SESSION_ID")]
    resume: Option<SessionId>,

    /// What the session is for: write, review or exec.
    #[arg(long = "type", default_value = "exec")]
    session_type: SessionType,

    #[arg(long, short = 'm')]
    model: Option<String>,

    /// read-only, workspace-write or danger-full-access.
    #[arg(long, short = 's')]
    sandbox: Option<SandboxMode>,

    #[arg(long, value_name = "SECONDS")]
    timeout_secs: Option<u64>,

    /// Base ref recorded with the session.
    #[arg(long = "base")]
    base_ref: Option<String>,

    /// Head ref recorded with the session.
    #[arg(long = "head")]
    head_ref: Option<String>,

    /// Instruction text; `-` or nothing reads it from stdin.
    #[arg(value_name = "INSTRUCTION")]
    instruction: Option<String>,
}

#[derive(Debug, Subcommand)]
enum SessionsCommand {
    /// List tracked sessions, newest first.
    List {
        #[arg(long = "type")]
        session_type: Option<SessionType>,
        #[arg(long)]
        active: bool,
    },
    Show {
        id: SessionId,
    },
    /// Stop tracking sessions.
    Remove {
        #[arg(required = true)]
        ids: Vec<SessionId>,
        /// Also delete the tool's own files for these sessions.
        #[arg(long)]
        discard_artifacts: bool,
    },
    /// Drop sessions idle for longer than the given age.
    Sweep {
        #[arg(long, default_value_t = 24.0)]
        max_age_hours: f64,
    },
    /// Link two sessions to each other.
    Link {
        a: SessionId,
        b: SessionId,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = init();

    match dispatch(cli, settings).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %e, "relay failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Load settings and install logging. A broken settings file is reported
/// once logging is up, and defaults are used instead.
fn init() -> RelaySettings {
    let path = settings_path();
    let (settings, load_error) = load_settings_or_default(&path);

    init_telemetry(&TelemetryConfig {
        log_level: parse_level(&settings.logging.level).unwrap_or(tracing::Level::INFO),
        json: settings.logging.json,
        ..TelemetryConfig::default()
    });

    if let Some(e) = load_error {
        tracing::warn!(
            path = %path.display(),
            error = %e,
            "settings unusable, falling back to defaults"
        );
    }
    settings
}

async fn dispatch(cli: Cli, settings: RelaySettings) -> anyhow::Result<bool> {
    let cwd = match cli.cwd {
        Some(dir) => dir,
        None => std::env::current_dir().context("reading current directory")?,
    };

    match cli.command {
        Command::Run(args) => run(args, &cwd, settings).await,
        Command::Sessions(command) => sessions(command, &cwd, settings).await,
        Command::Hub => serve_hub(settings).await,
    }
}

async fn run(args: RunArgs, cwd: &Path, settings: RelaySettings) -> anyhow::Result<bool> {
    let instruction = match args.instruction {
        Some(text) if text != "-" => text,
        _ => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("reading instruction from stdin")?;
            text
        }
    };
    if instruction.trim().is_empty() {
        bail!("instruction is empty");
    }

    let request = RunRequest {
        instruction,
        cwd: cwd.to_path_buf(),
        resume: args.resume,
        session_type: args.session_type,
        model: args.model,
        sandbox: args.sandbox,
        timeout: args.timeout_secs.map(Duration::from_secs),
        base_ref: args.base_ref,
        head_ref: args.head_ref,
    };

    let supervisor = Supervisor::start(settings).await;
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, canceling run");
            on_interrupt.cancel();
        }
    });

    let report = supervisor.run(request, cancel).await;
    interrupt.abort();
    supervisor.shutdown().await;

    print_json(&report)?;
    Ok(report.success)
}

async fn sessions(command: SessionsCommand, cwd: &Path, settings: RelaySettings) -> anyhow::Result<bool> {
    let supervisor = Supervisor::new(settings, None);
    match command {
        SessionsCommand::List {
            session_type,
            active,
        } => {
            let report = supervisor.list_sessions(cwd, session_type, active).await;
            print_json(&report)?;
            Ok(report.success)
        }
        SessionsCommand::Show { id } => {
            let report = supervisor.show_session(cwd, &id).await;
            print_json(&report)?;
            Ok(report.success)
        }
        SessionsCommand::Remove {
            ids,
            discard_artifacts,
        } => {
            let report = supervisor.remove_sessions(cwd, &ids, discard_artifacts).await;
            print_json(&report)?;
            Ok(report.success)
        }
        SessionsCommand::Sweep { max_age_hours } => {
            if max_age_hours.is_nan() || max_age_hours < 0.0 {
                bail!("--max-age-hours must be a non-negative number");
            }
            let report = supervisor.sweep_sessions(cwd, max_age_hours).await;
            print_json(&report)?;
            Ok(report.success)
        }
        SessionsCommand::Link { a, b } => {
            let report = supervisor.link_sessions(cwd, &a, &b).await;
            print_json(&report)?;
            Ok(report.success)
        }
    }
}

async fn serve_hub(settings: RelaySettings) -> anyhow::Result<bool> {
    let hub = ProgressHub::start(hub_config(&settings.hub))
        .await
        .with_context(|| format!("binding progress hub on port {}", settings.hub.port))?;

    if hub.role() == HubRole::Forwarder {
        hub.stop().await;
        bail!("another hub already owns port {}", hub.port());
    }

    eprintln!("progress hub listening on http://127.0.0.1:{}/events", hub.port());
    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    hub.stop().await;
    Ok(true)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("serializing report")?;
    println!("{json}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_options() {
        let cli = Cli::try_parse_from([
            "relay", "--cd", "/tmp/p", "run", "--resume", "s1", "--type", "review", "--sandbox",
            "workspace-write", "--timeout-secs", "30", "look again",
        ])
        .unwrap();
        assert_eq!(cli.cwd, Some(PathBuf::from("/tmp/p")));
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.resume, Some(SessionId::from_raw("s1")));
        assert_eq!(args.session_type, SessionType::Review);
        assert_eq!(args.sandbox, Some(SandboxMode::WorkspaceWrite));
        assert_eq!(args.timeout_secs, Some(30));
        assert_eq!(args.instruction.as_deref(), Some("look again"));
    }

    #[test]
    fn run_defaults_to_exec_sessions() {
        let cli = Cli::try_parse_from(["relay", "run", "-"]).unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.session_type, SessionType::Exec);
        assert_eq!(args.instruction.as_deref(), Some("-"));
    }

    #[test]
    fn parses_session_subcommands() {
        let cli = Cli::try_parse_from(["relay", "sessions", "remove", "a", "b", "--discard-artifacts"])
            .unwrap();
        match cli.command {
            Command::Sessions(SessionsCommand::Remove {
                ids,
                discard_artifacts,
            }) => {
                assert_eq!(ids.len(), 2);
                assert!(discard_artifacts);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let cli = Cli::try_parse_from(["relay", "sessions", "sweep"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Sessions(SessionsCommand::Sweep { max_age_hours }) if max_age_hours == 24.0
        ));
    }

    #[test]
    fn rejects_unknown_session_type() {
        assert!(Cli::try_parse_from(["relay", "run", "--type", "deploy", "x"]).is_err());
        assert!(Cli::try_parse_from(["relay", "sessions", "remove"]).is_err());
    }
}
