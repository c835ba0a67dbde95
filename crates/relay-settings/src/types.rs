use std::path::PathBuf;
use std::time::Duration;

use relay_core::SandboxMode;
use serde::{Deserialize, Serialize};

use crate::loader::{home_dir, relay_home};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub codex: CodexSettings,
    pub hub: HubSettings,
    pub sessions: SessionSettings,
    pub logging: LoggingSettings,
}

/// How the external tool is located and invoked.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodexSettings {
    /// Executable name (looked up on PATH) or path.
    pub binary: String,
    /// Model passed with `-m`; the tool's own default when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    pub sandbox: SandboxMode,
    pub timeout_secs: u64,
    /// Tool state directory; falls back to `$CODEX_HOME`, then `~/.codex`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
}

impl Default for CodexSettings {
    fn default() -> Self {
        Self {
            binary: "codex".to_string(),
            default_model: None,
            sandbox: SandboxMode::ReadOnly,
            timeout_secs: 600,
            home: None,
        }
    }
}

impl CodexSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn home_dir(&self) -> PathBuf {
        if let Some(home) = &self.home {
            return PathBuf::from(home);
        }
        std::env::var("CODEX_HOME")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir().join(".codex"))
    }
}

/// Progress hub and forwarder settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    pub enabled: bool,
    /// Loopback port the hub binds; every instance on the machine must agree.
    pub port: u16,
    pub ingest_body_limit: usize,
    pub forward_queue_cap: usize,
    pub retry_delay_ms: u64,
    pub flush_timeout_ms: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 7337,
            ingest_body_limit: 64 * 1024,
            forward_queue_cap: 2000,
            retry_delay_ms: 1000,
            flush_timeout_ms: 2000,
        }
    }
}

/// Session tracking settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Directory holding per-project tables; `<relay home>/sessions` if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

impl SessionSettings {
    pub fn dir(&self) -> PathBuf {
        self.dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| relay_home().join("sessions"))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = RelaySettings::default();
        assert_eq!(s.codex.binary, "codex");
        assert_eq!(s.codex.sandbox, SandboxMode::ReadOnly);
        assert_eq!(s.codex.timeout(), Duration::from_secs(600));
        assert_eq!(s.hub.port, 7337);
        assert_eq!(s.hub.forward_queue_cap, 2000);
        assert_eq!(s.hub.ingest_body_limit, 65536);
        assert_eq!(s.logging.level, "info");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: RelaySettings =
            serde_json::from_str(r#"{"hub": {"port": 9000}, "codex": {"sandbox": "workspace-write"}}"#)
                .unwrap();
        assert_eq!(s.hub.port, 9000);
        assert_eq!(s.hub.retry_delay_ms, 1000);
        assert_eq!(s.codex.sandbox, SandboxMode::WorkspaceWrite);
        assert_eq!(s.codex.binary, "codex");
    }

    #[test]
    fn explicit_codex_home_wins() {
        let codex = CodexSettings {
            home: Some("/opt/codex-home".into()),
            ..Default::default()
        };
        assert_eq!(codex.home_dir(), PathBuf::from("/opt/codex-home"));
    }

    #[test]
    fn explicit_sessions_dir_wins() {
        let sessions = SessionSettings {
            dir: Some("/var/relay/sessions".into()),
        };
        assert_eq!(sessions.dir(), PathBuf::from("/var/relay/sessions"));
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(RelaySettings::default()).unwrap();
        assert!(json["codex"]["timeoutSecs"].is_u64());
        assert!(json["hub"]["forwardQueueCap"].is_u64());
        assert!(json["codex"].get("defaultModel").is_none());
    }
}
