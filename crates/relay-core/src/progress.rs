use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::OperationId;

/// Silence after which observers should treat an operation without a
/// terminal event as stalled.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(60);

/// Canonical progress vocabulary shared by the hub, forwarders and viewers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Start,
    Reasoning,
    Command,
    CommandResult,
    FileChange,
    Message,
    End,
    Error,
}

impl ProgressKind {
    /// `end` and `error` close an operation's sequence.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::End | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Reasoning => "reasoning",
            Self::Command => "command",
            Self::CommandResult => "command_result",
            Self::FileChange => "file_change",
            Self::Message => "message",
            Self::End => "end",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ProgressKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProgressKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "reasoning" => Ok(Self::Reasoning),
            "command" => Ok(Self::Command),
            "command_result" => Ok(Self::CommandResult),
            "file_change" => Ok(Self::FileChange),
            "message" => Ok(Self::Message),
            "end" => Ok(Self::End),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown progress type: {other}")),
        }
    }
}

/// One entry of an operation's live progress feed. This is also the wire
/// shape pushed to viewers and accepted on the hub's ingest path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub timestamp: String,
    pub operation_id: String,
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    pub content: String,
}

impl ProgressEvent {
    /// Build an event stamped with the current UTC time.
    pub fn now(operation_id: &OperationId, kind: ProgressKind, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            operation_id: operation_id.as_str().to_string(),
            kind,
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_wire_field_names() {
        let op = OperationId::from_raw("op_1");
        let event = ProgressEvent::now(&op, ProgressKind::CommandResult, "exit 0");
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["operationId"], "op_1");
        assert_eq!(json["type"], "command_result");
        assert_eq!(json["content"], "exit 0");
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn rejects_unknown_type() {
        let raw = r#"{"timestamp":"t","operationId":"o","type":"bogus","content":""}"#;
        assert!(serde_json::from_str::<ProgressEvent>(raw).is_err());
    }

    #[test]
    fn terminal_kinds() {
        assert!(ProgressKind::End.is_terminal());
        assert!(ProgressKind::Error.is_terminal());
        assert!(!ProgressKind::Start.is_terminal());
        assert!(!ProgressKind::Message.is_terminal());
    }

    #[test]
    fn kind_string_roundtrip() {
        for kind in [
            ProgressKind::Start,
            ProgressKind::Reasoning,
            ProgressKind::Command,
            ProgressKind::CommandResult,
            ProgressKind::FileChange,
            ProgressKind::Message,
            ProgressKind::End,
            ProgressKind::Error,
        ] {
            assert_eq!(kind.as_str().parse::<ProgressKind>().unwrap(), kind);
        }
    }
}
