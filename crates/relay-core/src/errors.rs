use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Typed error taxonomy for supervised runs and session bookkeeping.
/// Classifies errors as recoverable (caller may retry) or not.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RelayError {
    // Unrecoverable without outside action
    #[error("tool not found: {program}")]
    ToolNotFound { program: String },
    #[error("invalid tool output: {0}")]
    InvalidOutput(String),

    // Recoverable
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    // Caller-initiated
    #[error("canceled")]
    Canceled,

    // Session bookkeeping
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session table corrupted: {0}")]
    SessionCorrupted(String),

    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),
}

/// Stable, serializable classification of a [`RelayError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ToolNotFound,
    ExecutionFailed,
    Timeout,
    Canceled,
    InvalidOutput,
    SessionNotFound,
    SessionCorrupted,
    ConfigurationInvalid,
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ToolNotFound { .. } => ErrorKind::ToolNotFound,
            Self::ExecutionFailed(_) => ErrorKind::ExecutionFailed,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Canceled => ErrorKind::Canceled,
            Self::InvalidOutput(_) => ErrorKind::InvalidOutput,
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::SessionCorrupted(_) => ErrorKind::SessionCorrupted,
            Self::ConfigurationInvalid(_) => ErrorKind::ConfigurationInvalid,
        }
    }

    /// Whether retrying the same request can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ExecutionFailed(_) | Self::Timeout(_) | Self::ConfigurationInvalid(_)
        )
    }

    /// Actionable hint for the person driving the supervisor, if any.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::ToolNotFound { program } => Some(format!(
                "install the codex CLI (npm install -g @openai/codex) or make sure `{program}` is on PATH"
            )),
            Self::Timeout(_) => Some(
                "raise the timeout or split the instruction into smaller steps".to_string(),
            ),
            Self::ExecutionFailed(_) => Some("retry the run; check stderr for details".to_string()),
            Self::SessionNotFound(_) => {
                Some("list tracked sessions to find a valid identifier".to_string())
            }
            Self::ConfigurationInvalid(_) => {
                Some("fix the settings file; defaults are in effect".to_string())
            }
            Self::Canceled | Self::InvalidOutput(_) | Self::SessionCorrupted(_) => None,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            recoverable: self.is_recoverable(),
            suggestion: self.suggestion(),
        }
    }
}

/// Wire/CLI representation of an error: kind, message, recoverability and
/// an optional suggestion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl From<&RelayError> for ErrorReport {
    fn from(e: &RelayError) -> Self {
        e.report()
    }
}
