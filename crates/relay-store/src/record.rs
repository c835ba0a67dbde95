use chrono::{DateTime, Utc};
use relay_core::SessionId;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// What a tracked session was started for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Write,
    Review,
    Exec,
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Write => write!(f, "write"),
            Self::Review => write!(f, "review"),
            Self::Exec => write!(f, "exec"),
        }
    }
}

impl std::str::FromStr for SessionType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "write" => Ok(Self::Write),
            "review" => Ok(Self::Review),
            "exec" => Ok(Self::Exec),
            other => Err(format!("unknown session type: {other}")),
        }
    }
}

/// Tracking metadata for one resumable tool session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: SessionId,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_resumed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_session_id: Option<SessionId>,
    pub status: SessionStatus,
}

impl SessionRecord {
    /// A freshly created record, `completed` until someone resumes it.
    pub fn new(id: SessionId, session_type: SessionType) -> Self {
        Self {
            id,
            session_type,
            instruction: None,
            base_ref: None,
            head_ref: None,
            created_at: Utc::now(),
            last_resumed_at: None,
            linked_session_id: None,
            status: SessionStatus::Completed,
        }
    }

    /// Timestamp sweeps measure age from.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_resumed_at.unwrap_or(self.created_at)
    }
}
