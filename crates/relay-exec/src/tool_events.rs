//! Decoding of the tool's `--json` event stream.
//!
//! The tool has emitted several generations of event shapes. Each line is
//! classified into a [`ToolEvent`] by ordered detection rules on the `type`
//! field; anything that matches no rule is `None`, never an error.

use serde_json::Value;

const START_TYPES: &[&str] = &["thread.started", "session.started", "session.created"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemPhase {
    Started,
    Updated,
    Completed,
}

impl ItemPhase {
    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "started" | "created" => Some(Self::Started),
            "updated" => Some(Self::Updated),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// One file touched by a `file_change` item, with the tool's own kind label
/// (`add`, `update`, `delete`, ...).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub kind: String,
}

impl FileChange {
    pub fn is_created(&self) -> bool {
        matches!(self.kind.as_str(), "add" | "create" | "created")
    }

    pub fn is_modified(&self) -> bool {
        matches!(self.kind.as_str(), "update" | "modify" | "modified" | "edit")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolItem {
    Reasoning(String),
    Command {
        command: String,
        exit_code: Option<i64>,
        output: String,
    },
    FileChange(Vec<FileChange>),
    Message(String),
    /// A recognised item wrapper around a payload kind we do not surface.
    Other(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolEvent {
    SessionStarted { session_id: String },
    Item { phase: ItemPhase, item: ToolItem },
    TurnCompleted { usage: Option<Usage> },
    TurnFailed { message: String },
    Error { message: String },
}

/// Parse one stdout line into a JSON object. Blank lines, invalid JSON and
/// non-object values yield `None`.
pub fn parse_line(line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str::<Value>(trimmed)
        .ok()
        .filter(Value::is_object)
}

impl ToolEvent {
    pub fn decode(value: &Value) -> Option<Self> {
        let ty = value.get("type")?.as_str()?;

        if START_TYPES.contains(&ty) {
            let session_id = str_field(value, &["thread_id", "session_id"])?;
            return Some(Self::SessionStarted {
                session_id: session_id.to_string(),
            });
        }

        if let Some(suffix) = ty.strip_prefix("item.") {
            let phase = ItemPhase::from_suffix(suffix)?;
            let item = decode_item(value.get("item")?)?;
            return Some(Self::Item { phase, item });
        }

        match ty {
            "turn.completed" => Some(Self::TurnCompleted {
                usage: value.get("usage").map(decode_usage),
            }),
            "turn.failed" => Some(Self::TurnFailed {
                message: error_message(value),
            }),
            "error" => Some(Self::Error {
                message: error_message(value),
            }),
            _ => None,
        }
    }

    /// The session id carried by a start-type event.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionStarted { session_id } => Some(session_id),
            _ => None,
        }
    }
}

fn decode_item(item: &Value) -> Option<ToolItem> {
    let kind = str_field(item, &["type", "item_type"])?;
    let decoded = match kind {
        "reasoning" => ToolItem::Reasoning(text_of(item)),
        "command_execution" => ToolItem::Command {
            command: str_field(item, &["command"]).unwrap_or_default().to_string(),
            exit_code: item.get("exit_code").and_then(Value::as_i64),
            output: str_field(item, &["aggregated_output", "output"])
                .unwrap_or_default()
                .to_string(),
        },
        "file_change" => ToolItem::FileChange(file_changes(item)),
        "agent_message" | "assistant_message" => ToolItem::Message(text_of(item)),
        other => ToolItem::Other(other.to_string()),
    };
    Some(decoded)
}

fn file_changes(item: &Value) -> Vec<FileChange> {
    if let Some(changes) = item.get("changes").and_then(Value::as_array) {
        return changes
            .iter()
            .filter_map(|c| {
                Some(FileChange {
                    path: str_field(c, &["path"])?.to_string(),
                    kind: str_field(c, &["kind", "action"]).unwrap_or("update").to_string(),
                })
            })
            .collect();
    }

    // legacy single-file shape
    match str_field(item, &["file_name", "filename", "path"]) {
        Some(path) => vec![FileChange {
            path: path.to_string(),
            kind: str_field(item, &["action", "kind"]).unwrap_or("update").to_string(),
        }],
        None => Vec::new(),
    }
}

/// Text of a message or reasoning item: a `text` string, or the text blocks
/// of a `content` array joined by newlines.
fn text_of(item: &Value) -> String {
    if let Some(text) = str_field(item, &["text"]) {
        return text.to_string();
    }
    match item.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn decode_usage(usage: &Value) -> Usage {
    let n = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
    Usage {
        input_tokens: n("input_tokens"),
        cached_input_tokens: n("cached_input_tokens"),
        output_tokens: n("output_tokens"),
    }
}

fn error_message(value: &Value) -> String {
    value
        .get("error")
        .and_then(|e| str_field(e, &["message"]).or_else(|| e.as_str()))
        .or_else(|| str_field(value, &["message"]))
        .unwrap_or("unknown error")
        .to_string()
}

/// First of `keys` present on `value` as a string.
fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| value.get(*k).and_then(Value::as_str))
}
