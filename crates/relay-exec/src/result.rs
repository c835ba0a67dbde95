use relay_core::SessionId;
use serde::Serialize;
use serde_json::Value;

use crate::tool_events::{parse_line, ItemPhase, ToolEvent, ToolItem};

/// Upper bound on [`ParsedResult::summary`], in characters.
pub const SUMMARY_LIMIT: usize = 500;

/// Structured view of one invocation's full stdout.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedResult {
    pub session_id: Option<SessionId>,
    pub summary: String,
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub agent_messages: Vec<String>,
    /// Every parsed JSON object, in stdout order. Kept in memory only.
    #[serde(skip)]
    pub raw_events: Vec<Value>,
}

/// Reparse accumulated stdout. The session id is the first start-type
/// event; files and messages come from `item.completed` events only.
pub fn parse_output(stdout: &str) -> ParsedResult {
    let mut result = ParsedResult::default();

    for value in stdout.lines().filter_map(parse_line) {
        if let Some(event) = ToolEvent::decode(&value) {
            collect(&mut result, event);
        }
        result.raw_events.push(value);
    }

    result.summary = summarize(&result);
    result
}

fn collect(result: &mut ParsedResult, event: ToolEvent) {
    match event {
        ToolEvent::SessionStarted { session_id } if result.session_id.is_none() => {
            result.session_id = Some(SessionId::from_raw(session_id));
        }
        ToolEvent::Item {
            phase: ItemPhase::Completed,
            item,
        } => match item {
            ToolItem::FileChange(changes) => {
                for change in changes {
                    if change.is_created() {
                        result.files_created.push(change.path);
                    } else if change.is_modified() {
                        result.files_modified.push(change.path);
                    }
                }
            }
            ToolItem::Message(text) if !text.is_empty() => result.agent_messages.push(text),
            _ => {}
        },
        _ => {}
    }
}

fn summarize(result: &ParsedResult) -> String {
    if let Some(last) = result.agent_messages.last() {
        return truncate_chars(last, SUMMARY_LIMIT);
    }

    let mut parts = Vec::new();
    if !result.files_created.is_empty() {
        parts.push(format!("Created {}.", result.files_created.join(", ")));
    }
    if !result.files_modified.is_empty() {
        parts.push(format!("Modified {}.", result.files_modified.join(", ")));
    }
    truncate_chars(&parts.join(" "), SUMMARY_LIMIT)
}

/// Cut `s` to at most `limit` characters, ending in `...` when shortened.
pub(crate) fn truncate_chars(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        return s.to_string();
    }
    let keep = limit.saturating_sub(3);
    let mut out: String = s.chars().take(keep).collect();
    out.push_str("...");
    out
}
