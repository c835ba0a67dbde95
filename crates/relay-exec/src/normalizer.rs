//! Raw tool line → canonical progress event.

use relay_core::{OperationId, ProgressEvent, ProgressKind};

use crate::tool_events::{parse_line, ToolEvent, ToolItem, Usage};

/// Normalize one stdout line. Unparsable or unrecognised lines are ignored.
pub fn normalize(line: &str, operation_id: &OperationId) -> Option<ProgressEvent> {
    let value = parse_line(line)?;
    let event = ToolEvent::decode(&value)?;
    normalize_event(&event, operation_id)
}

pub fn normalize_event(event: &ToolEvent, operation_id: &OperationId) -> Option<ProgressEvent> {
    let (kind, content) = match event {
        ToolEvent::SessionStarted { session_id } => (ProgressKind::Start, session_id.clone()),
        ToolEvent::Item { item, .. } => item_progress(item)?,
        ToolEvent::TurnCompleted { usage } => (
            ProgressKind::End,
            usage
                .as_ref()
                .map(usage_summary)
                .unwrap_or_else(|| "turn completed".to_string()),
        ),
        ToolEvent::TurnFailed { message } | ToolEvent::Error { message } => {
            (ProgressKind::Error, message.clone())
        }
    };
    Some(ProgressEvent::now(operation_id, kind, content))
}

fn item_progress(item: &ToolItem) -> Option<(ProgressKind, String)> {
    match item {
        ToolItem::Reasoning(text) if !text.is_empty() => {
            Some((ProgressKind::Reasoning, text.clone()))
        }
        ToolItem::Message(text) if !text.is_empty() => Some((ProgressKind::Message, text.clone())),
        ToolItem::Command {
            command,
            exit_code: None,
            ..
        } => Some((ProgressKind::Command, command.clone())),
        ToolItem::Command {
            exit_code: Some(code),
            output,
            ..
        } => {
            let mut content = format!("exit {code}");
            if !output.is_empty() {
                content.push('\n');
                content.push_str(output.trim_end());
            }
            Some((ProgressKind::CommandResult, content))
        }
        ToolItem::FileChange(changes) if !changes.is_empty() => {
            let content = changes
                .iter()
                .map(|c| format!("{} ({})", c.path, c.kind))
                .collect::<Vec<_>>()
                .join(", ");
            Some((ProgressKind::FileChange, content))
        }
        _ => None,
    }
}

fn usage_summary(usage: &Usage) -> String {
    format!(
        "tokens: {} in ({} cached), {} out",
        usage.input_tokens, usage.cached_input_tokens, usage.output_tokens
    )
}
