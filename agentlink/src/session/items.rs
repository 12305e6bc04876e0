//! Transcript items and their conversion from agent item payloads.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemKind {
    UserMessage,
    AgentMessage,
    CommandExecution,
    FileChange,
    Plan,
    Diff,
    ToolCall,
    Reasoning,
    System,
}

/// One id-keyed entry of the transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub title: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl TranscriptItem {
    pub fn new(
        id: impl Into<String>,
        kind: ItemKind,
        title: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            title: title.into(),
            text: text.into(),
            status: None,
        }
    }

    /// Folds a newer snapshot of the same item into this one.
    ///
    /// Fields present in `next` win; empty text and absent status keep what
    /// was already known, so streamed text survives a sparse completion.
    pub(crate) fn merge(&mut self, next: Self) {
        self.kind = next.kind;
        self.title = next.title;
        if !next.text.is_empty() {
            self.text = next.text;
        }
        if next.status.is_some() {
            self.status = next.status;
        }
    }

    pub(crate) fn append(&mut self, delta: &str) {
        self.text.push_str(delta);
    }
}

/// First non-empty string among `keys`.
pub(crate) fn str_field<'a>(record: Option<&'a Map<String, Value>>, keys: &[&str]) -> Option<&'a str> {
    let record = record?;
    keys.iter()
        .filter_map(|key| record.get(*key).and_then(Value::as_str))
        .find(|value| !value.is_empty())
}

fn str_or<'a>(record: &'a Map<String, Value>, key: &str, fallback: &'a str) -> &'a str {
    record.get(key).and_then(Value::as_str).unwrap_or(fallback)
}

fn objects<'a>(value: Option<&'a Value>) -> impl Iterator<Item = &'a Map<String, Value>> {
    value
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

fn joined_texts(value: Option<&Value>) -> String {
    objects(value)
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn file_change_summary(item: &Map<String, Value>) -> String {
    let changes: Vec<_> = objects(item.get("changes")).collect();
    let mut lines: Vec<String> = changes
        .iter()
        .take(3)
        .map(|change| {
            format!(
                "{}: {}",
                str_or(change, "kind", "edit"),
                str_or(change, "path", "(unknown file)")
            )
        })
        .collect();
    if changes.len() > 3 {
        lines.push(format!("+{} more file changes", changes.len() - 3));
    }
    lines.join("\n")
}

/// Converts an agent item payload into a transcript item.
///
/// `fallback_id` supplies an id when the payload carries none.
pub(crate) fn from_agent_item(
    item: &Map<String, Value>,
    fallback_id: impl FnOnce() -> String,
) -> TranscriptItem {
    let id = item
        .get("id")
        .and_then(Value::as_str)
        .map_or_else(fallback_id, str::to_string);
    let item_type = str_or(item, "type", "unknown");
    let text_of = |key: &str| str_or(item, key, "").to_string();

    let (kind, title, text) = match item_type {
        "userMessage" => (
            ItemKind::UserMessage,
            "User".to_string(),
            joined_texts(item.get("content")),
        ),
        "agentMessage" => (ItemKind::AgentMessage, "Agent".to_string(), text_of("text")),
        "commandExecution" => {
            let cwd = str_or(item, "cwd", "");
            let output = str_or(item, "aggregatedOutput", "");
            let text = [
                if cwd.is_empty() {
                    String::new()
                } else {
                    format!("cwd: {cwd}")
                },
                output.to_string(),
            ]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
            (
                ItemKind::CommandExecution,
                format!("Command: {}", str_or(item, "command", "command")),
                text,
            )
        }
        "fileChange" => (
            ItemKind::FileChange,
            "File change".to_string(),
            file_change_summary(item),
        ),
        "plan" => (ItemKind::Plan, "Plan".to_string(), text_of("text")),
        "reasoning" => (
            ItemKind::Reasoning,
            "Reasoning".to_string(),
            joined_texts(item.get("summary")),
        ),
        "mcpToolCall" => (
            ItemKind::ToolCall,
            format!(
                "Tool: {}.{}",
                str_or(item, "server", "mcp"),
                str_or(item, "tool", "tool")
            ),
            String::new(),
        ),
        "webSearch" => (
            ItemKind::ToolCall,
            "Tool: web search".to_string(),
            text_of("query"),
        ),
        other => (ItemKind::System, format!("Item: {other}"), String::new()),
    };

    TranscriptItem {
        id,
        kind,
        title,
        text,
        status: item
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn plan_status_label(status: &str) -> &'static str {
    match status {
        "inProgress" => "IN PROGRESS",
        "completed" => "COMPLETED",
        _ => "PENDING",
    }
}

/// Renders a `turn/plan/updated` payload: explanation first, then one
/// `[STATUS] step` line per step.
pub(crate) fn render_plan(params: Option<&Map<String, Value>>) -> Option<String> {
    let explanation = str_field(params, &["explanation"]);
    let steps = objects(params.and_then(|p| p.get("plan"))).filter_map(|entry| {
        let step = str_or(entry, "step", "");
        (!step.is_empty()).then(|| {
            format!(
                "[{}] {step}",
                plan_status_label(str_or(entry, "status", "pending"))
            )
        })
    });
    let lines: Vec<String> = explanation.map(str::to_string).into_iter().chain(steps).collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

/// Unified diff text of a `turn/diff/updated` payload.
pub(crate) fn extract_diff(params: Option<&Map<String, Value>>) -> Option<&str> {
    str_field(params, &["diff"]).or_else(|| {
        str_field(
            params.and_then(|p| p.get("diff")).and_then(Value::as_object),
            &["unified", "unifiedDiff", "patch", "text"],
        )
    })
}
