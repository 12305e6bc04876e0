//! Writes client-forwarded diagnostics into the relay log.

use agentlink_proto::control::LogLevel;
use chrono::{DateTime, SecondsFormat};
use serde_json::{Map, Value};

/// A `clientLog` control message, borrowed from the decoded frame.
#[derive(Debug, Clone, Copy)]
pub struct ClientLogEntry<'a> {
    pub level: LogLevel,
    pub source: &'a str,
    pub message: &'a str,
    pub timestamp: u64,
    pub context: Option<&'a Map<String, Value>>,
}

/// Renders the log line: `[mobile:<level>] [<source>] <iso> <message>[ <context>]`.
///
/// Context is omitted when absent or empty. A timestamp outside chrono's
/// range is printed as raw milliseconds.
#[must_use]
pub fn format_client_log(entry: &ClientLogEntry<'_>) -> String {
    let when = i64::try_from(entry.timestamp)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .map_or_else(
            || entry.timestamp.to_string(),
            |dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
    let mut line = format!(
        "[mobile:{}] [{}] {when} {}",
        entry.level.as_str(),
        entry.source,
        entry.message
    );
    if let Some(context) = entry.context.filter(|c| !c.is_empty()) {
        line.push(' ');
        line.push_str(&Value::Object(context.clone()).to_string());
    }
    line
}

/// Emits the entry at the matching tracing level.
pub fn write_client_log(entry: &ClientLogEntry<'_>) {
    let line = format_client_log(entry);
    match entry.level {
        LogLevel::Error => tracing::error!(target: "mobile", "{line}"),
        LogLevel::Warn => tracing::warn!(target: "mobile", "{line}"),
        LogLevel::Info => tracing::info!(target: "mobile", "{line}"),
        LogLevel::Debug => tracing::debug!(target: "mobile", "{line}"),
    }
}
