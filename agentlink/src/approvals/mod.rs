//! Server-initiated approval requests.
//!
//! The agent server asks for a human decision before running a command or
//! applying file changes. [`parse_request`] validates the request into a
//! [`PendingApproval`], the [`correlator`] tracks it until a decision is
//! made, and [`response`] builds the reply payload.

pub mod correlator;
pub mod response;
pub mod risk;

use std::fmt;
use std::time::Duration;

use agentlink_proto::jsonrpc::RequestId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use correlator::ApprovalCorrelator;
pub use response::{ApprovalResponse, build_response};
pub use risk::{RiskLevel, RiskSummary, summarize_risk};

/// Method of a command execution approval request.
pub const COMMAND_APPROVAL_METHOD: &str = "item/commandExecution/requestApproval";
/// Method of a file change approval request.
pub const FILE_CHANGE_APPROVAL_METHOD: &str = "item/fileChange/requestApproval";

/// How long an approval may stay unanswered before it is auto-declined.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_millis(120_000);

/// Errors raised while handling approvals.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApprovalError {
    #[error("Unsupported approval method: {0}")]
    UnsupportedMethod(String),
    #[error("Invalid approval payload for method: {0}")]
    InvalidPayload(String),
    #[error("acceptSettings must be valid JSON.")]
    InvalidSettingsJson,
    #[error("acceptSettings JSON must be an object.")]
    SettingsNotObject,
}

/// Which action an approval guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalKind {
    CommandExecution,
    FileChange,
}

impl ApprovalKind {
    /// Maps a request method to its approval kind.
    #[must_use]
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            COMMAND_APPROVAL_METHOD => Some(Self::CommandExecution),
            FILE_CHANGE_APPROVAL_METHOD => Some(Self::FileChange),
            _ => None,
        }
    }

    #[must_use]
    pub const fn method(self) -> &'static str {
        match self {
            Self::CommandExecution => COMMAND_APPROVAL_METHOD,
            Self::FileChange => FILE_CHANGE_APPROVAL_METHOD,
        }
    }
}

/// The user's answer to an approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accept,
    Decline,
}

impl Decision {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Decline => "decline",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated approval request awaiting a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingApproval {
    pub request_id: RequestId,
    pub kind: ApprovalKind,
    pub item_id: String,
    pub thread_id: String,
    pub turn_id: String,
    pub reason: Option<String>,
    pub risk: Option<String>,
    pub command: Option<String>,
    pub cwd: Option<String>,
    /// Structured command rendered as one line.
    pub parsed_cmd_text: Option<String>,
    pub change_count: Option<usize>,
    pub changed_paths: Vec<String>,
    pub diff_text: Option<String>,
}

impl PendingApproval {
    /// Best available text of the command being approved.
    #[must_use]
    pub fn command_text(&self) -> Option<&str> {
        self.command.as_deref().or(self.parsed_cmd_text.as_deref())
    }
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

fn parsed_command_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Array(tokens) => Some(
            tokens
                .iter()
                .filter_map(Value::as_str)
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" "),
        ),
        Value::Object(record) => {
            let executable = non_empty(record.get("executable"));
            let args = record
                .get("args")
                .and_then(Value::as_array)
                .map(|args| args.iter().filter_map(Value::as_str).collect::<Vec<_>>())
                .unwrap_or_default();
            if executable.is_none() && args.is_empty() {
                return None;
            }
            let parts: Vec<&str> = executable
                .as_deref()
                .into_iter()
                .chain(args)
                .filter(|p| !p.is_empty())
                .collect();
            Some(parts.join(" "))
        }
        _ => None,
    }
}

fn diff_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Object(record) => ["unified", "unifiedDiff", "patch", "text"]
            .iter()
            .find_map(|key| non_empty(record.get(*key))),
        _ => None,
    }
}

fn apply_file_change_context(approval: &mut PendingApproval, params: &Map<String, Value>) {
    let changes: Vec<&Map<String, Value>> = params
        .get("changes")
        .and_then(Value::as_array)
        .map(|changes| changes.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default();

    approval.changed_paths = changes
        .iter()
        .filter_map(|change| non_empty(change.get("path")))
        .collect();
    if !changes.is_empty() {
        approval.change_count = Some(changes.len());
    }

    approval.diff_text = diff_text(params.get("diff")).or_else(|| {
        let inline: Vec<String> = changes
            .iter()
            .filter_map(|change| diff_text(change.get("diff")))
            .collect();
        (!inline.is_empty()).then(|| inline.join("\n\n"))
    });
}

/// Validates a server-initiated request as an approval.
///
/// # Errors
///
/// [`ApprovalError::UnsupportedMethod`] for any method other than the two
/// approval methods, [`ApprovalError::InvalidPayload`] if `itemId`,
/// `threadId` or `turnId` is missing or empty.
pub fn parse_request(
    request_id: RequestId,
    method: &str,
    params: Option<&Value>,
) -> Result<PendingApproval, ApprovalError> {
    let kind = ApprovalKind::from_method(method)
        .ok_or_else(|| ApprovalError::UnsupportedMethod(method.to_string()))?;
    let empty = Map::new();
    let params = params.and_then(Value::as_object).unwrap_or(&empty);

    let required = |key: &str| {
        non_empty(params.get(key)).ok_or_else(|| ApprovalError::InvalidPayload(method.to_string()))
    };
    let mut approval = PendingApproval {
        request_id,
        kind,
        item_id: required("itemId")?,
        thread_id: required("threadId")?,
        turn_id: required("turnId")?,
        reason: non_empty(params.get("reason")),
        risk: non_empty(params.get("risk")),
        command: non_empty(params.get("command")),
        cwd: non_empty(params.get("cwd")),
        parsed_cmd_text: parsed_command_text(params.get("parsedCmd")),
        change_count: None,
        changed_paths: Vec::new(),
        diff_text: None,
    };
    apply_file_change_context(&mut approval, params);
    Ok(approval)
}
