//! Post-handshake bootstrap: account, models and recent threads.

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::rpc::{RpcClient, RpcError};

/// How many models and threads the bootstrap asks for.
pub const BOOTSTRAP_PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSnapshot {
    /// `account.type`, `"unknown"` for an untyped account, `"none"` without one.
    pub auth_mode: String,
    pub requires_openai_auth: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelOption {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadSummary {
    pub id: String,
    pub preview: String,
    pub model_provider: Option<String>,
    pub created_at: Option<f64>,
    pub updated_at: Option<f64>,
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapSnapshot {
    pub account: AccountSnapshot,
    pub models: Vec<ModelOption>,
    pub threads: Vec<ThreadSummary>,
    pub thread_next_cursor: Option<String>,
}

fn objects(value: Option<&Value>) -> impl Iterator<Item = &Map<String, Value>> {
    value
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

fn string(record: &Map<String, Value>, key: &str) -> Option<String> {
    record.get(key).and_then(Value::as_str).map(str::to_string)
}

#[must_use]
pub fn parse_account(result: &Value) -> AccountSnapshot {
    let account = result.get("account").and_then(Value::as_object);
    let auth_mode = match account {
        Some(account) => string(account, "type").unwrap_or_else(|| "unknown".to_string()),
        None => "none".to_string(),
    };
    AccountSnapshot {
        auth_mode,
        requires_openai_auth: result
            .get("requiresOpenaiAuth")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

#[must_use]
pub fn parse_models(result: &Value) -> Vec<ModelOption> {
    objects(result.get("data"))
        .map(|model| {
            let id = string(model, "id")
                .or_else(|| string(model, "model"))
                .unwrap_or_else(|| "unknown-model".to_string());
            let display_name = string(model, "displayName").unwrap_or_else(|| id.clone());
            ModelOption { id, display_name }
        })
        .collect()
}

/// Parses a `thread/list` page into summaries and the next cursor.
#[must_use]
pub fn parse_thread_page(result: &Value) -> (Vec<ThreadSummary>, Option<String>) {
    let threads = objects(result.get("data"))
        .map(|thread| ThreadSummary {
            id: string(thread, "id").unwrap_or_else(|| "unknown-thread".to_string()),
            preview: string(thread, "preview")
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| "(empty thread)".to_string()),
            model_provider: string(thread, "modelProvider"),
            created_at: thread.get("createdAt").and_then(Value::as_f64),
            updated_at: thread.get("updatedAt").and_then(Value::as_f64),
            archived: thread.get("archived").and_then(Value::as_bool) == Some(true),
        })
        .collect();
    let next_cursor = result
        .get("nextCursor")
        .and_then(Value::as_str)
        .map(str::to_string);
    (threads, next_cursor)
}

/// Reads account, models and recent threads after `initialize`.
///
/// # Errors
///
/// Propagates the first failing request.
pub async fn bootstrap(client: &RpcClient) -> Result<BootstrapSnapshot, RpcError> {
    let account = parse_account(
        &client
            .request("account/read", Some(json!({ "refreshToken": false })))
            .await?,
    );
    let models = parse_models(
        &client
            .request("model/list", Some(json!({ "limit": BOOTSTRAP_PAGE_SIZE })))
            .await?,
    );
    let (threads, thread_next_cursor) = parse_thread_page(
        &client
            .request(
                "thread/list",
                Some(json!({ "limit": BOOTSTRAP_PAGE_SIZE, "sortKey": "updated_at" })),
            )
            .await?,
    );
    tracing::info!(
        auth_mode = %account.auth_mode,
        models = models.len(),
        threads = threads.len(),
        "bootstrap complete"
    );
    Ok(BootstrapSnapshot {
        account,
        models,
        threads,
        thread_next_cursor,
    })
}

/// Sandbox applied to a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SandboxMode {
    /// Read-only, no network.
    ReadOnly,
    /// May write inside the working directory.
    #[default]
    WorkspaceWrite,
}

/// Overrides shared by `thread/start` and `turn/start`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnSettings {
    pub model: Option<String>,
    pub sandbox: SandboxMode,
    pub network_access: bool,
    pub cwd: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SandboxPolicy<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    writable_roots: Option<[&'a str; 1]>,
    network_access: bool,
}

impl TurnSettings {
    fn overrides(&self) -> Map<String, Value> {
        let policy = match self.sandbox {
            SandboxMode::ReadOnly => SandboxPolicy {
                kind: "readOnly",
                writable_roots: None,
                network_access: false,
            },
            SandboxMode::WorkspaceWrite => SandboxPolicy {
                kind: "workspaceWrite",
                writable_roots: self.cwd.as_deref().map(|cwd| [cwd]),
                network_access: self.network_access,
            },
        };
        let mut map = Map::new();
        if let Some(model) = &self.model {
            map.insert("model".into(), Value::String(model.clone()));
        }
        map.insert("approvalPolicy".into(), Value::String("unlessTrusted".into()));
        map.insert(
            "sandboxPolicy".into(),
            serde_json::to_value(policy).unwrap_or(Value::Null),
        );
        if let Some(cwd) = &self.cwd {
            map.insert("cwd".into(), Value::String(cwd.clone()));
        }
        map
    }
}

/// Parameters for `thread/start`.
#[must_use]
pub fn thread_start_params(settings: &TurnSettings) -> Value {
    Value::Object(settings.overrides())
}

/// Parameters for `turn/start` carrying `prompt` as text input.
#[must_use]
pub fn turn_start_params(thread_id: &str, prompt: &str, settings: &TurnSettings) -> Value {
    let mut map = settings.overrides();
    map.insert("threadId".into(), Value::String(thread_id.to_string()));
    map.insert("input".into(), json!([{ "type": "text", "text": prompt }]));
    Value::Object(map)
}

/// Thread id from a `thread/start` or `thread/resume` result.
#[must_use]
pub fn thread_id_of(result: &Value) -> Option<&str> {
    result
        .get("thread")
        .and_then(|thread| thread.get("id"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}
