//! Session transcript reducer.
//!
//! [`SessionState::apply`] folds agent notifications into an ordered,
//! id-keyed transcript plus thread and turn cursors. The fold is pure: the
//! same notification sequence always yields the same state, so it can be
//! replayed in tests.
//!
//! Items are upserted by id, never removed, and streaming deltas append to
//! the item's text buffer. Unknown methods leave the state untouched.

pub mod items;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use items::{ItemKind, TranscriptItem};

use items::{extract_diff, from_agent_item, render_plan, str_field};

/// Lifecycle of the active turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TurnStatus {
    #[default]
    Idle,
    InProgress,
    Completed,
    Failed,
    Interrupted,
}

impl TurnStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Interrupted)
    }

    /// Maps a `turn.status` value reported on completion.
    fn from_completion(status: Option<&str>) -> Self {
        match status {
            Some("failed") => Self::Failed,
            Some("interrupted") => Self::Interrupted,
            _ => Self::Completed,
        }
    }
}

/// Streaming delta methods and the item they create when the id is new.
struct DeltaTarget {
    kind: ItemKind,
    title: &'static str,
    text_keys: &'static [&'static str],
}

const TEXT_DELTA_KEYS: &[&str] = &["delta", "textDelta", "text"];
const OUTPUT_DELTA_KEYS: &[&str] = &["delta", "outputDelta", "text"];

fn delta_target(method: &str) -> Option<DeltaTarget> {
    let (kind, title, text_keys) = match method {
        "item/agentMessage/delta" => (ItemKind::AgentMessage, "Agent", TEXT_DELTA_KEYS),
        "item/plan/delta" => (ItemKind::Plan, "Plan", TEXT_DELTA_KEYS),
        "item/reasoning/summaryTextDelta" => (ItemKind::Reasoning, "Reasoning", TEXT_DELTA_KEYS),
        "item/commandExecution/outputDelta" => {
            (ItemKind::CommandExecution, "Command", OUTPUT_DELTA_KEYS)
        }
        "item/fileChange/outputDelta" => (ItemKind::FileChange, "File change", OUTPUT_DELTA_KEYS),
        _ => return None,
    };
    Some(DeltaTarget {
        kind,
        title,
        text_keys,
    })
}

/// Transcript and cursors for one client session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    active_thread_id: Option<String>,
    active_turn_id: Option<String>,
    turn_status: TurnStatus,
    transcript: Vec<TranscriptItem>,
    positions: HashMap<String, usize>,
    local_message_counter: u64,
    anonymous_item_counter: u64,
}

impl SessionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn active_thread_id(&self) -> Option<&str> {
        self.active_thread_id.as_deref()
    }

    #[must_use]
    pub fn active_turn_id(&self) -> Option<&str> {
        self.active_turn_id.as_deref()
    }

    #[must_use]
    pub const fn turn_status(&self) -> TurnStatus {
        self.turn_status
    }

    #[must_use]
    pub fn transcript(&self) -> &[TranscriptItem] {
        &self.transcript
    }

    #[must_use]
    pub fn item(&self, id: &str) -> Option<&TranscriptItem> {
        self.positions.get(id).map(|&index| &self.transcript[index])
    }

    /// Folds one notification into the state.
    #[must_use]
    pub fn apply(mut self, method: &str, params: Option<&Value>) -> Self {
        let params = params.and_then(Value::as_object);
        match method {
            "thread/started" => {
                if let Some(id) = str_field(nested(params, "thread"), &["id"]) {
                    self.active_thread_id = Some(id.to_string());
                }
            }
            "turn/started" => {
                let turn_id = str_field(nested(params, "turn"), &["id"]).map(str::to_string);
                self.start_turn(turn_id);
            }
            "turn/completed" => self.complete_turn(nested(params, "turn")),
            "item/started" | "item/completed" => {
                if let Some(item) = nested(params, "item") {
                    let item = from_agent_item(item, || self.next_anonymous_id());
                    self.upsert(item);
                }
            }
            "turn/plan/updated" => {
                if let (Some(turn_id), Some(text)) =
                    (str_field(params, &["turnId"]), render_plan(params))
                {
                    self.upsert(TranscriptItem::new(
                        format!("plan-{turn_id}"),
                        ItemKind::Plan,
                        "Plan update",
                        text,
                    ));
                }
            }
            "turn/diff/updated" => {
                if let Some(diff) = extract_diff(params) {
                    let turn_id = str_field(params, &["turnId"])
                        .or(self.active_turn_id.as_deref())
                        .unwrap_or("unknown-turn");
                    let item = TranscriptItem::new(
                        format!("diff-{turn_id}"),
                        ItemKind::Diff,
                        "Turn diff",
                        diff,
                    );
                    self.upsert(item);
                }
            }
            other => {
                if let Some(target) = delta_target(other) {
                    self.apply_delta(&target, params);
                }
            }
        }
        self
    }

    /// Appends the user's prompt under a local id so it shows before the
    /// server acknowledges the turn.
    #[must_use]
    pub fn append_local_user_prompt(mut self, text: &str) -> Self {
        self.local_message_counter += 1;
        let id = format!("local-user-{}", self.local_message_counter);
        self.upsert(TranscriptItem::new(id, ItemKind::UserMessage, "User", text));
        self
    }

    /// Records the turn returned by a `turn/start` response, including any
    /// items it already carries.
    #[must_use]
    pub fn apply_turn_start_result(mut self, result: &Value) -> Self {
        let turn = nested(result.as_object(), "turn");
        let turn_id = str_field(turn, &["id"]).map(str::to_string);
        self.start_turn(turn_id);
        let items = turn
            .and_then(|t| t.get("items"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_object);
        for item in items {
            let item = from_agent_item(item, || self.next_anonymous_id());
            self.upsert(item);
        }
        self
    }

    /// Switches to `thread_id`. Leaving another thread clears the transcript
    /// and turn cursor; adopting a first thread keeps local prompts.
    #[must_use]
    pub fn set_active_thread(mut self, thread_id: &str) -> Self {
        if let Some(current) = &self.active_thread_id
            && current != thread_id
        {
            self.reset_turn_and_transcript();
        }
        self.active_thread_id = Some(thread_id.to_string());
        self
    }

    /// Forgets the active thread so the next prompt starts a new one.
    #[must_use]
    pub fn start_new_thread(mut self) -> Self {
        self.reset_turn_and_transcript();
        self.active_thread_id = None;
        self
    }

    fn reset_turn_and_transcript(&mut self) {
        self.active_turn_id = None;
        self.turn_status = TurnStatus::Idle;
        self.transcript.clear();
        self.positions.clear();
    }

    fn start_turn(&mut self, turn_id: Option<String>) {
        if self.turn_status.is_terminal() {
            self.turn_status = TurnStatus::Idle;
        }
        if self.turn_status == TurnStatus::InProgress && self.active_turn_id != turn_id {
            tracing::debug!(
                previous = ?self.active_turn_id,
                next = ?turn_id,
                "turn started while another turn is in progress"
            );
        }
        self.active_turn_id = turn_id;
        self.turn_status = TurnStatus::InProgress;
    }

    fn complete_turn(&mut self, turn: Option<&Map<String, Value>>) {
        if self.turn_status != TurnStatus::InProgress {
            tracing::debug!(status = ?self.turn_status, "ignoring turn/completed outside a turn");
            return;
        }
        if let (Some(active), Some(completed)) =
            (self.active_turn_id.as_deref(), str_field(turn, &["id"]))
            && active != completed
        {
            tracing::debug!(active, completed, "ignoring completion of a stale turn");
            return;
        }
        self.turn_status = TurnStatus::from_completion(str_field(turn, &["status"]));
        self.active_turn_id = None;
    }

    fn apply_delta(&mut self, target: &DeltaTarget, params: Option<&Map<String, Value>>) {
        let (Some(item_id), Some(delta)) = (
            str_field(params, &["itemId", "id"]),
            str_field(params, target.text_keys),
        ) else {
            return;
        };
        match self.positions.get(item_id) {
            Some(&index) => self.transcript[index].append(delta),
            None => self.upsert(TranscriptItem::new(
                item_id,
                target.kind,
                target.title,
                delta,
            )),
        }
    }

    fn upsert(&mut self, item: TranscriptItem) {
        match self.positions.get(&item.id) {
            Some(&index) => self.transcript[index].merge(item),
            None => {
                self.positions.insert(item.id.clone(), self.transcript.len());
                self.transcript.push(item);
            }
        }
    }

    fn next_anonymous_id(&mut self) -> String {
        self.anonymous_item_counter += 1;
        format!("item-{}", self.anonymous_item_counter)
    }
}

fn nested<'a>(record: Option<&'a Map<String, Value>>, key: &str) -> Option<&'a Map<String, Value>> {
    record?.get(key)?.as_object()
}
