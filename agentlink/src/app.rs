//! Console front end state: input parsing and event rendering.
//!
//! Everything here is synchronous and side-effect free; the binary feeds it
//! stdin lines and [`LinkEvent`]s and prints whatever comes back.

use std::collections::HashMap;

use agentlink_proto::control::ControlMessage;
use agentlink_proto::jsonrpc::RequestId;

use crate::approvals::{ApprovalKind, PendingApproval, RiskSummary};
use crate::diagnostics::format_attempt_summary;
use crate::net::{LinkCommand, LinkEvent};
use crate::session::{SessionState, TranscriptItem, TurnStatus};

/// Console help text.
pub const HELP: &str = "\
Commands:
  <text>                      start a turn with <text>
  /approve <id> [settings]    accept an approval, optional acceptSettings JSON
  /decline <id>               decline an approval
  /interrupt                  interrupt the active turn
  /new                        start a new thread with the next prompt
  /connect                    reconnect after /disconnect
  /disconnect                 close the connection
  /help                       show this help
  /quit                       exit";

/// One parsed line of console input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Command(LinkCommand),
    Help,
    Quit,
    /// Nothing to do (blank line).
    Empty,
    /// A malformed command, with the message to show.
    Invalid(String),
}

fn parse_request_id(arg: Option<&str>, usage: &str) -> Result<RequestId, Input> {
    arg.and_then(|raw| raw.parse().ok())
        .ok_or_else(|| Input::Invalid(format!("usage: {usage}")))
}

/// Parses one line typed by the user.
#[must_use]
pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Input::Command(LinkCommand::SendPrompt {
            text: line.to_string(),
        });
    };
    let (name, args) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(name, args)| (name, args.trim()));

    match name {
        "approve" => {
            let (id, settings) = args
                .split_once(char::is_whitespace)
                .map_or((args, None), |(id, settings)| (id, Some(settings.trim())));
            match parse_request_id(Some(id), "/approve <id> [settings-json]") {
                Ok(request_id) => Input::Command(LinkCommand::Approve {
                    request_id,
                    accept_settings: settings.filter(|s| !s.is_empty()).map(str::to_string),
                }),
                Err(invalid) => invalid,
            }
        }
        "decline" => match parse_request_id(args.split_whitespace().next(), "/decline <id>") {
            Ok(request_id) => Input::Command(LinkCommand::Decline { request_id }),
            Err(invalid) => invalid,
        },
        "interrupt" => Input::Command(LinkCommand::Interrupt),
        "new" => Input::Command(LinkCommand::NewThread),
        "connect" => Input::Command(LinkCommand::Connect),
        "disconnect" => Input::Command(LinkCommand::Disconnect),
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => Input::Invalid(format!("unknown command /{other} (try /help)")),
    }
}

/// Prints transcript items once they stop changing.
///
/// The last item of a running turn may still be streaming, so it is held
/// back until another item follows it or the turn settles.
#[derive(Debug, Default)]
pub struct TranscriptPrinter {
    shown: HashMap<String, String>,
}

impl TranscriptPrinter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines for items that are new or changed since the last call.
    pub fn render(&mut self, session: &SessionState) -> Vec<String> {
        let transcript = session.transcript();
        let streaming = session.turn_status() == TurnStatus::InProgress;
        let mut lines = Vec::new();
        for (index, item) in transcript.iter().enumerate() {
            if streaming && index + 1 == transcript.len() {
                break;
            }
            if item.text.is_empty() && item.title.is_empty() {
                continue;
            }
            if self.shown.get(&item.id) == Some(&item.text) {
                continue;
            }
            self.shown.insert(item.id.clone(), item.text.clone());
            lines.push(render_item(item));
        }
        lines
    }

    /// Forgets what was printed, e.g. after switching threads.
    pub fn reset(&mut self) {
        self.shown.clear();
    }
}

fn render_item(item: &TranscriptItem) -> String {
    if item.text.is_empty() {
        format!("[{}]", item.title)
    } else if item.text.contains('\n') {
        format!("[{}]\n{}", item.title, item.text)
    } else {
        format!("[{}] {}", item.title, item.text)
    }
}

/// Lines describing an approval request.
#[must_use]
pub fn render_approval(approval: &PendingApproval, risk: &RiskSummary) -> Vec<String> {
    let id = approval.request_id;
    let mut lines = vec![match approval.kind {
        ApprovalKind::CommandExecution => format!(
            "Approval #{id} [{}] run: {}",
            risk.label(),
            approval.command_text().unwrap_or("(unknown command)")
        ),
        ApprovalKind::FileChange => format!(
            "Approval #{id} [{}] change {} file(s)",
            risk.label(),
            approval.change_count.unwrap_or(approval.changed_paths.len())
        ),
    }];
    if let Some(cwd) = &approval.cwd {
        lines.push(format!("  cwd: {cwd}"));
    }
    for path in &approval.changed_paths {
        lines.push(format!("  {path}"));
    }
    if let Some(reason) = &approval.reason {
        lines.push(format!("  reason: {reason}"));
    }
    for reason in &risk.reasons {
        lines.push(format!("  ! {}", reason.text));
    }
    lines.push(format!("  /approve {id}  or  /decline {id}"));
    lines
}

/// Lines for one link event. Session events go through `printer`.
pub fn render_event(event: &LinkEvent, printer: &mut TranscriptPrinter) -> Vec<String> {
    match event {
        LinkEvent::State(state) => vec![format!("* connection {state}")],
        LinkEvent::Connected { attempts, .. } => attempts
            .iter()
            .map(|attempt| format!("* {}", format_attempt_summary(attempt)))
            .collect(),
        LinkEvent::ConnectFailed { hint, attempts } => attempts
            .iter()
            .map(|attempt| format!("* {}", format_attempt_summary(attempt)))
            .chain(std::iter::once(format!("* {hint}")))
            .collect(),
        LinkEvent::Bootstrapped(snapshot) => {
            let mut lines = vec![format!(
                "* ready (auth: {}, {} models, {} recent threads)",
                snapshot.account.auth_mode,
                snapshot.models.len(),
                snapshot.threads.len()
            )];
            if snapshot.account.requires_openai_auth && snapshot.account.auth_mode == "none" {
                lines.push("* the agent is not signed in".to_string());
            }
            lines
        }
        LinkEvent::Session(session) => {
            if session.transcript().is_empty() {
                printer.reset();
            }
            printer.render(session)
        }
        LinkEvent::ApprovalRequested { approval, risk } => render_approval(approval, risk),
        LinkEvent::ApprovalResolved {
            request_id,
            decision,
        } => vec![format!("* approval #{request_id}: {decision}")],
        LinkEvent::ApprovalsDeclined { count } => {
            vec![format!("* {count} pending approval(s) auto-declined")]
        }
        LinkEvent::Latency(_) => Vec::new(),
        LinkEvent::HeartbeatMissed { consecutive } => {
            vec![format!("* bridge not responding ({consecutive} missed)")]
        }
        LinkEvent::ReconnectScheduled { attempt, delay } => vec![format!(
            "* reconnecting in {:.1}s (attempt {attempt})",
            delay.as_secs_f64()
        )],
        LinkEvent::Control(message) => render_control(message).into_iter().collect(),
        LinkEvent::Error(message) => vec![format!("! {message}")],
    }
}

fn render_control(message: &ControlMessage) -> Option<String> {
    match message {
        ControlMessage::Hello { name, cwd, .. } => Some(format!("* bridge {name} ({cwd})")),
        ControlMessage::AppServerStatus { state, message, .. } => Some(match message {
            Some(message) => format!("* agent {}: {message}", state.as_str()),
            None => format!("* agent {}", state.as_str()),
        }),
        ControlMessage::AuthBrowserLaunch { url, success, .. } => Some(if *success {
            format!("* opened login page on the host: {url}")
        } else {
            format!("* open this URL to sign in: {url}")
        }),
        ControlMessage::Error { code, message } => Some(format!("! bridge error {code}: {message}")),
        ControlMessage::Ping { .. } | ControlMessage::Pong { .. } | ControlMessage::ClientLog { .. } => {
            None
        }
    }
}
