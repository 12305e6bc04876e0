//! Agent server subprocess: spawn, line-delimited stdio, lifecycle status.
//!
//! The relay owns exactly one agent process. Its stdout is read line by
//! line and surfaced as [`AgentEvent::Stdout`]; lifecycle transitions
//! (`starting → running → stopped | error`) are surfaced as
//! [`AgentEvent::Status`]. Input is written through an unbounded queue so
//! socket handlers never block on the child's stdin.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use agentlink_proto::control::{AgentState, ControlMessage};
use agentlink_proto::now_millis;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// How long an exited agent's stdout may keep draining.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors returned when talking to the agent process.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The stdin writer has shut down (process exited or never started).
    #[error("agent input is closed")]
    InputClosed,
}

/// How to launch the agent server.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// Snapshot of the agent lifecycle, convertible to `appServerStatus`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStatus {
    pub state: AgentState,
    pub timestamp: u64,
    pub message: Option<String>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
}

impl AgentStatus {
    fn new(state: AgentState) -> Self {
        Self {
            state,
            timestamp: now_millis(),
            message: None,
            pid: None,
            exit_code: None,
        }
    }

    /// Initial status before the process is spawned.
    #[must_use]
    pub fn starting() -> Self {
        Self::new(AgentState::Starting)
    }

    fn running(pid: Option<u32>) -> Self {
        Self {
            pid,
            ..Self::new(AgentState::Running)
        }
    }

    fn stopped(exit_code: Option<i32>) -> Self {
        Self {
            exit_code,
            message: Some(match exit_code {
                Some(code) => format!("agent server exited with code {code}"),
                None => "agent server terminated by signal".to_string(),
            }),
            ..Self::new(AgentState::Stopped)
        }
    }

    fn error(message: String) -> Self {
        Self {
            message: Some(message),
            ..Self::new(AgentState::Error)
        }
    }

    /// Renders the status as an `appServerStatus` control message.
    #[must_use]
    pub fn to_control(&self) -> ControlMessage {
        ControlMessage::AppServerStatus {
            state: self.state,
            timestamp: self.timestamp,
            message: self.message.clone(),
            pid: self.pid,
            exit_code: self.exit_code,
        }
    }
}

/// Output of the agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// One line of stdout, without the trailing newline.
    Stdout(String),
    /// Lifecycle transition.
    Status(AgentStatus),
}

/// Handle to the running agent process.
///
/// Dropping the handle (or calling [`AgentProcess::shutdown`]) kills the
/// child.
#[derive(Debug)]
pub struct AgentProcess {
    input: mpsc::UnboundedSender<String>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl AgentProcess {
    /// Spawns the agent and its I/O tasks.
    ///
    /// Never fails: a spawn failure is reported as an `error` status on the
    /// returned event stream, after the initial `starting` status.
    #[must_use]
    pub fn spawn(command: &AgentCommand) -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let _ = event_tx.send(AgentEvent::Status(AgentStatus::starting()));

        let spawned = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(child) => {
                tracing::info!(
                    program = %command.program,
                    pid = ?child.id(),
                    "agent server started"
                );
                wire_child(child, event_tx, input_rx, shutdown_rx);
            }
            Err(e) => {
                tracing::error!(program = %command.program, error = %e, "failed to start agent server");
                let _ = event_tx.send(AgentEvent::Status(AgentStatus::error(format!(
                    "failed to start {}: {e}",
                    command.program
                ))));
            }
        }

        let process = Self {
            input: input_tx,
            shutdown: Some(shutdown_tx),
        };
        (process, event_rx)
    }

    /// Returns a sender that queues lines for the agent's stdin.
    #[must_use]
    pub fn input(&self) -> AgentInput {
        AgentInput(self.input.clone())
    }

    /// Kills the child process. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Cloneable writer for the agent's stdin.
#[derive(Debug, Clone)]
pub struct AgentInput(mpsc::UnboundedSender<String>);

impl AgentInput {
    /// Queues one line; a trailing newline is added by the writer.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::InputClosed`] if the writer task has ended.
    pub fn send_line(&self, line: String) -> Result<(), AgentError> {
        self.0.send(line).map_err(|_| AgentError::InputClosed)
    }

    /// Creates an input whose lines are delivered to `tx`; used by tests.
    #[must_use]
    pub const fn from_sender(tx: mpsc::UnboundedSender<String>) -> Self {
        Self(tx)
    }
}

fn wire_child(
    mut child: Child,
    events: mpsc::UnboundedSender<AgentEvent>,
    input: mpsc::UnboundedReceiver<String>,
    shutdown: oneshot::Receiver<()>,
) {
    let _ = events.send(AgentEvent::Status(AgentStatus::running(child.id())));

    if let Some(stdin) = child.stdin.take() {
        tokio::spawn(stdin_loop(stdin, input));
    }
    let stdout_reader = child.stdout.take().map(|stdout| {
        let events = events.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if events.send(AgentEvent::Stdout(line)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "agent stdout read error");
                        break;
                    }
                }
            }
        })
    });
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(target: "agent", "{line}");
            }
        });
    }
    tokio::spawn(wait_loop(child, stdout_reader, events, shutdown));
}

async fn stdin_loop(mut stdin: ChildStdin, mut input: mpsc::UnboundedReceiver<String>) {
    while let Some(mut line) = input.recv().await {
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "agent stdin write failed");
            break;
        }
        if let Err(e) = stdin.flush().await {
            tracing::warn!(error = %e, "agent stdin flush failed");
            break;
        }
    }
}

async fn wait_loop(
    mut child: Child,
    stdout_reader: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<AgentEvent>,
    shutdown: oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        result = child.wait() => result,
        _ = shutdown => {
            tracing::info!("stopping agent server");
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "failed to kill agent server");
            }
            child.wait().await
        }
    };

    // Final stdout lines go out before the status change. Bounded, since a
    // descendant process may keep the pipe open.
    if let Some(reader) = stdout_reader
        && tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, reader).await.is_err()
    {
        tracing::warn!("agent stdout still open after exit");
    }

    let status = match status {
        Ok(exit) => {
            tracing::info!(status = %exit, "agent server exited");
            AgentStatus::stopped(exit.code())
        }
        Err(e) => {
            tracing::error!(error = %e, "failed waiting for agent server");
            AgentStatus::error(format!("failed waiting for agent server: {e}"))
        }
    };
    let _ = events.send(AgentEvent::Status(status));
}
