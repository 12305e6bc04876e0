//! Link driver: keeps one bridge connection alive and turns its traffic into
//! [`LinkEvent`]s.
//!
//! # Architecture
//!
//! ```text
//! caller ── LinkCommand ──→ driver task ──→ RpcClient ⇄ relay socket
//!        ←── LinkEvent ────      ↑
//!                                └── Internal (handler callbacks, heartbeat,
//!                                    spawned requests)
//! ```
//!
//! The driver task owns all mutable state: the connection state machine, the
//! transcript reducer, the heartbeat handle and the reconnect timer. Socket
//! callbacks never touch that state directly; they queue an [`Internal`]
//! event tagged with the connection epoch, so events from a connection that
//! has since been torn down are dropped.
//!
//! Dialling and the `initialize`/bootstrap handshake run on their own tasks
//! and report back through the same queues, so commands are served while a
//! connection is being established. Traffic that arrives before the
//! handshake completes is held and replayed right after
//! [`LinkEvent::Bootstrapped`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use agentlink_proto::control::ControlMessage;
use agentlink_proto::jsonrpc::RequestId;
use agentlink_proto::pairing::{EndpointKind, PairingPayload};
use futures_util::{Sink, Stream};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::approvals::{
    self, ApprovalCorrelator, ApprovalError, Decision, PendingApproval, RiskSummary,
    build_response, summarize_risk,
};
use crate::bootstrap::{
    self, BootstrapSnapshot, TurnSettings, thread_id_of, thread_start_params, turn_start_params,
};
use crate::config::ClientConfig;
use crate::connect::{self, ConnectError, ConnectionAttempt, ConnectionResult, Dialer};
use crate::diagnostics::{build_connection_hint, format_attempt_summary};
use crate::heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatEvent};
use crate::reconnect::ReconnectPolicy;
use crate::rpc::{ClientInfo, RpcClient, RpcError, RpcHandler, ServerReply, ServerRequest};
use crate::session::SessionState;

/// Lifecycle of the bridge connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Whether the machine may move from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle | Self::Closed, Self::Connecting)
                | (Self::Connecting, Self::Open | Self::Closing | Self::Closed)
                | (Self::Open, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commands accepted by the link driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// Start a turn with `text`, starting a thread first if none is active.
    SendPrompt { text: String },
    /// Accept a pending approval, optionally with `acceptSettings` JSON text.
    Approve {
        request_id: RequestId,
        accept_settings: Option<String>,
    },
    /// Decline a pending approval.
    Decline { request_id: RequestId },
    /// Interrupt the active turn.
    Interrupt,
    /// Forget the active thread; the next prompt starts a new one.
    NewThread,
    /// Connect now if the link is idle or closed.
    Connect,
    /// Close the connection without scheduling a reconnect.
    Disconnect,
    /// Close the connection and stop the driver.
    Shutdown,
}

/// Events published by the link driver.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The connection state machine moved.
    State(ConnectionState),
    /// A socket opened; `attempts` is the full attempt log.
    Connected {
        endpoint: EndpointKind,
        attempts: Vec<ConnectionAttempt>,
    },
    /// No endpoint could be reached.
    ConnectFailed {
        hint: &'static str,
        attempts: Vec<ConnectionAttempt>,
    },
    /// `initialize` and the bootstrap reads completed.
    Bootstrapped(BootstrapSnapshot),
    /// The transcript or turn cursor changed.
    Session(SessionState),
    /// The agent asked for an approval.
    ApprovalRequested {
        approval: PendingApproval,
        risk: RiskSummary,
    },
    /// A user decision was delivered.
    ApprovalResolved {
        request_id: RequestId,
        decision: Decision,
    },
    /// Pending approvals were auto-declined by a disconnect or reconnect.
    ApprovalsDeclined { count: usize },
    /// Round-trip time of a heartbeat ping.
    Latency(u64),
    /// A heartbeat pong did not arrive in time.
    HeartbeatMissed { consecutive: u32 },
    /// A reconnect attempt is due after `delay`.
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// A control message other than `pong`.
    Control(ControlMessage),
    /// A failure that did not change the connection state.
    Error(String),
}

/// Events queued for the driver by callbacks and helper tasks.
#[derive(Debug)]
enum Internal {
    Control {
        epoch: u64,
        message: ControlMessage,
    },
    Notification {
        epoch: u64,
        method: String,
        params: Option<Value>,
    },
    Approval {
        epoch: u64,
        approval: PendingApproval,
    },
    Closed {
        epoch: u64,
        reason: RpcError,
    },
    Heartbeat {
        epoch: u64,
        event: HeartbeatEvent,
    },
    ThreadStarted {
        epoch: u64,
        thread_id: String,
        prompt: String,
    },
    TurnStarted {
        epoch: u64,
        result: Value,
    },
    Handshake {
        epoch: u64,
        outcome: Result<BootstrapSnapshot, RpcError>,
    },
    RequestFailed(String),
}

impl Internal {
    /// Epoch of socket traffic that is held back until the handshake ends.
    const fn traffic_epoch(&self) -> Option<u64> {
        match self {
            Self::Control { epoch, .. }
            | Self::Notification { epoch, .. }
            | Self::Approval { epoch, .. } => Some(*epoch),
            _ => None,
        }
    }
}

/// Outcome of a dial task.
struct Dialed<S> {
    epoch: u64,
    result: Result<ConnectionResult<S>, ConnectError>,
}

/// Routes RPC callbacks for one connection into the driver queue.
struct LinkHandler {
    epoch: u64,
    internal: mpsc::UnboundedSender<Internal>,
    approvals: Arc<ApprovalCorrelator>,
}

impl LinkHandler {
    fn queue(&self, event: Internal) {
        if self.internal.send(event).is_err() {
            tracing::debug!("link driver gone; dropping event");
        }
    }
}

impl RpcHandler for LinkHandler {
    fn on_control(&self, message: ControlMessage) {
        self.queue(Internal::Control {
            epoch: self.epoch,
            message,
        });
    }

    fn on_notification(&self, method: &str, params: Option<Value>) {
        self.queue(Internal::Notification {
            epoch: self.epoch,
            method: method.to_string(),
            params,
        });
    }

    fn on_server_request(&self, request: ServerRequest) -> Option<ServerReply> {
        match approvals::parse_request(request.id, &request.method, request.params.as_ref()) {
            Ok(approval) => {
                // Registered before the driver hears about it.
                let reply = self.approvals.enqueue(approval.clone());
                self.queue(Internal::Approval {
                    epoch: self.epoch,
                    approval,
                });
                Some(Box::pin(async move {
                    serde_json::to_value(reply.await).map_err(|e| e.to_string())
                }))
            }
            Err(ApprovalError::UnsupportedMethod(_)) => None,
            Err(e) => {
                tracing::warn!(method = %request.method, error = %e, "rejecting server request");
                Some(Box::pin(async move { Err(e.to_string()) }))
            }
        }
    }

    fn on_close(&self, reason: &RpcError) {
        self.queue(Internal::Closed {
            epoch: self.epoch,
            reason: reason.clone(),
        });
    }
}

/// Handle to a running link driver.
///
/// Dropping the handle closes the command channel, which stops the driver.
pub struct Link {
    commands: mpsc::UnboundedSender<LinkCommand>,
    task: JoinHandle<()>,
}

impl Link {
    /// Spawns the driver and starts the first connection attempt.
    ///
    /// Returns the handle and the receiving end of the event channel.
    pub fn spawn<D>(
        config: &ClientConfig,
        payload: PairingPayload,
        settings: TurnSettings,
        dialer: D,
    ) -> (Self, mpsc::Receiver<LinkEvent>)
    where
        D: Dialer + 'static,
        D::Socket: Stream<Item = Result<Message, tungstenite::Error>>
            + Sink<Message, Error = tungstenite::Error>
            + Unpin,
    {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (dialed_tx, dialed_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            payload,
            settings,
            dialer: Arc::new(dialer),
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            heartbeat_config: config.heartbeat,
            reconnect: config.reconnect,
            events,
            internal_tx,
            dialed_tx,
            state: ConnectionState::Idle,
            session: SessionState::new(),
            approvals: Arc::new(ApprovalCorrelator::new(config.approval_timeout)),
            rpc: None,
            heartbeat: None,
            dial_task: None,
            handshake_task: None,
            deferred: Vec::new(),
            epoch: 0,
            attempt: 0,
            reconnect_at: None,
        };
        let task = tokio::spawn(driver.run(command_rx, internal_rx, dialed_rx));
        (Self { commands, task }, event_rx)
    }

    /// Queues `command`. Returns `false` if the driver has stopped.
    pub fn send(&self, command: LinkCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Stops the driver and waits for it to finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(LinkCommand::Shutdown);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "link driver task failed");
        }
    }
}

struct Driver<D: Dialer> {
    payload: PairingPayload,
    settings: TurnSettings,
    dialer: Arc<D>,
    connect_timeout: Duration,
    request_timeout: Duration,
    heartbeat_config: HeartbeatConfig,
    reconnect: ReconnectPolicy,
    events: mpsc::Sender<LinkEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    dialed_tx: mpsc::UnboundedSender<Dialed<D::Socket>>,
    state: ConnectionState,
    session: SessionState,
    approvals: Arc<ApprovalCorrelator>,
    rpc: Option<Arc<RpcClient>>,
    heartbeat: Option<Heartbeat>,
    dial_task: Option<JoinHandle<()>>,
    handshake_task: Option<JoinHandle<()>>,
    /// Traffic received while the handshake is still running.
    deferred: Vec<Internal>,
    /// Incremented per connection attempt; tags every [`Internal`] event.
    epoch: u64,
    /// Reconnect attempts since the last successful bootstrap.
    attempt: u32,
    /// At most one reconnect is ever scheduled.
    reconnect_at: Option<Instant>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<D> Driver<D>
where
    D: Dialer + 'static,
    D::Socket: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<LinkCommand>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut dialed: mpsc::UnboundedReceiver<Dialed<D::Socket>>,
    ) {
        self.connect().await;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(LinkCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = internal.recv() => self.handle_internal(event).await,
                Some(outcome) = dialed.recv() => self.on_dialed(outcome).await,
                () = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.connect().await;
                }
            }
        }
        self.drop_connection(true).await;
        tracing::info!("link driver stopped");
    }

    async fn emit(&self, event: LinkEvent) {
        if self.events.send(event).await.is_err() {
            tracing::trace!("link event receiver dropped");
        }
    }

    async fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            tracing::debug!(from = %self.state, to = %next, "ignoring invalid state transition");
            return;
        }
        tracing::debug!(from = %self.state, to = %next, "connection state changed");
        self.state = next;
        self.emit(LinkEvent::State(next)).await;
    }

    fn is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch && self.rpc.is_some()
    }

    /// The RPC client, only while the connection is open.
    fn open_client(&self) -> Option<Arc<RpcClient>> {
        if self.state == ConnectionState::Open {
            self.rpc.clone()
        } else {
            None
        }
    }

    async fn decline_pending(&self) {
        let count = self.approvals.decline_all();
        if count > 0 {
            self.emit(LinkEvent::ApprovalsDeclined { count }).await;
        }
    }

    /// Starts a connection attempt; the dial result arrives as [`Dialed`].
    async fn connect(&mut self) {
        self.decline_pending().await;
        self.epoch += 1;
        let epoch = self.epoch;
        self.set_state(ConnectionState::Connecting).await;

        let dialer = Arc::clone(&self.dialer);
        let payload = self.payload.clone();
        let timeout = self.connect_timeout;
        let dialed = self.dialed_tx.clone();
        self.dial_task = Some(tokio::spawn(async move {
            let result = connect::connect(&payload, timeout, dialer.as_ref()).await;
            let _ = dialed.send(Dialed { epoch, result });
        }));
    }

    async fn on_dialed(&mut self, dialed: Dialed<D::Socket>) {
        if dialed.epoch != self.epoch || self.state != ConnectionState::Connecting {
            tracing::trace!(epoch = dialed.epoch, "dropping dial result from a previous attempt");
            return;
        }
        self.dial_task = None;
        let epoch = dialed.epoch;

        let result = match dialed.result {
            Ok(result) => result,
            Err(e) => {
                let hint = build_connection_hint(e.attempts());
                tracing::warn!(error = %e, hint, "bridge unreachable");
                self.emit(LinkEvent::ConnectFailed {
                    hint,
                    attempts: e.attempts().to_vec(),
                })
                .await;
                self.set_state(ConnectionState::Closed).await;
                self.schedule_reconnect().await;
                return;
            }
        };
        for attempt in &result.attempts {
            tracing::info!("{}", format_attempt_summary(attempt));
        }
        self.emit(LinkEvent::Connected {
            endpoint: result.endpoint,
            attempts: result.attempts,
        })
        .await;

        let handler = Arc::new(LinkHandler {
            epoch,
            internal: self.internal_tx.clone(),
            approvals: Arc::clone(&self.approvals),
        });
        let rpc = Arc::new(RpcClient::new(
            result.socket,
            handler,
            self.request_timeout,
        ));
        self.rpc = Some(Arc::clone(&rpc));

        let internal = self.internal_tx.clone();
        self.handshake_task = Some(tokio::spawn(async move {
            let outcome = handshake(&rpc).await;
            let _ = internal.send(Internal::Handshake { epoch, outcome });
        }));
    }

    async fn finish_handshake(&mut self, outcome: Result<BootstrapSnapshot, RpcError>) {
        self.handshake_task = None;
        let snapshot = match outcome {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "bridge handshake failed");
                self.emit(LinkEvent::Error(e.to_string())).await;
                self.drop_connection(false).await;
                return;
            }
        };
        let Some(rpc) = self.rpc.clone() else {
            return;
        };

        self.attempt = 0;
        self.set_state(ConnectionState::Open).await;
        self.emit(LinkEvent::Bootstrapped(snapshot)).await;
        self.start_heartbeat(&rpc, self.epoch);
        for event in std::mem::take(&mut self.deferred) {
            self.handle_traffic(event).await;
        }
    }

    fn start_heartbeat(&mut self, rpc: &Arc<RpcClient>, epoch: u64) {
        let client = Arc::downgrade(rpc);
        let send_ping = move |t| {
            client
                .upgrade()
                .is_some_and(|rpc| rpc.send_control(&ControlMessage::Ping { t }).is_ok())
        };

        let (events, mut event_rx) = mpsc::unbounded_channel();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if internal.send(Internal::Heartbeat { epoch, event }).is_err() {
                    break;
                }
            }
        });

        match Heartbeat::start(self.heartbeat_config, send_ping, events) {
            Ok(heartbeat) => self.heartbeat = Some(heartbeat),
            Err(e) => tracing::error!(error = %e, "heartbeat not started"),
        }
    }

    /// Tears the current connection down. Unless `user_initiated`, exactly
    /// one reconnect is scheduled.
    async fn drop_connection(&mut self, user_initiated: bool) {
        for task in [self.dial_task.take(), self.handshake_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        self.deferred.clear();
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
        self.decline_pending().await;
        if let Some(rpc) = self.rpc.take() {
            self.set_state(ConnectionState::Closing).await;
            rpc.close();
            rpc.dispose();
        }
        self.set_state(ConnectionState::Closed).await;

        if user_initiated {
            self.reconnect_at = None;
        } else {
            self.schedule_reconnect().await;
        }
    }

    async fn schedule_reconnect(&mut self) {
        if self.reconnect_at.is_some() {
            return;
        }
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.reconnect.delay(self.attempt);
        self.reconnect_at = Some(Instant::now() + delay);
        tracing::info!(
            attempt = self.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnect scheduled"
        );
        self.emit(LinkEvent::ReconnectScheduled {
            attempt: self.attempt,
            delay,
        })
        .await;
    }

    async fn handle_command(&mut self, command: LinkCommand) {
        match command {
            LinkCommand::SendPrompt { text } => self.send_prompt(&text).await,
            LinkCommand::Approve {
                request_id,
                accept_settings,
            } => self.approve(request_id, accept_settings.as_deref()).await,
            LinkCommand::Decline { request_id } => {
                if self
                    .approvals
                    .resolve_decision(request_id, Decision::Decline)
                {
                    self.emit(LinkEvent::ApprovalResolved {
                        request_id,
                        decision: Decision::Decline,
                    })
                    .await;
                } else {
                    self.emit(no_such_approval(request_id)).await;
                }
            }
            LinkCommand::Interrupt => self.interrupt().await,
            LinkCommand::NewThread => {
                self.session = std::mem::take(&mut self.session).start_new_thread();
                self.emit(LinkEvent::Session(self.session.clone())).await;
            }
            LinkCommand::Connect => {
                if matches!(
                    self.state,
                    ConnectionState::Idle | ConnectionState::Closed
                ) {
                    self.reconnect_at = None;
                    self.attempt = 0;
                    self.connect().await;
                }
            }
            LinkCommand::Disconnect => {
                tracing::info!("disconnect requested");
                self.drop_connection(true).await;
            }
            // Handled by the run loop.
            LinkCommand::Shutdown => {}
        }
    }

    async fn approve(&mut self, request_id: RequestId, accept_settings: Option<&str>) {
        let Some(approval) = self.approvals.get(request_id) else {
            self.emit(no_such_approval(request_id)).await;
            return;
        };
        let response = match build_response(approval.kind, Decision::Accept, accept_settings) {
            Ok(response) => response,
            Err(e) => {
                // The approval stays pending so the user can try again.
                self.emit(LinkEvent::Error(e.to_string())).await;
                return;
            }
        };
        if self.approvals.resolve(request_id, response) {
            self.emit(LinkEvent::ApprovalResolved {
                request_id,
                decision: Decision::Accept,
            })
            .await;
        } else {
            self.emit(no_such_approval(request_id)).await;
        }
    }

    async fn send_prompt(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let Some(rpc) = self.open_client() else {
            self.emit(not_connected()).await;
            return;
        };
        self.session = std::mem::take(&mut self.session).append_local_user_prompt(text);
        self.emit(LinkEvent::Session(self.session.clone())).await;

        let sent = match self.session.active_thread_id() {
            Some(thread_id) => self.start_turn(&rpc, thread_id, text),
            None => {
                let epoch = self.epoch;
                let internal = self.internal_tx.clone();
                let prompt = text.to_string();
                rpc.request_with(
                    "thread/start",
                    Some(thread_start_params(&self.settings)),
                    move |outcome| {
                        let event = match outcome {
                            Ok(result) => match thread_id_of(&result) {
                                Some(thread_id) => Internal::ThreadStarted {
                                    epoch,
                                    thread_id: thread_id.to_string(),
                                    prompt,
                                },
                                None => Internal::RequestFailed(
                                    "thread/start returned no thread id".into(),
                                ),
                            },
                            Err(e) => Internal::RequestFailed(format!("thread/start failed: {e}")),
                        };
                        let _ = internal.send(event);
                    },
                )
            }
        };
        if let Err(e) = sent {
            self.emit(LinkEvent::Error(e.to_string())).await;
        }
    }

    /// Sends `turn/start`; the result is queued in order with notifications.
    fn start_turn(
        &self,
        rpc: &RpcClient,
        thread_id: &str,
        prompt: &str,
    ) -> Result<RequestId, RpcError> {
        let epoch = self.epoch;
        let internal = self.internal_tx.clone();
        rpc.request_with(
            "turn/start",
            Some(turn_start_params(thread_id, prompt, &self.settings)),
            move |outcome| {
                let event = match outcome {
                    Ok(result) => Internal::TurnStarted { epoch, result },
                    Err(e) => Internal::RequestFailed(format!("turn/start failed: {e}")),
                };
                let _ = internal.send(event);
            },
        )
    }

    async fn interrupt(&mut self) {
        let (Some(thread_id), Some(turn_id)) = (
            self.session.active_thread_id(),
            self.session.active_turn_id(),
        ) else {
            self.emit(LinkEvent::Error("No active turn to interrupt".into()))
                .await;
            return;
        };
        let Some(rpc) = self.open_client() else {
            self.emit(not_connected()).await;
            return;
        };
        let params = json!({ "threadId": thread_id, "turnId": turn_id });
        let internal = self.internal_tx.clone();
        let sent = rpc.request_with("turn/interrupt", Some(params), move |outcome| {
            if let Err(e) = outcome {
                let _ = internal.send(Internal::RequestFailed(format!(
                    "turn/interrupt failed: {e}"
                )));
            }
        });
        if let Err(e) = sent {
            self.emit(LinkEvent::Error(e.to_string())).await;
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        if let Some(epoch) = event.traffic_epoch() {
            if !self.is_current(epoch) {
                tracing::trace!(?event, "dropping event from a previous connection");
            } else if self.state == ConnectionState::Connecting {
                self.deferred.push(event);
            } else {
                self.handle_traffic(event).await;
            }
            return;
        }
        match event {
            Internal::Handshake { epoch, outcome }
                if self.is_current(epoch) && self.state == ConnectionState::Connecting =>
            {
                self.finish_handshake(outcome).await;
            }
            Internal::Closed { epoch, reason } if self.is_current(epoch) => {
                tracing::warn!(reason = %reason, "bridge connection lost");
                self.drop_connection(false).await;
            }
            Internal::Heartbeat { epoch, event }
                if self.is_current(epoch) && self.heartbeat.is_some() =>
            {
                self.handle_heartbeat(event).await;
            }
            Internal::ThreadStarted {
                epoch,
                thread_id,
                prompt,
            } if self.is_current(epoch) => {
                self.session = std::mem::take(&mut self.session).set_active_thread(&thread_id);
                self.emit(LinkEvent::Session(self.session.clone())).await;
                let sent = match self.open_client() {
                    Some(rpc) => self.start_turn(&rpc, &thread_id, &prompt),
                    None => Err(RpcError::ConnectionClosed),
                };
                if let Err(e) = sent {
                    self.emit(LinkEvent::Error(format!("turn/start failed: {e}")))
                        .await;
                }
            }
            Internal::TurnStarted { epoch, result } if self.is_current(epoch) => {
                self.session = std::mem::take(&mut self.session).apply_turn_start_result(&result);
                self.emit(LinkEvent::Session(self.session.clone())).await;
            }
            Internal::RequestFailed(message) => {
                tracing::warn!(%message, "request failed");
                self.emit(LinkEvent::Error(message)).await;
            }
            stale => tracing::trace!(?stale, "dropping event from a previous connection"),
        }
    }

    /// Control frames, notifications and approvals of the live connection.
    async fn handle_traffic(&mut self, event: Internal) {
        match event {
            Internal::Control { message, .. } => match message {
                ControlMessage::Pong { t } => {
                    if let Some(heartbeat) = &self.heartbeat {
                        heartbeat.pong(t);
                    }
                }
                ControlMessage::Error { code, message } => {
                    tracing::warn!(%code, %message, "bridge reported an error");
                    self.emit(LinkEvent::Control(ControlMessage::Error { code, message }))
                        .await;
                }
                other => self.emit(LinkEvent::Control(other)).await,
            },
            Internal::Notification { method, params, .. } => {
                tracing::trace!(%method, "notification");
                self.session = std::mem::take(&mut self.session).apply(&method, params.as_ref());
                self.emit(LinkEvent::Session(self.session.clone())).await;
            }
            Internal::Approval { approval, .. } => {
                let risk = summarize_risk(&approval);
                tracing::info!(
                    request_id = approval.request_id,
                    kind = ?approval.kind,
                    risk = risk.label(),
                    "approval requested"
                );
                self.emit(LinkEvent::ApprovalRequested { approval, risk })
                    .await;
            }
            other => tracing::trace!(?other, "not connection traffic"),
        }
    }

    async fn handle_heartbeat(&mut self, event: HeartbeatEvent) {
        match event {
            HeartbeatEvent::Latency(ms) => self.emit(LinkEvent::Latency(ms)).await,
            HeartbeatEvent::Timeout { consecutive } => {
                tracing::warn!(consecutive, "heartbeat pong missed");
                self.emit(LinkEvent::HeartbeatMissed { consecutive }).await;
            }
            HeartbeatEvent::Recovered => tracing::info!("heartbeat recovered"),
            HeartbeatEvent::GiveUp { consecutive } => {
                tracing::warn!(consecutive, "heartbeat gave up; dropping connection");
                self.drop_connection(false).await;
            }
        }
    }
}

fn not_connected() -> LinkEvent {
    LinkEvent::Error("Not connected to the bridge".into())
}

fn no_such_approval(request_id: RequestId) -> LinkEvent {
    LinkEvent::Error(format!("No pending approval with id {request_id}"))
}

async fn handshake(rpc: &RpcClient) -> Result<BootstrapSnapshot, RpcError> {
    let info = rpc.initialize(&ClientInfo::default()).await?;
    tracing::debug!(?info, "initialize complete");
    bootstrap::bootstrap(rpc).await
}
