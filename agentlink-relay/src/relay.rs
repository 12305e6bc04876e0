//! Relay server core: session state, WebSocket handler, and multiplexing
//! between the single mobile client and the agent subprocess.
//!
//! The relay accepts exactly one authenticated client at a time. Agent
//! stdout lines are forwarded to that client verbatim; client text is either
//! handled locally (control channel) or written to the agent's stdin.

use std::collections::HashMap;
use std::sync::Arc;

use agentlink_proto::control::{
    self, CONTROL_VERSION, ControlMessage, ControlProbe, ERROR_APP_SERVER_UNAVAILABLE,
    ERROR_INVALID_JSON, ERROR_UNSUPPORTED_CONTROL,
};
use agentlink_proto::now_millis;
use agentlink_proto::pairing::{Endpoints, PAIRING_VERSION, PairingPayload};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::agent::{AgentEvent, AgentInput, AgentStatus};
use crate::auth_url::{self, BrowserLauncher};
use crate::client_log::{self, ClientLogEntry};

/// Static facts about this relay, advertised in `hello` and the pairing payload.
#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub name: String,
    pub token: String,
    pub cwd: String,
    pub endpoints: Endpoints,
}

impl RelayInfo {
    /// Builds the pairing payload clients scan to connect.
    #[must_use]
    pub fn pairing_payload(&self) -> PairingPayload {
        PairingPayload {
            v: PAIRING_VERSION,
            name: self.name.clone(),
            token: self.token.clone(),
            endpoints: self.endpoints.clone(),
            cwd_hint: Some(self.cwd.clone()),
        }
    }
}

/// The connected client's outbound queue.
struct ActiveClient {
    id: Uuid,
    sender: mpsc::UnboundedSender<Message>,
}

/// Why an upgrade was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeRejection {
    /// Token missing or wrong.
    Unauthorized,
    /// Another client is connected.
    Busy,
}

/// Session object owned by the relay process and shared with handlers.
pub struct RelaySession {
    info: RelayInfo,
    active: RwLock<Option<ActiveClient>>,
    agent_status: RwLock<AgentStatus>,
    agent_input: AgentInput,
    launcher: Option<Arc<dyn BrowserLauncher>>,
}

impl RelaySession {
    /// Creates a session with no client and a `starting` agent.
    ///
    /// `launcher` is `None` when login URLs should not be opened locally.
    #[must_use]
    pub fn new(
        info: RelayInfo,
        agent_input: AgentInput,
        launcher: Option<Arc<dyn BrowserLauncher>>,
    ) -> Self {
        Self {
            info,
            active: RwLock::new(None),
            agent_status: RwLock::new(AgentStatus::starting()),
            agent_input,
            launcher,
        }
    }

    /// Relay identity and endpoints.
    #[must_use]
    pub const fn info(&self) -> &RelayInfo {
        &self.info
    }

    /// Returns `true` while a client is connected.
    pub async fn has_client(&self) -> bool {
        self.active.read().await.is_some()
    }

    /// Current agent lifecycle status.
    pub async fn agent_status(&self) -> AgentStatus {
        self.agent_status.read().await.clone()
    }

    /// Authenticates and reserves the single client slot.
    ///
    /// The check and the reservation happen under one write lock, so two
    /// concurrent upgrades can never both succeed.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeRejection::Unauthorized`] for a wrong token and
    /// [`UpgradeRejection::Busy`] when a client already holds the slot.
    pub async fn claim(
        &self,
        token: Option<&str>,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Result<Uuid, UpgradeRejection> {
        if token != Some(self.info.token.as_str()) {
            return Err(UpgradeRejection::Unauthorized);
        }
        let mut active = self.active.write().await;
        if active.is_some() {
            return Err(UpgradeRejection::Busy);
        }
        let id = Uuid::now_v7();
        *active = Some(ActiveClient { id, sender });
        Ok(id)
    }

    /// Frees the slot if it is still held by `client_id`.
    pub async fn release(&self, client_id: Uuid) {
        let mut active = self.active.write().await;
        if active.as_ref().is_some_and(|c| c.id == client_id) {
            *active = None;
            tracing::info!(client_id = %client_id, "client released");
        }
    }

    /// Sends a control message to the active client, if any.
    pub async fn send_control(&self, message: &ControlMessage) {
        self.send_text(message.to_text()).await;
    }

    async fn send_text(&self, text: String) -> bool {
        let active = self.active.read().await;
        match active.as_ref() {
            Some(client) => client.sender.send(Message::Text(text.into())).is_ok(),
            None => false,
        }
    }

    /// Handles one line of agent stdout.
    ///
    /// The line is inspected for a login URL and then forwarded unchanged.
    pub async fn handle_agent_line(&self, line: String) {
        if let Some(launcher) = &self.launcher
            && let Some(url) = auth_url::extract_login_url(&line)
        {
            let launch = match launcher.open(&url) {
                Ok(()) => {
                    tracing::info!("opened login URL in local browser");
                    ControlMessage::AuthBrowserLaunch {
                        url,
                        success: true,
                        message: Some("Opened login URL in local browser".into()),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "unable to open login URL automatically");
                    ControlMessage::AuthBrowserLaunch {
                        url,
                        success: false,
                        message: Some("Unable to open login URL automatically".into()),
                    }
                }
            };
            self.send_control(&launch).await;
        }

        if !self.send_text(line).await {
            tracing::debug!("no client connected, dropping agent output");
        }
    }

    /// Records a lifecycle change and broadcasts it as `appServerStatus`.
    pub async fn handle_agent_status(&self, status: AgentStatus) {
        tracing::info!(state = ?status.state, "agent status changed");
        let message = status.to_control();
        *self.agent_status.write().await = status;
        self.send_control(&message).await;
    }

    /// Drains agent events into the session until the agent's output ends.
    pub async fn pump_agent_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<AgentEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                AgentEvent::Stdout(line) => self.handle_agent_line(line).await,
                AgentEvent::Status(status) => self.handle_agent_status(status).await,
            }
        }
    }

    /// Handles one text frame from the client.
    ///
    /// `reply` is the client's outbound queue, used for responses that only
    /// concern this client (pongs, errors).
    pub async fn handle_client_text(&self, text: &str, reply: &mpsc::UnboundedSender<Message>) {
        let send = |message: ControlMessage| {
            let _ = reply.send(Message::Text(message.to_text().into()));
        };

        let Ok(value) = serde_json::from_str::<Value>(text) else {
            tracing::warn!("client sent invalid JSON");
            send(ControlMessage::error(
                ERROR_INVALID_JSON,
                "Message must be valid JSON",
            ));
            return;
        };

        match control::probe_control(&value) {
            ControlProbe::Message(message) => {
                handle_client_control(message, &send);
                return;
            }
            ControlProbe::Malformed(reason) => {
                tracing::warn!(reason = %reason, "client sent malformed control message");
                return;
            }
            ControlProbe::Absent => {}
        }

        let status = self.agent_status.read().await.state;
        if !status.accepts_input() {
            tracing::warn!(state = ?status, "rejecting client RPC, agent not running");
            send(ControlMessage::error(
                ERROR_APP_SERVER_UNAVAILABLE,
                "Agent server is not running",
            ));
            return;
        }

        let line = if text.contains(['\n', '\r']) {
            value.to_string()
        } else {
            text.to_string()
        };
        if let Err(e) = self.agent_input.send_line(line) {
            tracing::warn!(error = %e, "failed to forward client message to agent");
            send(ControlMessage::error(
                ERROR_APP_SERVER_UNAVAILABLE,
                "Agent server input is closed",
            ));
        }
    }

    fn hello(&self) -> ControlMessage {
        ControlMessage::Hello {
            v: CONTROL_VERSION,
            name: self.info.name.clone(),
            cwd: self.info.cwd.clone(),
            endpoints: self.info.endpoints.clone(),
            timestamp: now_millis(),
        }
    }
}

fn handle_client_control(message: ControlMessage, send: &impl Fn(ControlMessage)) {
    match message {
        ControlMessage::Ping { t } => send(ControlMessage::Pong { t }),
        ControlMessage::ClientLog {
            level,
            source,
            message,
            timestamp,
            context,
        } => client_log::write_client_log(&ClientLogEntry {
            level,
            source: &source,
            message: &message,
            timestamp,
            context: context.as_ref(),
        }),
        other => {
            tracing::debug!(message = ?other, "rejecting client control message");
            send(ControlMessage::error(
                ERROR_UNSUPPORTED_CONTROL,
                "Control message is not accepted from clients",
            ));
        }
    }
}

/// Handles an upgraded WebSocket connection for the claimed client.
///
/// The connection lifecycle:
/// 1. Send `hello` and the current `appServerStatus`.
/// 2. Forward queued outbound frames from the writer task.
/// 3. Route inbound text through [`RelaySession::handle_client_text`].
/// 4. On disconnect, release the client slot.
pub async fn handle_socket(
    socket: WebSocket,
    session: Arc<RelaySession>,
    client_id: Uuid,
    sender: mpsc::UnboundedSender<Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    tracing::info!(client_id = %client_id, "client connected");

    let _ = sender.send(Message::Text(session.hello().to_text().into()));
    let status = session.agent_status().await.to_control();
    let _ = sender.send(Message::Text(status.to_text().into()));

    // Writer task: channel → WebSocket.
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(client_id = %client_id, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    // Reader task: WebSocket → session.
    let reader_session = Arc::clone(&session);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    reader_session
                        .handle_client_text(text.as_str(), &sender)
                        .await;
                }
                Message::Close(_) => {
                    tracing::info!(client_id = %client_id, "received close frame");
                    break;
                }
                _ => {
                    // Binary, ping and pong frames carry nothing for the agent.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    session.release(client_id).await;
    tracing::info!(client_id = %client_id, "client disconnected");
}

/// axum handler that authenticates and upgrades to a WebSocket.
///
/// Responds 401 on a token mismatch and 409 while another client holds the
/// slot. Paths other than `/ws` never reach this handler and get 404.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(session): State<Arc<RelaySession>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let (tx, rx) = mpsc::unbounded_channel();
    let client_id = match session
        .claim(query.get("token").map(String::as_str), tx.clone())
        .await
    {
        Ok(id) => id,
        Err(UpgradeRejection::Unauthorized) => {
            tracing::warn!("rejected upgrade with invalid token");
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
        Err(UpgradeRejection::Busy) => {
            tracing::warn!("rejected upgrade, a client is already connected");
            return (StatusCode::CONFLICT, "bridge already has an active client").into_response();
        }
    };

    let failed_session = Arc::clone(&session);
    ws.on_failed_upgrade(move |e| {
        tracing::warn!(error = %e, "WebSocket upgrade failed");
        tokio::spawn(async move { failed_session.release(client_id).await });
    })
    .on_upgrade(move |socket| handle_socket(socket, session, client_id, tx, rx))
}

/// Builds the axum router serving `/ws`.
pub fn router(session: Arc<RelaySession>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(session)
}

/// Serves the relay on an already-bound listener.
#[must_use]
pub fn serve(
    listener: tokio::net::TcpListener,
    session: Arc<RelaySession>,
) -> tokio::task::JoinHandle<()> {
    let app = router(session);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    })
}

/// Binds `addr` and starts serving the given session.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_session(
    addr: &str,
    session: Arc<RelaySession>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    Ok((bound_addr, serve(listener, session)))
}
