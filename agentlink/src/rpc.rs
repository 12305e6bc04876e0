//! JSON-RPC client over the relay socket.
//!
//! Correlates requests with responses through an explicit id → continuation
//! map, dispatches notifications and server-initiated requests to an
//! [`RpcHandler`], and routes `__bridge` control frames to the same handler
//! without consuming an id.
//!
//! Every pending entry leaves the map on exactly one of: its response, its
//! timeout, the caller dropping the request future, socket loss, or
//! [`RpcClient::dispose`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use agentlink_proto::control::ControlMessage;
use agentlink_proto::jsonrpc::{
    self, FrameError, Incoming, METHOD_NOT_FOUND, RequestId, RpcErrorObject, SERVER_ERROR,
};
use futures_util::future::BoxFuture;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};

/// Default time a request waits for its response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(8_000);

/// Errors surfaced to RPC callers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    /// No response arrived within the request timeout. The socket stays open.
    #[error("Request timed out: {method}")]
    Timeout {
        /// Method of the request that timed out.
        method: String,
    },
    /// The server answered with an error object.
    #[error("Request failed: {message}")]
    Server {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    /// The socket closed while the request was pending.
    #[error("Socket closed")]
    ConnectionClosed,
    /// The socket failed.
    #[error("Socket error: {0}")]
    SocketError(String),
    /// The client was disposed.
    #[error("Client disposed")]
    Disposed,
}

impl RpcError {
    /// Whether the error means the connection itself is gone.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::SocketError(_) | Self::Disposed
        )
    }
}

impl From<RpcErrorObject> for RpcError {
    fn from(error: RpcErrorObject) -> Self {
        Self::Server {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

/// Request initiated by the agent server, e.g. an approval prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerRequest {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

/// Reply produced by a server-request handler: a result or an error message.
pub type ServerReply = BoxFuture<'static, Result<Value, String>>;

/// Receives everything the client does not correlate itself.
///
/// All methods have no-op defaults. Callbacks run on the reader task and
/// must not block.
pub trait RpcHandler: Send + Sync + 'static {
    /// A `__bridge` control message arrived.
    fn on_control(&self, _message: ControlMessage) {}

    /// A notification arrived.
    fn on_notification(&self, _method: &str, _params: Option<Value>) {}

    /// A server-initiated request arrived.
    ///
    /// Return `None` to reply "method not supported" (`-32601`). A returned
    /// future resolving to `Err(message)` is replied with code `-32000`.
    fn on_server_request(&self, _request: ServerRequest) -> Option<ServerReply> {
        None
    }

    /// The socket closed or failed. Called at most once per client.
    fn on_close(&self, _reason: &RpcError) {}
}

/// Identity sent in the `initialize` handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub title: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            title: "AgentLink".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// What runs when a request settles.
enum Continuation {
    /// A caller awaiting [`RpcClient::request`].
    Waiter(oneshot::Sender<Result<Value, RpcError>>),
    /// A callback from [`RpcClient::request_with`] and its timeout task.
    Callback {
        on_done: Box<dyn FnOnce(Result<Value, RpcError>) + Send>,
        timer: JoinHandle<()>,
    },
}

impl Continuation {
    fn settle(self, outcome: Result<Value, RpcError>) {
        match self {
            Self::Waiter(tx) => {
                let _ = tx.send(outcome);
            }
            Self::Callback { on_done, timer } => {
                timer.abort();
                on_done(outcome);
            }
        }
    }

    /// Drops the continuation without running it.
    fn discard(self) {
        if let Self::Callback { timer, .. } = self {
            timer.abort();
        }
    }
}

struct State {
    pending: HashMap<RequestId, Continuation>,
    /// Set once the client can no longer issue requests.
    terminal: Option<RpcError>,
    handler: Option<Arc<dyn RpcHandler>>,
}

struct Shared {
    outbound: mpsc::UnboundedSender<Message>,
    state: Mutex<State>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl Shared {
    fn handler(&self) -> Option<Arc<dyn RpcHandler>> {
        self.state.lock().handler.clone()
    }

    fn send_text(&self, text: String) -> Result<(), RpcError> {
        if let Some(err) = self.state.lock().terminal.clone() {
            return Err(err);
        }
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Moves to the terminal state, rejecting every pending request.
    ///
    /// Returns the handler if it should be told about the close.
    fn terminate(&self, reason: &RpcError, detach: bool) -> Option<Arc<dyn RpcHandler>> {
        let (drained, handler) = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return None;
            }
            state.terminal = Some(reason.clone());
            let drained: Vec<_> = state.pending.drain().collect();
            let handler = state.handler.take();
            (drained, if detach { None } else { handler })
        };
        for (_, continuation) in drained {
            continuation.settle(Err(reason.clone()));
        }
        handler
    }

    fn fail(&self, reason: &RpcError) {
        if let Some(handler) = self.terminate(reason, false) {
            tracing::info!(reason = %reason, "rpc connection closed");
            handler.on_close(reason);
        }
    }

    fn handle_text(self: &Arc<Self>, text: &str) {
        if self.state.lock().terminal.is_some() {
            return;
        }
        match jsonrpc::classify(text) {
            Ok(Incoming::Control(message)) => {
                if let Some(handler) = self.handler() {
                    handler.on_control(message);
                }
            }
            Ok(Incoming::Response { id, outcome }) => {
                let continuation = self.state.lock().pending.remove(&id);
                match continuation {
                    Some(continuation) => continuation.settle(outcome.map_err(RpcError::from)),
                    None => tracing::debug!(id, "ignoring response for unknown request id"),
                }
            }
            Ok(Incoming::Request { id, method, params }) => {
                self.handle_server_request(ServerRequest { id, method, params });
            }
            Ok(Incoming::Notification { method, params }) => {
                if let Some(handler) = self.handler() {
                    handler.on_notification(&method, params);
                }
            }
            Err(FrameError::InvalidJson(e)) => {
                tracing::debug!(error = %e, "ignoring non-JSON frame");
            }
            Err(e) => tracing::warn!(error = %e, "ignoring malformed frame"),
        }
    }

    fn handle_server_request(self: &Arc<Self>, request: ServerRequest) {
        let id = request.id;
        let method = request.method.clone();
        let reply = self
            .handler()
            .and_then(|handler| handler.on_server_request(request));
        let Some(reply) = reply else {
            tracing::debug!(id, method = %method, "no handler for server request");
            let _ = self.send_text(jsonrpc::error_text(
                id,
                METHOD_NOT_FOUND,
                &format!("Client cannot handle method: {method}"),
            ));
            return;
        };
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let text = match reply.await {
                Ok(result) => jsonrpc::result_text(id, result),
                Err(message) => {
                    tracing::warn!(id, method = %method, error = %message, "server request handler failed");
                    jsonrpc::error_text(id, SERVER_ERROR, &message)
                }
            };
            if let Err(e) = shared.send_text(text) {
                tracing::debug!(id, error = %e, "dropping reply to server request");
            }
        });
    }
}

/// Removes a pending entry if the request future is dropped early.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.state.lock().pending.remove(&self.id);
    }
}

/// JSON-RPC client bound to one socket.
pub struct RpcClient {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl RpcClient {
    /// Wraps an open socket and starts its reader and writer tasks.
    pub fn new<S>(socket: S, handler: Arc<dyn RpcHandler>, request_timeout: Duration) -> Self
    where
        S: Stream<Item = Result<Message, tungstenite::Error>>
            + Sink<Message, Error = tungstenite::Error>
            + Send
            + Unpin
            + 'static,
    {
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let shared = Arc::new(Shared {
            outbound,
            state: Mutex::new(State {
                pending: HashMap::new(),
                terminal: None,
                handler: Some(handler),
            }),
            next_id: AtomicU64::new(1),
            request_timeout,
        });
        let (mut sink, mut stream) = socket.split();

        let writer_shared = Arc::clone(&shared);
        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    tracing::warn!(error = %e, "socket write failed");
                    writer_shared.fail(&RpcError::SocketError(e.to_string()));
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => reader_shared.handle_text(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(?frame, "received close frame");
                        reader_shared.fail(&RpcError::ConnectionClosed);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        reader_shared.fail(&RpcError::SocketError(e.to_string()));
                        break;
                    }
                    None => {
                        reader_shared.fail(&RpcError::ConnectionClosed);
                        break;
                    }
                }
            }
        });

        Self {
            shared,
            tasks: vec![writer, reader],
        }
    }

    /// Sends a request and waits for its response.
    ///
    /// # Errors
    ///
    /// [`RpcError::Timeout`] if no response arrives in time (the entry is
    /// removed and the socket stays open), [`RpcError::Server`] for an error
    /// response, or a transport error if the socket is gone.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.shared.state.lock();
            if let Some(err) = state.terminal.clone() {
                return Err(err);
            }
            let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
            state.pending.insert(id, Continuation::Waiter(tx));
            id
        };
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        if self
            .shared
            .outbound
            .send(Message::Text(jsonrpc::request_text(id, method, params).into()))
            .is_err()
        {
            return Err(RpcError::ConnectionClosed);
        }
        tracing::trace!(id, method, "request sent");

        match tokio::time::timeout(self.shared.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::ConnectionClosed),
            Err(_) => {
                tracing::warn!(id, method, "request timed out");
                Err(RpcError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    /// Sends a request whose outcome is handed to `on_done`.
    ///
    /// `on_done` runs on the reader task before any frame that follows the
    /// response is dispatched, so it observes the response in socket order
    /// with notifications. On timeout it runs on a timer task instead.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the request could not be sent; `on_done`
    /// is dropped without being called.
    pub fn request_with<F>(
        &self,
        method: &str,
        params: Option<Value>,
        on_done: F,
    ) -> Result<RequestId, RpcError>
    where
        F: FnOnce(Result<Value, RpcError>) + Send + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let timer = {
            let shared = Arc::downgrade(&self.shared);
            let timeout = self.shared.request_timeout;
            let method = method.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                let expired = shared.state.lock().pending.remove(&id);
                if let Some(continuation) = expired {
                    tracing::warn!(id, method = %method, "request timed out");
                    continuation.settle(Err(RpcError::Timeout { method }));
                }
            })
        };
        {
            let mut state = self.shared.state.lock();
            if let Some(err) = state.terminal.clone() {
                timer.abort();
                return Err(err);
            }
            state.pending.insert(
                id,
                Continuation::Callback {
                    on_done: Box::new(on_done),
                    timer,
                },
            );
        }
        if self
            .shared
            .outbound
            .send(Message::Text(jsonrpc::request_text(id, method, params).into()))
            .is_err()
        {
            let unsent = self.shared.state.lock().pending.remove(&id);
            if let Some(continuation) = unsent {
                continuation.discard();
            }
            return Err(RpcError::ConnectionClosed);
        }
        tracing::trace!(id, method, "request sent");
        Ok(id)
    }

    /// Sends a notification; no response is expected.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the socket is gone.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        self.shared
            .send_text(jsonrpc::notification_text(method, params))
    }

    /// Sends a control message on the same socket.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the socket is gone.
    pub fn send_control(&self, message: &ControlMessage) -> Result<(), RpcError> {
        self.shared.send_text(message.to_text())
    }

    /// Performs the `initialize` request followed by the `initialized`
    /// notification, returning the server's `initialize` result.
    ///
    /// # Errors
    ///
    /// Propagates the `initialize` request failure or a transport error
    /// while sending `initialized`.
    pub async fn initialize(&self, client_info: &ClientInfo) -> Result<Value, RpcError> {
        let result = self
            .request("initialize", Some(json!({ "clientInfo": client_info })))
            .await?;
        self.notify("initialized", Some(json!({})))?;
        Ok(result)
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Whether the client has reached a terminal state.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().terminal.is_some()
    }

    /// Detaches the handler and rejects all pending requests. Idempotent.
    ///
    /// The close handler is not invoked.
    pub fn dispose(&self) {
        let _ = self.shared.terminate(&RpcError::Disposed, true);
    }

    /// Sends a close frame to the relay.
    pub fn close(&self) {
        let _ = self.shared.outbound.send(Message::Close(None));
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.dispose();
        for task in &self.tasks {
            task.abort();
        }
    }
}
