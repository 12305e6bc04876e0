//! Connection establishment with endpoint fallback.
//!
//! Endpoints from the pairing payload are tried one at a time in
//! [`EndpointKind::PRIORITY`] order, never raced. Every endpoint leaves one
//! [`ConnectionAttempt`] in the log, including absent ones, so diagnostics
//! can be derived from the whole attempt history.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use agentlink_proto::now_millis;
use agentlink_proto::pairing::{EndpointKind, PairingPayload};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

/// Default per-attempt timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Socket type produced by [`WsDialer`].
pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Why a single endpoint attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptReason {
    /// The pairing payload carries no URL for this endpoint.
    EndpointUnavailable,
    /// The socket did not open within the attempt timeout.
    Timeout,
    /// The socket failed before opening.
    SocketError,
    /// The peer closed or rejected the handshake with this code.
    Closed(Option<u16>),
}

impl AttemptReason {
    /// Close code carried by a [`AttemptReason::Closed`] reason.
    #[must_use]
    pub const fn close_code(self) -> Option<u16> {
        match self {
            Self::Closed(code) => code,
            _ => None,
        }
    }

    /// Whether the relay rejected the pairing token.
    #[must_use]
    pub const fn is_token_rejected(self) -> bool {
        matches!(self, Self::Closed(Some(401 | 4401)))
    }

    /// Whether the relay already serves another client.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Closed(Some(409)))
    }
}

impl fmt::Display for AttemptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndpointUnavailable => f.write_str("endpoint_unavailable"),
            Self::Timeout => f.write_str("timeout"),
            Self::SocketError => f.write_str("socket_error"),
            Self::Closed(Some(code)) => write!(f, "closed_{code}"),
            Self::Closed(None) => f.write_str("closed_unknown"),
        }
    }
}

/// One entry of the attempt log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAttempt {
    pub endpoint: EndpointKind,
    /// URL dialled, token included. Empty when the endpoint was absent.
    pub url: String,
    pub success: bool,
    pub reason: Option<AttemptReason>,
    pub duration_ms: u64,
    pub timestamp_ms: u64,
}

impl ConnectionAttempt {
    fn failed(endpoint: EndpointKind, url: String, reason: AttemptReason, started: Instant) -> Self {
        Self {
            endpoint,
            url,
            success: false,
            reason: Some(reason),
            duration_ms: elapsed_ms(started),
            timestamp_ms: now_millis(),
        }
    }
}

/// An open socket plus the complete ordered attempt log.
#[derive(Debug)]
pub struct ConnectionResult<S> {
    pub endpoint: EndpointKind,
    pub url: String,
    pub socket: S,
    pub attempts: Vec<ConnectionAttempt>,
}

/// Raised only after every endpoint failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("Unable to connect to bridge ({})", join_reasons(.attempts))]
    Fallback { attempts: Vec<ConnectionAttempt> },
}

impl ConnectError {
    /// The ordered attempt log.
    #[must_use]
    pub fn attempts(&self) -> &[ConnectionAttempt] {
        match self {
            Self::Fallback { attempts } => attempts,
        }
    }
}

fn join_reasons(attempts: &[ConnectionAttempt]) -> String {
    attempts
        .iter()
        .map(|a| {
            let reason = a
                .reason
                .map_or_else(|| "unknown".to_string(), |r| r.to_string());
            format!("{}: {reason}", a.endpoint)
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Opens a socket to a URL.
pub trait Dialer: Send + Sync {
    type Socket: Send + 'static;

    /// Dials `url`, resolving once the socket is open.
    fn dial(&self, url: &str)
    -> impl Future<Output = Result<Self::Socket, AttemptReason>> + Send;
}

/// Dials with `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsDialer;

impl Dialer for WsDialer {
    type Socket = WsStream;

    async fn dial(&self, url: &str) -> Result<WsStream, AttemptReason> {
        connect_async(url)
            .await
            .map(|(stream, _response)| stream)
            .map_err(|e| map_ws_connect_error(&e))
    }
}

fn map_ws_connect_error(err: &tungstenite::Error) -> AttemptReason {
    use tungstenite::Error as WsError;
    match err {
        WsError::Http(response) => AttemptReason::Closed(Some(response.status().as_u16())),
        WsError::ConnectionClosed | WsError::AlreadyClosed => AttemptReason::Closed(None),
        _ => AttemptReason::SocketError,
    }
}

/// Appends the auth token as the `token` query parameter.
fn url_with_token(endpoint: &str, token: &str) -> Option<String> {
    let mut url = Url::parse(endpoint).ok()?;
    url.query_pairs_mut().append_pair("token", token);
    Some(url.into())
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Connects to the first reachable endpoint of `payload`.
///
/// # Errors
///
/// Returns [`ConnectError::Fallback`] with the full attempt log when no
/// endpoint opens within `timeout`.
pub async fn connect<D: Dialer>(
    payload: &PairingPayload,
    timeout: Duration,
    dialer: &D,
) -> Result<ConnectionResult<D::Socket>, ConnectError> {
    let mut attempts = Vec::with_capacity(EndpointKind::PRIORITY.len());

    for kind in EndpointKind::PRIORITY {
        let started = Instant::now();
        let Some(endpoint) = payload.endpoints.get(kind) else {
            tracing::debug!(endpoint = %kind, "endpoint not configured");
            attempts.push(ConnectionAttempt::failed(
                kind,
                String::new(),
                AttemptReason::EndpointUnavailable,
                started,
            ));
            continue;
        };
        let Some(url) = url_with_token(endpoint, &payload.token) else {
            tracing::warn!(endpoint = %kind, "endpoint is not a valid URL");
            attempts.push(ConnectionAttempt::failed(
                kind,
                endpoint.to_string(),
                AttemptReason::SocketError,
                started,
            ));
            continue;
        };

        tracing::debug!(endpoint = %kind, "dialling bridge");
        let outcome = tokio::time::timeout(timeout, dialer.dial(&url))
            .await
            .unwrap_or(Err(AttemptReason::Timeout));
        match outcome {
            Ok(socket) => {
                let duration_ms = elapsed_ms(started);
                tracing::info!(endpoint = %kind, duration_ms, "connected to bridge");
                attempts.push(ConnectionAttempt {
                    endpoint: kind,
                    url: url.clone(),
                    success: true,
                    reason: None,
                    duration_ms,
                    timestamp_ms: now_millis(),
                });
                return Ok(ConnectionResult {
                    endpoint: kind,
                    url,
                    socket,
                    attempts,
                });
            }
            Err(reason) => {
                tracing::warn!(endpoint = %kind, reason = %reason, "bridge connection attempt failed");
                attempts.push(ConnectionAttempt::failed(kind, url, reason, started));
            }
        }
    }

    Err(ConnectError::Fallback { attempts })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use agentlink_proto::pairing::Endpoints;
    use parking_lot::Mutex;

    use super::*;

    const TOKEN: &str = "abcdefghijklmnopqrstuvwxyz012345";

    #[derive(Default)]
    struct ScriptedDialer {
        outcomes: HashMap<&'static str, Option<Result<u32, AttemptReason>>>,
        dialled: Mutex<Vec<String>>,
    }

    impl ScriptedDialer {
        fn with(mut self, host: &'static str, outcome: Option<Result<u32, AttemptReason>>) -> Self {
            self.outcomes.insert(host, outcome);
            self
        }
    }

    impl Dialer for ScriptedDialer {
        type Socket = u32;

        async fn dial(&self, url: &str) -> Result<u32, AttemptReason> {
            self.dialled.lock().push(url.to_string());
            let host = Url::parse(url).unwrap().host_str().unwrap().to_string();
            match self.outcomes.get(host.as_str()).cloned().flatten() {
                Some(outcome) => outcome,
                // `None` hangs until the attempt timeout fires.
                None => std::future::pending().await,
            }
        }
    }

    fn payload(lan: Option<&str>, tailscale: Option<&str>) -> PairingPayload {
        PairingPayload {
            v: 1,
            name: "Desk".into(),
            token: TOKEN.into(),
            endpoints: Endpoints {
                lan: lan.map(Into::into),
                tailscale: tailscale.map(Into::into),
            },
            cwd_hint: None,
        }
    }

    #[tokio::test]
    async fn lan_success_stops_early() {
        let dialer = ScriptedDialer::default()
            .with("192.168.1.5", Some(Ok(1)))
            .with("100.64.0.2", Some(Ok(2)));
        let result = connect(
            &payload(Some("ws://192.168.1.5:8787/ws"), Some("ws://100.64.0.2:8787/ws")),
            DEFAULT_CONNECT_TIMEOUT,
            &dialer,
        )
        .await
        .unwrap();
        assert_eq!(result.endpoint, EndpointKind::Lan);
        assert_eq!(result.socket, 1);
        assert_eq!(result.attempts.len(), 1);
        assert!(result.attempts[0].success);
        assert_eq!(dialer.dialled.lock().len(), 1);
    }

    #[tokio::test]
    async fn token_is_appended_as_query_parameter() {
        let dialer = ScriptedDialer::default().with("192.168.1.5", Some(Ok(1)));
        let result = connect(
            &payload(Some("ws://192.168.1.5:8787/ws"), None),
            DEFAULT_CONNECT_TIMEOUT,
            &dialer,
        )
        .await
        .unwrap();
        assert_eq!(result.url, format!("ws://192.168.1.5:8787/ws?token={TOKEN}"));
    }

    #[tokio::test]
    async fn missing_lan_still_tries_tailscale() {
        let dialer = ScriptedDialer::default().with("100.64.0.2", Some(Ok(2)));
        let result = connect(
            &payload(None, Some("ws://100.64.0.2:8787/ws")),
            DEFAULT_CONNECT_TIMEOUT,
            &dialer,
        )
        .await
        .unwrap();
        assert_eq!(result.endpoint, EndpointKind::Tailscale);
        assert_eq!(result.attempts.len(), 2);
        assert_eq!(result.attempts[0].endpoint, EndpointKind::Lan);
        assert_eq!(
            result.attempts[0].reason,
            Some(AttemptReason::EndpointUnavailable)
        );
        assert!(result.attempts[0].url.is_empty());
        assert!(result.attempts[1].success);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_then_fallback_keeps_prior_failure() {
        let dialer = ScriptedDialer::default()
            .with("192.168.1.5", None)
            .with("100.64.0.2", Some(Ok(2)));
        let result = connect(
            &payload(Some("ws://192.168.1.5:8787/ws"), Some("ws://100.64.0.2:8787/ws")),
            DEFAULT_CONNECT_TIMEOUT,
            &dialer,
        )
        .await
        .unwrap();
        assert_eq!(result.attempts[0].reason, Some(AttemptReason::Timeout));
        assert!(!result.attempts[0].success);
        assert_eq!(result.socket, 2);
        let dialled = dialer.dialled.lock();
        assert!(dialled[0].contains("192.168.1.5"));
        assert!(dialled[1].contains("100.64.0.2"));
    }

    #[tokio::test]
    async fn all_failures_produce_fallback_error() {
        let dialer = ScriptedDialer::default()
            .with("192.168.1.5", Some(Err(AttemptReason::SocketError)))
            .with("100.64.0.2", Some(Err(AttemptReason::Closed(Some(401)))));
        let err = connect(
            &payload(Some("ws://192.168.1.5:8787/ws"), Some("ws://100.64.0.2:8787/ws")),
            DEFAULT_CONNECT_TIMEOUT,
            &dialer,
        )
        .await
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unable to connect to bridge (lan: socket_error | tailscale: closed_401)"
        );
        assert_eq!(err.attempts().len(), 2);
    }

    #[test]
    fn reason_codes() {
        assert_eq!(AttemptReason::Closed(Some(409)).to_string(), "closed_409");
        assert_eq!(AttemptReason::Closed(None).to_string(), "closed_unknown");
        assert!(AttemptReason::Closed(Some(4401)).is_token_rejected());
        assert!(AttemptReason::Closed(Some(409)).is_busy());
        assert!(!AttemptReason::Timeout.is_busy());
    }
}
