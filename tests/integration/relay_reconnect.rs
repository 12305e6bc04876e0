// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![cfg(unix)]
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Reconnect behaviour of the client link against a real relay.
//!
//! ## Disconnect simulation
//!
//! Aborting the relay's server task does not close sockets that are already
//! open, so a **TCP proxy** sits between the client and the relay. Severing
//! aborts every proxied connection task, which drops both TCP streams; the
//! client sees its socket close and the relay frees its client slot. The
//! proxy keeps accepting, so the next dial lands on the same relay.

use std::sync::Arc;
use std::time::Duration;

use agentlink::bootstrap::TurnSettings;
use agentlink::config::ClientConfig;
use agentlink::connect::WsDialer;
use agentlink::heartbeat::HeartbeatConfig;
use agentlink::net::{ConnectionState, Link, LinkCommand, LinkEvent};
use agentlink::reconnect::ReconnectPolicy;
use agentlink_proto::pairing::{Endpoints, PairingPayload};
use agentlink_relay::RunningRelay;
use agentlink_relay::config::RelayConfig;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Answers the handshake and bootstrap reads, nothing more.
const HANDSHAKE_AGENT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"id":\([0-9][0-9]*\),"method":.*/\1/p')
  method=$(printf '%s\n' "$line" | sed -n 's/^{"id":[0-9][0-9]*,"method":"\([^"]*\)".*/\1/p')
  [ -n "$id" ] || continue
  case "$method" in
    initialize) printf '{"id":%s,"result":{}}\n' "$id" ;;
    account/read) printf '{"id":%s,"result":{"account":null,"requiresOpenaiAuth":false}}\n' "$id" ;;
    model/list|thread/list) printf '{"id":%s,"result":{"data":[]}}\n' "$id" ;;
    *) printf '{"id":%s,"error":{"code":-32601,"message":"unsupported"}}\n' "$id" ;;
  esac
done
"#;

const WAIT: Duration = Duration::from_secs(10);

// =============================================================================
// TCP Proxy helper
// =============================================================================

/// Forwards a client-facing port to the relay. `sever()` tears down every
/// live connection while the acceptor keeps running.
struct TcpProxy {
    /// Address clients should connect to (127.0.0.1:<proxy_port>).
    client_addr: String,
    accept_handle: tokio::task::JoinHandle<()>,
    /// All per-connection task handles. Aborting these kills the TCP streams.
    conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TcpProxy {
    async fn new(backend_addr: String) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = listener.local_addr().unwrap().to_string();
        let conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let tracked = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            while let Ok((mut client_stream, _)) = listener.accept().await {
                let backend = backend_addr.clone();
                let conn_handle = tokio::spawn(async move {
                    let Ok(mut backend_stream) = tokio::net::TcpStream::connect(&backend).await
                    else {
                        return;
                    };
                    // No sub-tasks, so an abort drops both streams at once.
                    let _ = tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream)
                        .await;
                });
                tracked.lock().push(conn_handle);
            }
        });

        Self {
            client_addr,
            accept_handle,
            conn_handles,
        }
    }

    /// Drops every proxied connection.
    fn sever(&self) {
        for handle in self.conn_handles.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for TcpProxy {
    fn drop(&mut self) {
        self.accept_handle.abort();
        self.sever();
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn start_relay() -> RunningRelay {
    let config = RelayConfig {
        host: "127.0.0.1".into(),
        port: 0,
        agent_bin: "sh".into(),
        agent_args: vec!["-c".into(), HANDSHAKE_AGENT.into()],
        cwd: std::env::temp_dir(),
        open_auth_url: false,
        ..RelayConfig::default()
    };
    agentlink_relay::launch(&config).await.unwrap()
}

fn payload_via(proxy: &TcpProxy, relay: &RunningRelay) -> PairingPayload {
    PairingPayload {
        endpoints: Endpoints {
            lan: Some(format!("ws://{}/ws", proxy.client_addr)),
            tailscale: None,
        },
        ..relay.pairing_payload()
    }
}

fn fast_config(heartbeat_interval: Duration) -> ClientConfig {
    ClientConfig {
        connect_timeout: Duration::from_secs(2),
        heartbeat: HeartbeatConfig {
            interval: heartbeat_interval,
            timeout: Duration::from_secs(2),
            max_consecutive_timeouts: 2,
        },
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
        },
        ..ClientConfig::default()
    }
}

/// Collects events until `stop` matches, returning everything seen.
async fn collect_until(
    events: &mut mpsc::Receiver<LinkEvent>,
    stop: impl Fn(&LinkEvent) -> bool,
) -> Vec<LinkEvent> {
    tokio::time::timeout(WAIT, async {
        let mut seen = Vec::new();
        loop {
            let event = events.recv().await.expect("link stopped");
            let done = stop(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    })
    .await
    .expect("timed out waiting for link event")
}

fn is_bootstrapped(event: &LinkEvent) -> bool {
    matches!(event, LinkEvent::Bootstrapped(_))
}

fn reconnects(events: &[LinkEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            LinkEvent::ReconnectScheduled { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn socket_loss_reconnects_with_backoff() {
    let relay = start_relay().await;
    let proxy = TcpProxy::new(relay.addr.to_string()).await;
    let (link, mut events) = Link::spawn(
        &fast_config(Duration::from_secs(60)),
        payload_via(&proxy, &relay),
        TurnSettings::default(),
        WsDialer,
    );
    collect_until(&mut events, is_bootstrapped).await;

    proxy.sever();
    let seen = collect_until(&mut events, is_bootstrapped).await;

    // The relay may still hold the old slot on the first retry, so later
    // attempts can follow; they must count up one at a time.
    let attempts = reconnects(&seen);
    assert_eq!(attempts.first(), Some(&1));
    assert!(attempts.windows(2).all(|w| w[1] == w[0] + 1));
    let first_delay = seen.iter().find_map(|e| match e {
        LinkEvent::ReconnectScheduled { delay, .. } => Some(*delay),
        _ => None,
    });
    assert_eq!(first_delay, Some(Duration::from_millis(50)));
    assert!(
        seen.iter()
            .any(|e| matches!(e, LinkEvent::State(ConnectionState::Closed)))
    );

    // A second loss starts the backoff from the beginning again.
    proxy.sever();
    let seen = collect_until(&mut events, is_bootstrapped).await;
    assert_eq!(reconnects(&seen).first(), Some(&1));

    link.shutdown().await;
    relay.shutdown();
}

#[tokio::test]
async fn user_disconnect_stays_down_until_connect() {
    let relay = start_relay().await;
    let proxy = TcpProxy::new(relay.addr.to_string()).await;
    let (link, mut events) = Link::spawn(
        &fast_config(Duration::from_secs(60)),
        payload_via(&proxy, &relay),
        TurnSettings::default(),
        WsDialer,
    );
    collect_until(&mut events, is_bootstrapped).await;

    link.send(LinkCommand::Disconnect);
    collect_until(&mut events, |e| {
        matches!(e, LinkEvent::State(ConnectionState::Closed))
    })
    .await;

    // Several base delays pass without any reconnect.
    let quiet = tokio::time::timeout(Duration::from_millis(400), async {
        loop {
            match events.recv().await {
                Some(LinkEvent::ReconnectScheduled { .. } | LinkEvent::Connected { .. }) => {
                    return true;
                }
                Some(_) => {}
                None => return false,
            }
        }
    })
    .await;
    assert!(quiet.is_err(), "link reconnected after a user disconnect");

    link.send(LinkCommand::Connect);
    let seen = collect_until(&mut events, is_bootstrapped).await;
    assert!(
        seen.iter()
            .any(|e| matches!(e, LinkEvent::State(ConnectionState::Open)))
    );

    link.shutdown().await;
    relay.shutdown();
}

#[tokio::test]
async fn heartbeat_reports_latency_through_the_relay() {
    let relay = start_relay().await;
    let proxy = TcpProxy::new(relay.addr.to_string()).await;
    let (link, mut events) = Link::spawn(
        &fast_config(Duration::from_millis(50)),
        payload_via(&proxy, &relay),
        TurnSettings::default(),
        WsDialer,
    );

    let seen = collect_until(&mut events, |e| matches!(e, LinkEvent::Latency(_))).await;
    assert!(seen.iter().any(is_bootstrapped));
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, LinkEvent::HeartbeatMissed { .. }))
    );

    link.shutdown().await;
    relay.shutdown();
}
