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

//! End-to-end tests: client link → real relay → scripted agent server.
//!
//! The agent is a small `sh` loop that answers the handshake, bootstrap,
//! thread and turn requests and streams a canned turn. A prompt containing
//! `run ls` makes it ask for a command approval instead; the turn then
//! finishes once the approval reply comes back.

use std::time::Duration;

use agentlink::approvals::{ApprovalKind, Decision};
use agentlink::bootstrap::TurnSettings;
use agentlink::config::ClientConfig;
use agentlink::connect::{self, AttemptReason, WsDialer};
use agentlink::net::{ConnectionState, Link, LinkCommand, LinkEvent};
use agentlink::session::TurnStatus;
use agentlink_proto::control::{AgentState, ControlMessage};
use agentlink_proto::pairing::{Endpoints, PairingPayload};
use agentlink_relay::RunningRelay;
use agentlink_relay::config::RelayConfig;
use tokio::sync::mpsc;

const FAKE_AGENT: &str = r#"
reply() { printf '{"id":%s,"result":%s}\n' "$1" "$2"; }
while IFS= read -r line; do
  case "$line" in
    *'"decision":"accept"'*)
      printf '%s\n' '{"method":"item/completed","params":{"item":{"type":"commandExecution","id":"c1","command":"ls","aggregatedOutput":"approved"}}}'
      printf '%s\n' '{"method":"turn/completed","params":{"turn":{"id":"turn-2","status":"completed"}}}'
      continue ;;
    *'"decision":"decline"'*)
      printf '%s\n' '{"method":"turn/completed","params":{"turn":{"id":"turn-2","status":"interrupted"}}}'
      continue ;;
  esac
  id=$(printf '%s\n' "$line" | sed -n 's/^{"id":\([0-9][0-9]*\),"method":.*/\1/p')
  method=$(printf '%s\n' "$line" | sed -n 's/^{"id":[0-9][0-9]*,"method":"\([^"]*\)".*/\1/p')
  [ -n "$id" ] || continue
  case "$method" in
    initialize) reply "$id" '{"userAgent":"fake-agent/0.1"}' ;;
    account/read) reply "$id" '{"account":{"type":"apiKey"},"requiresOpenaiAuth":true}' ;;
    model/list) reply "$id" '{"data":[{"id":"gpt-5","displayName":"GPT-5"}]}' ;;
    thread/list) reply "$id" '{"data":[{"id":"old","preview":"earlier work"}]}' ;;
    thread/start) reply "$id" '{"thread":{"id":"thr-1"}}' ;;
    turn/start)
      case "$line" in
        *'run ls'*)
          reply "$id" '{"turn":{"id":"turn-2","items":[]}}'
          printf '%s\n' '{"id":900,"method":"item/commandExecution/requestApproval","params":{"threadId":"thr-1","turnId":"turn-2","itemId":"c1","command":"ls","cwd":"/tmp"}}'
          ;;
        *)
          reply "$id" '{"turn":{"id":"turn-1","items":[]}}'
          printf '%s\n' '{"method":"item/started","params":{"item":{"type":"agentMessage","id":"m1","text":""}}}'
          printf '%s\n' '{"method":"item/agentMessage/delta","params":{"itemId":"m1","delta":"Hello from "}}'
          printf '%s\n' '{"method":"item/agentMessage/delta","params":{"itemId":"m1","delta":"the agent"}}'
          printf '%s\n' '{"method":"turn/completed","params":{"turn":{"id":"turn-1","status":"completed"}}}'
          ;;
      esac ;;
    *) printf '{"id":%s,"error":{"code":-32601,"message":"unsupported"}}\n' "$id" ;;
  esac
done
"#;

const WAIT: Duration = Duration::from_secs(10);

async fn start_relay() -> RunningRelay {
    let config = RelayConfig {
        host: "127.0.0.1".into(),
        port: 0,
        name: "Test Bridge".into(),
        agent_bin: "sh".into(),
        agent_args: vec!["-c".into(), FAKE_AGENT.into()],
        cwd: std::env::temp_dir(),
        open_auth_url: false,
        ..RelayConfig::default()
    };
    agentlink_relay::launch(&config).await.unwrap()
}

fn payload_for(relay: &RunningRelay, token: &str) -> PairingPayload {
    PairingPayload {
        endpoints: Endpoints {
            lan: Some(format!("ws://127.0.0.1:{}/ws", relay.addr.port())),
            tailscale: None,
        },
        token: token.to_string(),
        ..relay.pairing_payload()
    }
}

fn client_config() -> ClientConfig {
    ClientConfig {
        event_buffer: 256,
        ..ClientConfig::default()
    }
}

async fn wait_for<T>(
    events: &mut mpsc::Receiver<LinkEvent>,
    mut pick: impl FnMut(LinkEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("link stopped");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for link event")
}

async fn open_link(relay: &RunningRelay) -> (Link, mpsc::Receiver<LinkEvent>) {
    let payload = payload_for(relay, &relay.session.info().token);
    let (link, mut events) = Link::spawn(
        &client_config(),
        payload,
        TurnSettings::default(),
        WsDialer,
    );
    wait_for(&mut events, |e| {
        matches!(e, LinkEvent::State(ConnectionState::Open)).then_some(())
    })
    .await;
    (link, events)
}

#[tokio::test]
async fn handshake_bootstrap_and_greeting() {
    let relay = start_relay().await;
    let payload = payload_for(&relay, &relay.session.info().token);
    let (link, mut events) = Link::spawn(
        &client_config(),
        payload,
        TurnSettings::default(),
        WsDialer,
    );

    let snapshot = wait_for(&mut events, |e| match e {
        LinkEvent::Bootstrapped(snapshot) => Some(snapshot),
        _ => None,
    })
    .await;
    assert_eq!(snapshot.account.auth_mode, "apiKey");
    assert!(snapshot.account.requires_openai_auth);
    assert_eq!(snapshot.models[0].display_name, "GPT-5");
    assert_eq!(snapshot.threads[0].preview, "earlier work");

    // Control frames that arrived during the handshake follow it in order.
    let name = wait_for(&mut events, |e| match e {
        LinkEvent::Control(ControlMessage::Hello { name, .. }) => Some(name),
        _ => None,
    })
    .await;
    assert_eq!(name, "Test Bridge");
    let state = wait_for(&mut events, |e| match e {
        LinkEvent::Control(ControlMessage::AppServerStatus { state, .. }) => Some(state),
        _ => None,
    })
    .await;
    assert!(matches!(state, AgentState::Starting | AgentState::Running));

    link.shutdown().await;
    relay.shutdown();
}

#[tokio::test]
async fn prompt_streams_a_turn_through_the_relay() {
    let relay = start_relay().await;
    let (link, mut events) = open_link(&relay).await;

    link.send(LinkCommand::SendPrompt {
        text: "say hello".into(),
    });
    let session = wait_for(&mut events, |e| match e {
        LinkEvent::Session(s) if s.turn_status() == TurnStatus::Completed => Some(s),
        _ => None,
    })
    .await;

    assert_eq!(session.active_thread_id(), Some("thr-1"));
    assert_eq!(session.active_turn_id(), None);
    let texts: Vec<&str> = session.transcript().iter().map(|i| i.text.as_str()).collect();
    assert_eq!(texts, ["say hello", "Hello from the agent"]);

    link.shutdown().await;
    relay.shutdown();
}

#[tokio::test]
async fn approval_round_trip_through_the_relay() {
    let relay = start_relay().await;
    let (link, mut events) = open_link(&relay).await;

    link.send(LinkCommand::SendPrompt {
        text: "run ls please".into(),
    });
    let approval = wait_for(&mut events, |e| match e {
        LinkEvent::ApprovalRequested { approval, .. } => Some(approval),
        _ => None,
    })
    .await;
    assert_eq!(approval.request_id, 900);
    assert_eq!(approval.kind, ApprovalKind::CommandExecution);
    assert_eq!(approval.cwd.as_deref(), Some("/tmp"));

    link.send(LinkCommand::Approve {
        request_id: 900,
        accept_settings: None,
    });
    let decision = wait_for(&mut events, |e| match e {
        LinkEvent::ApprovalResolved {
            request_id: 900,
            decision,
        } => Some(decision),
        _ => None,
    })
    .await;
    assert_eq!(decision, Decision::Accept);

    let session = wait_for(&mut events, |e| match e {
        LinkEvent::Session(s) if s.turn_status() == TurnStatus::Completed => Some(s),
        _ => None,
    })
    .await;
    let command = session.item("c1").unwrap();
    assert_eq!(command.title, "Command: ls");
    assert!(command.text.contains("approved"));

    link.shutdown().await;
    relay.shutdown();
}

#[tokio::test]
async fn wrong_token_and_busy_bridge_are_diagnosed() {
    let relay = start_relay().await;

    let bad = payload_for(&relay, "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz");
    let err = connect::connect(&bad, Duration::from_secs(2), &WsDialer)
        .await
        .err()
        .unwrap();
    assert_eq!(
        err.attempts()[0].reason,
        Some(AttemptReason::Closed(Some(401)))
    );
    assert_eq!(
        err.attempts()[1].reason,
        Some(AttemptReason::EndpointUnavailable)
    );

    let (link, _events) = open_link(&relay).await;
    let second = payload_for(&relay, &relay.session.info().token);
    let err = connect::connect(&second, Duration::from_secs(2), &WsDialer)
        .await
        .err()
        .unwrap();
    assert!(err.attempts()[0].reason.unwrap().is_busy());
    assert_eq!(
        agentlink::diagnostics::build_connection_hint(err.attempts()),
        "Another phone is connected to this bridge. Disconnect it or restart bridge."
    );

    link.shutdown().await;
    relay.shutdown();
}
