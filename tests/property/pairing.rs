//! Property-based tests for pairing payloads and frame classification.
//!
//! Uses proptest to verify:
//! 1. Any valid `PairingPayload` survives serialize → parse unchanged.
//! 2. Tokens shorter than the minimum always fail validation.
//! 3. Arbitrary text never panics the frame classifier.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use agentlink_proto::jsonrpc;
use agentlink_proto::pairing::{Endpoints, MIN_TOKEN_LEN, PairingPayload, parse_pairing_payload};
use proptest::prelude::*;

/// Strategy for `ws://` / `wss://` endpoint URLs.
fn arb_endpoint() -> impl Strategy<Value = String> {
    (
        prop_oneof![Just("ws"), Just("wss")],
        any::<[u8; 4]>(),
        1024u16..65535,
    )
        .prop_map(|(scheme, ip, port)| {
            format!("{scheme}://{}.{}.{}.{}:{port}/ws", ip[0], ip[1], ip[2], ip[3])
        })
}

/// Strategy for endpoint sets with at least one entry.
fn arb_endpoints() -> impl Strategy<Value = Endpoints> {
    (
        proptest::option::of(arb_endpoint()),
        proptest::option::of(arb_endpoint()),
    )
        .prop_filter("at least one endpoint", |(lan, ts)| {
            lan.is_some() || ts.is_some()
        })
        .prop_map(|(lan, tailscale)| Endpoints { lan, tailscale })
}

/// Strategy for valid payloads.
fn arb_payload() -> impl Strategy<Value = PairingPayload> {
    (
        "[A-Za-z][A-Za-z0-9 ]{0,31}",
        "[A-Za-z0-9_-]{24,64}",
        arb_endpoints(),
        proptest::option::of("/[a-z/]{0,40}"),
    )
        .prop_map(|(name, token, endpoints, cwd_hint)| PairingPayload {
            v: 1,
            name,
            token,
            endpoints,
            cwd_hint,
        })
}

proptest! {
    #[test]
    fn payload_round_trip(payload in arb_payload()) {
        let text = payload.to_json().unwrap();
        let parsed = parse_pairing_payload(&text).unwrap();
        prop_assert_eq!(payload, parsed);
    }

    #[test]
    fn short_tokens_are_rejected(
        payload in arb_payload(),
        len in 0..MIN_TOKEN_LEN,
    ) {
        let mut payload = payload;
        payload.token = "x".repeat(len);
        prop_assert!(payload.validate().is_err());
    }

    #[test]
    fn classify_never_panics(text in ".{0,256}") {
        let _ = jsonrpc::classify(&text);
    }
}
