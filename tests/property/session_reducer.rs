//! Property-based tests for the client's pure state logic.
//!
//! Uses proptest to verify:
//! 1. Streaming deltas fold into exactly their concatenation.
//! 2. Interleaved items keep first-seen order and their own text.
//! 3. Completion of any other turn never ends the active one.
//! 4. Arbitrary notifications never panic the reducer.
//! 5. Reconnect delays are non-decreasing and capped.
//! 6. Destructive commands are always classified high risk.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use agentlink::approvals::{self, RiskLevel};
use agentlink::reconnect::ReconnectPolicy;
use agentlink::session::{SessionState, TurnStatus};
use proptest::prelude::*;
use serde_json::{Value, json};

fn arb_delta() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 .,!?]{1,12}"
}

fn delta(item_id: &str, text: &str) -> Value {
    json!({ "itemId": item_id, "delta": text })
}

fn started_turn(turn_id: &str) -> SessionState {
    SessionState::new().apply("turn/started", Some(&json!({ "turn": { "id": turn_id } })))
}

proptest! {
    #[test]
    fn agent_message_deltas_concatenate(
        deltas in prop::collection::vec(arb_delta(), 1..32),
        announce in any::<bool>(),
    ) {
        let mut state = started_turn("t1");
        if announce {
            state = state.apply(
                "item/started",
                Some(&json!({ "item": { "type": "agentMessage", "id": "m1", "text": "" } })),
            );
        }
        for d in &deltas {
            state = state.apply("item/agentMessage/delta", Some(&delta("m1", d)));
        }

        prop_assert_eq!(state.transcript().len(), 1);
        prop_assert_eq!(&state.item("m1").unwrap().text, &deltas.concat());
    }

    #[test]
    fn interleaved_items_keep_order_and_text(
        steps in prop::collection::vec((0usize..3, arb_delta()), 1..48),
    ) {
        let ids = ["a", "b", "c"];
        let mut state = started_turn("t1");
        let mut expected: Vec<(&str, String)> = Vec::new();
        for (which, text) in &steps {
            let id = ids[*which];
            state = state.apply("item/agentMessage/delta", Some(&delta(id, text)));
            match expected.iter_mut().find(|(seen, _)| *seen == id) {
                Some((_, acc)) => acc.push_str(text),
                None => expected.push((id, text.clone())),
            }
        }

        let actual: Vec<(&str, &str)> = state
            .transcript()
            .iter()
            .map(|item| (item.id.as_str(), item.text.as_str()))
            .collect();
        let expected: Vec<(&str, &str)> =
            expected.iter().map(|(id, text)| (*id, text.as_str())).collect();
        prop_assert_eq!(actual, expected);
    }

    #[test]
    fn stale_completion_never_ends_active_turn(
        active in "turn-[a-z0-9]{1,6}",
        other in "turn-[a-z0-9]{1,6}",
    ) {
        prop_assume!(active != other);
        let state = started_turn(&active)
            .apply("turn/completed", Some(&json!({ "turn": { "id": other, "status": "completed" } })));
        prop_assert_eq!(state.turn_status(), TurnStatus::InProgress);
        prop_assert_eq!(state.active_turn_id(), Some(active.as_str()));

        let state = state
            .apply("turn/completed", Some(&json!({ "turn": { "id": active, "status": "failed" } })));
        prop_assert_eq!(state.turn_status(), TurnStatus::Failed);
        prop_assert_eq!(state.active_turn_id(), None);
    }

    #[test]
    fn arbitrary_notifications_never_panic(
        method in prop_oneof![
            Just("item/started".to_string()),
            Just("item/completed".to_string()),
            Just("item/agentMessage/delta".to_string()),
            Just("item/commandExecution/outputDelta".to_string()),
            Just("turn/started".to_string()),
            Just("turn/completed".to_string()),
            Just("turn/plan/updated".to_string()),
            Just("turn/diff/updated".to_string()),
            "[a-z/]{0,24}",
        ],
        raw in "\\PC{0,64}",
        key in "[a-zA-Z]{1,8}",
        value in "\\PC{0,16}",
    ) {
        let params = serde_json::from_str::<Value>(&raw)
            .unwrap_or_else(|_| json!({ key: value, "item": { "type": value } }));
        let state = SessionState::new()
            .apply(&method, Some(&params))
            .apply(&method, None);
        prop_assert!(state.transcript().len() <= 2);
    }

    #[test]
    fn reconnect_delay_is_monotonic_and_capped(
        base_ms in 1u64..5_000,
        max_ms in 1u64..120_000,
        attempt in 0u32..200,
    ) {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
        };
        let current = policy.delay(attempt);
        let next = policy.delay(attempt.saturating_add(1));
        prop_assert!(current <= next);
        prop_assert!(next <= policy.max_delay);
        prop_assert_eq!(policy.delay(0), policy.delay(1));
        prop_assert_eq!(policy.delay(1), policy.base_delay.min(policy.max_delay));
    }

    #[test]
    fn destructive_commands_are_high_risk(
        prefix in "[a-z ]{0,12}",
        target in "[a-z/._-]{1,16}",
    ) {
        let command = format!("{prefix} rm -rf {target}");
        let approval = approvals::parse_request(
            1,
            "item/commandExecution/requestApproval",
            Some(&json!({
                "itemId": "c1",
                "threadId": "thr",
                "turnId": "t1",
                "command": command,
            })),
        )
        .unwrap();
        prop_assert_eq!(approvals::summarize_risk(&approval).level, RiskLevel::High);
    }
}
