//! Human-readable diagnostics derived from the connection attempt log.

use agentlink_proto::pairing::EndpointKind;

use crate::connect::{AttemptReason, ConnectionAttempt};

/// Describes why one attempt failed.
#[must_use]
pub fn describe_attempt_reason(endpoint: EndpointKind, reason: AttemptReason) -> String {
    let label = endpoint.label();
    match reason {
        AttemptReason::EndpointUnavailable => {
            format!("{label} endpoint is not configured in this pairing payload.")
        }
        AttemptReason::Timeout => format!("{label} timed out while connecting."),
        AttemptReason::SocketError => format!("{label} socket error during handshake."),
        r if r.is_token_rejected() => {
            "Pairing token was rejected by bridge. Re-scan QR from the bridge.".to_string()
        }
        r if r.is_busy() => "Bridge already has an active phone connection.".to_string(),
        AttemptReason::Closed(Some(code)) => format!("{label} connection closed ({code})."),
        AttemptReason::Closed(None) => format!("{label} connection closed (unknown)."),
    }
}

fn attempted_and_failed(attempt: &ConnectionAttempt, endpoint: EndpointKind) -> bool {
    attempt.endpoint == endpoint
        && !attempt.success
        && attempt.reason != Some(AttemptReason::EndpointUnavailable)
}

fn unavailable(attempts: &[ConnectionAttempt], endpoint: EndpointKind) -> bool {
    attempts
        .iter()
        .any(|a| a.endpoint == endpoint && a.reason == Some(AttemptReason::EndpointUnavailable))
}

/// Picks the single most useful hint for a failed connection.
///
/// The whole log is considered: a rejected token or a busy bridge on any
/// endpoint outranks generic network failures.
#[must_use]
pub fn build_connection_hint(attempts: &[ConnectionAttempt]) -> &'static str {
    if attempts.is_empty() {
        return "No endpoints were attempted. Verify pairing payload endpoints.";
    }
    let reasons = || attempts.iter().filter_map(|a| a.reason);
    if reasons().any(AttemptReason::is_token_rejected) {
        return "Pairing token is invalid. Re-pair by scanning a fresh QR.";
    }
    if reasons().any(AttemptReason::is_busy) {
        return "Another phone is connected to this bridge. Disconnect it or restart bridge.";
    }
    if unavailable(attempts, EndpointKind::Lan) && unavailable(attempts, EndpointKind::Tailscale) {
        return "Pairing payload has no LAN/Tailnet endpoints. Re-scan bridge QR.";
    }

    let lan_failed = attempts
        .iter()
        .any(|a| attempted_and_failed(a, EndpointKind::Lan));
    let tailnet_failed = attempts
        .iter()
        .any(|a| attempted_and_failed(a, EndpointKind::Tailscale));
    match (lan_failed, tailnet_failed) {
        (true, true) => {
            "LAN and Tailnet both failed. Check computer power, bridge process, Wi-Fi, and Tailscale status."
        }
        (true, false) => {
            "LAN connection failed. Ensure phone and computer are on the same Wi-Fi and bridge is running."
        }
        (false, true) => {
            "Tailnet connection failed. Ensure Tailscale is connected on phone and computer."
        }
        (false, false) => "Connection failed. Verify bridge status and pairing details.",
    }
}

/// One-line summary of an attempt for the diagnostics log.
#[must_use]
pub fn format_attempt_summary(attempt: &ConnectionAttempt) -> String {
    if attempt.success {
        return format!(
            "{} connected in {}ms",
            attempt.endpoint.label(),
            attempt.duration_ms
        );
    }
    match attempt.reason {
        Some(reason) => format!(
            "{} failed: {}",
            attempt.endpoint.label(),
            describe_attempt_reason(attempt.endpoint, reason)
        ),
        None => format!("{} failed: unknown", attempt.endpoint.label()),
    }
}
