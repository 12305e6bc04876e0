//! Shared protocol definitions for the `AgentLink` wire format.
//!
//! Everything that crosses the relay socket is JSON text: agent JSON-RPC
//! frames and the `__bridge` control channel multiplexed next to them. The
//! pairing payload is the out-of-band descriptor a client scans to find and
//! authenticate to a relay.

pub mod control;
pub mod jsonrpc;
pub mod pairing;

/// Returns the current wall-clock time as milliseconds since the Unix epoch.
///
/// Saturates to zero if the system clock is set before the epoch.
#[must_use]
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
