//! Pairing payload: the bootstrap descriptor a client needs to locate and
//! authenticate to a relay.
//!
//! The relay issues a fresh payload (with a fresh token) on every start and
//! renders it as compact JSON, typically inside a QR code. Clients parse and
//! validate it before attempting any connection.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The only pairing payload version currently understood.
pub const PAIRING_VERSION: u8 = 1;

/// Minimum length of the shared secret token, in characters.
pub const MIN_TOKEN_LEN: usize = 24;

/// Errors produced while parsing or validating a pairing payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    /// The raw text is not JSON at all.
    #[error("Pairing payload is not valid JSON")]
    InvalidJson,
    /// The JSON is well-formed but does not describe a valid payload.
    #[error("invalid pairing payload: {0}")]
    Invalid(String),
}

/// Kind of network path an endpoint is reachable over.
///
/// The declaration order is the connection priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    /// Local network address.
    Lan,
    /// Private mesh overlay (Tailscale) address.
    Tailscale,
}

impl EndpointKind {
    /// All endpoint kinds in the order a client must try them.
    pub const PRIORITY: [Self; 2] = [Self::Lan, Self::Tailscale];

    /// Wire name used in reasons and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lan => "lan",
            Self::Tailscale => "tailscale",
        }
    }

    /// Short human-facing label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Lan => "LAN",
            Self::Tailscale => "Tailnet",
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// WebSocket URLs a relay is reachable at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// LAN endpoint, e.g. `ws://192.168.1.20:8787/ws`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lan: Option<String>,
    /// Tailscale endpoint, e.g. `ws://100.101.102.103:8787/ws`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tailscale: Option<String>,
}

impl Endpoints {
    /// Returns the URL configured for `kind`, if any.
    #[must_use]
    pub fn get(&self, kind: EndpointKind) -> Option<&str> {
        match kind {
            EndpointKind::Lan => self.lan.as_deref(),
            EndpointKind::Tailscale => self.tailscale.as_deref(),
        }
    }

    /// Returns `true` when no endpoint is configured.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.lan.is_none() && self.tailscale.is_none()
    }
}

/// Bootstrap descriptor shared from relay to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingPayload {
    /// Payload format version, always [`PAIRING_VERSION`].
    pub v: u8,
    /// Relay display name.
    pub name: String,
    /// Shared secret presented as the `token` query parameter.
    pub token: String,
    /// Reachable endpoints; at least one must be present.
    pub endpoints: Endpoints,
    /// Working directory of the agent process, shown as a hint only.
    #[serde(rename = "cwdHint", default, skip_serializing_if = "Option::is_none")]
    pub cwd_hint: Option<String>,
}

impl PairingPayload {
    /// Checks every field constraint.
    ///
    /// # Errors
    ///
    /// Returns [`PairingError::Invalid`] describing the first violated
    /// constraint.
    pub fn validate(&self) -> Result<(), PairingError> {
        if self.v != PAIRING_VERSION {
            return Err(PairingError::Invalid(format!(
                "unsupported version {} (expected {PAIRING_VERSION})",
                self.v
            )));
        }
        if self.name.trim().is_empty() {
            return Err(PairingError::Invalid("name must not be empty".into()));
        }
        if self.token.chars().count() < MIN_TOKEN_LEN {
            return Err(PairingError::Invalid(format!(
                "token must be at least {MIN_TOKEN_LEN} characters"
            )));
        }
        if self.endpoints.is_empty() {
            return Err(PairingError::Invalid(
                "at least one endpoint is required".into(),
            ));
        }
        for kind in EndpointKind::PRIORITY {
            if let Some(raw) = self.endpoints.get(kind) {
                validate_ws_url(kind, raw)?;
            }
        }
        Ok(())
    }

    /// Serializes the payload to the compact JSON text shared with clients.
    ///
    /// # Errors
    ///
    /// Returns [`PairingError::Invalid`] if the payload fails validation.
    pub fn to_json(&self) -> Result<String, PairingError> {
        self.validate()?;
        serde_json::to_string(self).map_err(|e| PairingError::Invalid(e.to_string()))
    }
}

fn validate_ws_url(kind: EndpointKind, raw: &str) -> Result<(), PairingError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| PairingError::Invalid(format!("{kind} endpoint is not a URL: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(PairingError::Invalid(format!(
            "{kind} endpoint must use ws:// or wss://, got {other}://"
        ))),
    }
}

/// Parses and validates pairing payload text.
///
/// # Errors
///
/// Returns [`PairingError::InvalidJson`] when `raw` is not JSON, and
/// [`PairingError::Invalid`] when the JSON does not form a valid payload.
pub fn parse_pairing_payload(raw: &str) -> Result<PairingPayload, PairingError> {
    let value: serde_json::Value =
        serde_json::from_str(raw.trim()).map_err(|_| PairingError::InvalidJson)?;
    let payload: PairingPayload =
        serde_json::from_value(value).map_err(|e| PairingError::Invalid(e.to_string()))?;
    payload.validate()?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PairingPayload {
        PairingPayload {
            v: 1,
            name: "Desk".into(),
            token: "a".repeat(MIN_TOKEN_LEN),
            endpoints: Endpoints {
                lan: Some("ws://192.168.1.20:8787/ws".into()),
                tailscale: None,
            },
            cwd_hint: Some("/home/dev/project".into()),
        }
    }

    #[test]
    fn valid_payload_passes() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn json_shape_uses_wire_names() {
        let json: serde_json::Value =
            serde_json::from_str(&sample().to_json().unwrap()).unwrap();
        assert_eq!(json["v"], 1);
        assert_eq!(json["cwdHint"], "/home/dev/project");
        assert!(json["endpoints"].get("tailscale").is_none());
    }

    #[test]
    fn non_json_text_is_rejected() {
        assert_eq!(
            parse_pairing_payload("not json").unwrap_err(),
            PairingError::InvalidJson
        );
        assert_eq!(
            PairingError::InvalidJson.to_string(),
            "Pairing payload is not valid JSON"
        );
    }

    #[test]
    fn zero_endpoints_fail() {
        let mut payload = sample();
        payload.endpoints = Endpoints::default();
        let err = payload.validate().unwrap_err();
        assert!(err.to_string().contains("at least one endpoint is required"));
    }

    #[test]
    fn short_token_fails() {
        let mut payload = sample();
        payload.token = "a".repeat(MIN_TOKEN_LEN - 1);
        assert!(payload.validate().is_err());
    }

    #[test]
    fn http_endpoint_fails() {
        let mut payload = sample();
        payload.endpoints.tailscale = Some("http://100.64.0.1:8787/ws".into());
        let err = payload.validate().unwrap_err();
        assert!(err.to_string().contains("tailscale"));
    }

    #[test]
    fn wrong_version_fails() {
        let mut payload = sample();
        payload.v = 2;
        assert!(payload.validate().is_err());
    }

    #[test]
    fn missing_field_is_invalid_not_json_error() {
        let err = parse_pairing_payload(r#"{"v":1,"name":"x"}"#).unwrap_err();
        assert!(matches!(err, PairingError::Invalid(_)));
    }

    #[test]
    fn endpoint_kind_priority_is_lan_first() {
        assert_eq!(
            EndpointKind::PRIORITY,
            [EndpointKind::Lan, EndpointKind::Tailscale]
        );
        assert_eq!(EndpointKind::Tailscale.label(), "Tailnet");
    }
}
