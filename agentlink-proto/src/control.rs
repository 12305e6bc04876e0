//! The `__bridge` control channel.
//!
//! Control messages share the socket with agent JSON-RPC traffic. They are
//! wrapped in an object whose only key is [`CONTROL_KEY`], which no JSON-RPC
//! frame ever carries.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::pairing::Endpoints;

/// Reserved key that marks a frame as a control message.
pub const CONTROL_KEY: &str = "__bridge";

/// Current control protocol version announced in [`ControlMessage::Hello`].
pub const CONTROL_VERSION: u8 = 1;

/// Control error code: client text was not JSON.
pub const ERROR_INVALID_JSON: &str = "invalid_json";
/// Control error code: the agent subprocess is not accepting input.
pub const ERROR_APP_SERVER_UNAVAILABLE: &str = "app_server_unavailable";
/// Control error code: a control message the receiver does not handle.
pub const ERROR_UNSUPPORTED_CONTROL: &str = "unsupported_control";

/// Severity of a forwarded client log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Lifecycle state of the agent subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Starting,
    Running,
    Stopped,
    Error,
}

impl AgentState {
    /// Lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Whether the subprocess can accept forwarded RPC input.
    #[must_use]
    pub const fn accepts_input(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

/// Messages carried inside the `__bridge` envelope.
///
/// Serialized as `{"type": "<camelCaseVariant>", ...}` with camelCase fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Relay greeting sent right after a client is accepted.
    Hello {
        /// Control protocol version, [`CONTROL_VERSION`].
        v: u8,
        /// Relay display name.
        name: String,
        /// Working directory of the agent process.
        cwd: String,
        /// Endpoints the relay is advertising.
        endpoints: Endpoints,
        /// Milliseconds since the Unix epoch.
        timestamp: u64,
    },
    /// Heartbeat probe carrying an opaque token.
    Ping { t: u64 },
    /// Heartbeat reply echoing the probe's token.
    Pong { t: u64 },
    /// Relay-side failure that did not close the socket.
    Error {
        /// Machine-readable code, e.g. [`ERROR_INVALID_JSON`].
        code: String,
        /// Human-readable description.
        message: String,
    },
    /// Diagnostic line the client wants written to the relay log.
    ClientLog {
        level: LogLevel,
        source: String,
        message: String,
        timestamp: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Map<String, Value>>,
    },
    /// Outcome of opening a login URL in the host's browser.
    AuthBrowserLaunch {
        url: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Agent subprocess lifecycle change.
    AppServerStatus {
        state: AgentState,
        timestamp: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
}

impl ControlMessage {
    /// Builds an [`ControlMessage::Error`] from a code and message.
    #[must_use]
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Wraps the message in its envelope and serializes it to JSON text.
    #[must_use]
    pub fn to_text(&self) -> String {
        let payload = serde_json::to_value(self).unwrap_or(Value::Null);
        let mut envelope = Map::with_capacity(1);
        envelope.insert(CONTROL_KEY.to_string(), payload);
        Value::Object(envelope).to_string()
    }
}

/// Result of inspecting a JSON object for the control envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlProbe {
    /// Not a control frame.
    Absent,
    /// A well-formed control message.
    Message(ControlMessage),
    /// Carries the reserved key but does not match any known message.
    Malformed(String),
}

/// Checks whether a decoded JSON value is a control frame.
#[must_use]
pub fn probe_control(value: &Value) -> ControlProbe {
    let Some(inner) = value.as_object().and_then(|obj| obj.get(CONTROL_KEY)) else {
        return ControlProbe::Absent;
    };
    match ControlMessage::deserialize(inner) {
        Ok(message) => ControlProbe::Message(message),
        Err(e) => ControlProbe::Malformed(e.to_string()),
    }
}
