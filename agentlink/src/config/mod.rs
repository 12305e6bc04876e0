//! Configuration system for the `AgentLink` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/agentlink/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use agentlink_proto::pairing::{PairingError, PairingPayload, parse_pairing_payload};

use crate::approvals::DEFAULT_APPROVAL_TIMEOUT;
use crate::connect::DEFAULT_CONNECT_TIMEOUT;
use crate::heartbeat::{HeartbeatConfig, HeartbeatError};
use crate::reconnect::ReconnectPolicy;
use crate::rpc::DEFAULT_REQUEST_TIMEOUT;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read a configuration or pairing file.
    #[error("failed to read {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// Heartbeat settings are unusable.
    #[error(transparent)]
    Heartbeat(#[from] HeartbeatError),

    /// No pairing payload was supplied.
    #[error("no pairing payload given (use --pairing <file> or --pairing -)")]
    MissingPairing,

    /// The pairing payload is malformed.
    #[error(transparent)]
    Pairing(#[from] PairingError),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    connection: ConnectionFileConfig,
    rpc: RpcFileConfig,
    heartbeat: HeartbeatFileConfig,
    reconnect: ReconnectFileConfig,
    approvals: ApprovalsFileConfig,
}

/// `[connection]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConnectionFileConfig {
    connect_timeout_ms: Option<u64>,
    pairing_file: Option<PathBuf>,
    event_buffer: Option<usize>,
}

/// `[rpc]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RpcFileConfig {
    request_timeout_ms: Option<u64>,
}

/// `[heartbeat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct HeartbeatFileConfig {
    interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
    max_consecutive_timeouts: Option<u32>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

/// `[approvals]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ApprovalsFileConfig {
    timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Where to read the pairing payload from (`-` is stdin).
    pub pairing_source: Option<PathBuf>,
    /// Per-endpoint connection attempt timeout.
    pub connect_timeout: Duration,
    /// Per-request RPC timeout.
    pub request_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectPolicy,
    /// Time before an unanswered approval is auto-declined.
    pub approval_timeout: Duration,
    /// Capacity of the link event channel.
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pairing_source: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectPolicy::default(),
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT,
            event_buffer: 256,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if the resulting heartbeat settings are invalid.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.heartbeat.validate()?;
        Ok(config)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. This is separated from `load()` to
    /// enable unit testing without CLI parsing.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let ms = Duration::from_millis;

        Self {
            pairing_source: cli
                .pairing
                .clone()
                .or_else(|| file.connection.pairing_file.clone()),
            connect_timeout: cli
                .connect_timeout_ms
                .or(file.connection.connect_timeout_ms)
                .map_or(defaults.connect_timeout, ms),
            request_timeout: file
                .rpc
                .request_timeout_ms
                .map_or(defaults.request_timeout, ms),
            heartbeat: HeartbeatConfig {
                interval: file
                    .heartbeat
                    .interval_ms
                    .map_or(defaults.heartbeat.interval, ms),
                timeout: file
                    .heartbeat
                    .timeout_ms
                    .map_or(defaults.heartbeat.timeout, ms),
                max_consecutive_timeouts: file
                    .heartbeat
                    .max_consecutive_timeouts
                    .unwrap_or(defaults.heartbeat.max_consecutive_timeouts),
            },
            reconnect: ReconnectPolicy {
                base_delay: file
                    .reconnect
                    .base_delay_ms
                    .map_or(defaults.reconnect.base_delay, ms),
                max_delay: file
                    .reconnect
                    .max_delay_ms
                    .map_or(defaults.reconnect.max_delay, ms),
            },
            approval_timeout: file
                .approvals
                .timeout_ms
                .map_or(defaults.approval_timeout, ms),
            event_buffer: file
                .connection
                .event_buffer
                .unwrap_or(defaults.event_buffer),
        }
    }

    /// Reads and validates the pairing payload named by `pairing_source`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingPairing`] when no source is configured,
    /// [`ConfigError::ReadFile`] when it cannot be read and
    /// [`ConfigError::Pairing`] when the payload is invalid.
    pub fn read_pairing(&self) -> Result<PairingPayload, ConfigError> {
        let source = self
            .pairing_source
            .as_deref()
            .ok_or(ConfigError::MissingPairing)?;
        let raw = if source == Path::new("-") {
            std::io::read_to_string(std::io::stdin()).map_err(|e| ConfigError::ReadFile {
                path: source.to_path_buf(),
                source: e,
            })?
        } else {
            std::fs::read_to_string(source).map_err(|e| ConfigError::ReadFile {
                path: source.to_path_buf(),
                source: e,
            })?
        };
        Ok(parse_pairing_payload(raw.trim())?)
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Mobile-style client for an AgentLink relay")]
pub struct CliArgs {
    /// Pairing payload file printed by the relay (`-` reads stdin).
    #[arg(long, env = "AGENTLINK_PAIRING")]
    pub pairing: Option<PathBuf>,

    /// Per-endpoint connect timeout in milliseconds.
    #[arg(long, env = "AGENTLINK_CONNECT_TIMEOUT_MS")]
    pub connect_timeout_ms: Option<u64>,

    /// Path to config file (default: `~/.config/agentlink/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "AGENTLINK_CLIENT_LOG")]
    pub log_level: String,

    /// Path to log file (default: stderr).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("agentlink").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
