//! Configuration system for the `AgentLink` relay.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/agentlink-relay/config.toml`)
//! 4. Compiled defaults
//!
//! The pairing token is never persisted: unless one is configured, a fresh
//! random token is generated on every start.

use std::path::PathBuf;

use agentlink_proto::pairing::MIN_TOKEN_LEN;
use base64::Engine;
use rand::Rng;

/// Number of random bytes behind a generated token (32 base64url chars).
const TOKEN_BYTES: usize = 24;

/// Errors that can occur when loading relay configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A configured token is too short to be used as a pairing secret.
    #[error("token must be at least {MIN_TOKEN_LEN} characters")]
    TokenTooShort,
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the relay.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerFileConfig,
    agent: AgentFileConfig,
    auth: AuthFileConfig,
}

/// `[server]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    host: Option<String>,
    port: Option<u16>,
    name: Option<String>,
    token: Option<String>,
}

/// `[agent]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AgentFileConfig {
    bin: Option<String>,
    args: Option<Vec<String>>,
    cwd: Option<PathBuf>,
}

/// `[auth]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AuthFileConfig {
    open_browser: Option<bool>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the relay.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "AgentLink relay: exposes a local agent server to one mobile client")]
pub struct RelayCliArgs {
    /// Interface address to listen on.
    #[arg(long, env = "AGENTLINK_HOST")]
    pub host: Option<String>,

    /// TCP port to listen on.
    #[arg(short, long, env = "AGENTLINK_PORT")]
    pub port: Option<u16>,

    /// Display name advertised to clients.
    #[arg(short, long, env = "AGENTLINK_NAME")]
    pub name: Option<String>,

    /// Fixed pairing token (default: random per start).
    #[arg(long, env = "AGENTLINK_TOKEN")]
    pub token: Option<String>,

    /// Agent server executable.
    #[arg(long, env = "AGENTLINK_AGENT_BIN")]
    pub agent_bin: Option<String>,

    /// Working directory for the agent server.
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Do not open login URLs in the local browser.
    #[arg(long)]
    pub no_open_auth_url: bool,

    /// Path to config file (default: `~/.config/agentlink-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "AGENTLINK_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Interface address to listen on.
    pub host: String,
    /// TCP port to listen on.
    pub port: u16,
    /// Display name advertised in `hello` and the pairing payload.
    pub name: String,
    /// Shared secret clients must present as the `token` query parameter.
    pub token: String,
    /// Agent server executable.
    pub agent_bin: String,
    /// Arguments passed to the agent server.
    pub agent_args: Vec<String>,
    /// Working directory of the agent server.
    pub cwd: PathBuf,
    /// Whether detected login URLs are opened in the local browser.
    pub open_auth_url: bool,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
            name: "AgentLink Bridge".to_string(),
            token: generate_token(),
            agent_bin: default_agent_bin().to_string(),
            agent_args: vec!["app-server".to_string()],
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            open_auth_url: true,
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if the configured token is too short.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        if config.token.chars().count() < MIN_TOKEN_LEN {
            return Err(ConfigError::TokenTooShort);
        }
        Ok(config)
    }

    /// Socket address string the server binds to.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolve a `RelayConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &RelayCliArgs, file: &RelayConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            host: cli
                .host
                .clone()
                .or_else(|| file.server.host.clone())
                .unwrap_or(defaults.host),
            port: cli.port.or(file.server.port).unwrap_or(defaults.port),
            name: cli
                .name
                .clone()
                .or_else(|| file.server.name.clone())
                .unwrap_or(defaults.name),
            token: cli
                .token
                .clone()
                .or_else(|| file.server.token.clone())
                .unwrap_or(defaults.token),
            agent_bin: cli
                .agent_bin
                .clone()
                .or_else(|| file.agent.bin.clone())
                .unwrap_or(defaults.agent_bin),
            agent_args: file.agent.args.clone().unwrap_or(defaults.agent_args),
            cwd: cli
                .cwd
                .clone()
                .or_else(|| file.agent.cwd.clone())
                .unwrap_or(defaults.cwd),
            open_auth_url: !cli.no_open_auth_url
                && file.auth.open_browser.unwrap_or(defaults.open_auth_url),
            log_level: cli.log_level.clone(),
        }
    }
}

/// Generates a fresh URL-safe pairing token.
#[must_use]
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

const fn default_agent_bin() -> &'static str {
    if cfg!(windows) { "codex.cmd" } else { "codex" }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file for the relay.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<RelayConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(RelayConfigFile::default());
        };
        config_dir.join("agentlink-relay").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8787);
        assert_eq!(config.agent_args, vec!["app-server".to_string()]);
        assert!(config.open_auth_url);
        assert_eq!(config.bind_addr(), "0.0.0.0:8787");
    }

    #[test]
    fn generated_tokens_are_long_and_fresh() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 32);
        assert!(a.len() >= MIN_TOKEN_LEN);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn toml_parsing_full() {
        let toml_str = r#"
[server]
host = "127.0.0.1"
port = 9100
name = "Desk"
token = "abcdefghijklmnopqrstuvwxyz"

[agent]
bin = "/usr/local/bin/codex"
args = ["app-server", "--verbose"]
cwd = "/work"

[auth]
open_browser = false
"#;
        let file: RelayConfigFile = toml::from_str(toml_str).unwrap();
        let cli = RelayCliArgs::default();
        let config = RelayConfig::resolve(&cli, &file);

        assert_eq!(config.bind_addr(), "127.0.0.1:9100");
        assert_eq!(config.name, "Desk");
        assert_eq!(config.token, "abcdefghijklmnopqrstuvwxyz");
        assert_eq!(config.agent_bin, "/usr/local/bin/codex");
        assert_eq!(config.agent_args.len(), 2);
        assert_eq!(config.cwd, PathBuf::from("/work"));
        assert!(!config.open_auth_url);
    }

    #[test]
    fn toml_parsing_partial() {
        let toml_str = r"
[server]
port = 9999
";
        let file: RelayConfigFile = toml::from_str(toml_str).unwrap();
        let config = RelayConfig::resolve(&RelayCliArgs::default(), &file);

        assert_eq!(config.host, "0.0.0.0"); // default
        assert_eq!(config.port, 9999); // from file
        assert_eq!(config.token.len(), 32); // generated
    }

    #[test]
    fn toml_parsing_empty() {
        let file: RelayConfigFile = toml::from_str("").unwrap();
        let config = RelayConfig::resolve(&RelayCliArgs::default(), &file);
        assert_eq!(config.port, 8787);
        assert_eq!(config.name, "AgentLink Bridge");
    }

    #[test]
    fn cli_overrides_file() {
        let toml_str = r#"
[server]
host = "127.0.0.1"
port = 9100
"#;
        let file: RelayConfigFile = toml::from_str(toml_str).unwrap();
        let cli = RelayCliArgs {
            port: Some(3000),
            no_open_auth_url: true,
            ..Default::default()
        };
        let config = RelayConfig::resolve(&cli, &file);

        assert_eq!(config.port, 3000); // from CLI
        assert_eq!(config.host, "127.0.0.1"); // from file
        assert!(!config.open_auth_url);
    }

    #[test]
    fn short_token_is_rejected() {
        let dir = std::env::temp_dir().join(format!("agentlink-relay-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[server]\ntoken = \"short\"\n").unwrap();
        let cli = RelayCliArgs {
            config: Some(path),
            ..Default::default()
        };
        assert!(matches!(
            RelayConfig::load(&cli),
            Err(ConfigError::TokenTooShort)
        ));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = load_config_file(None);
        assert!(result.is_ok());
    }

    #[test]
    fn explicit_missing_config_file_returns_error() {
        let result = load_config_file(Some(std::path::Path::new("/nonexistent/config.toml")));
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }
}
