//! `AgentLink` relay -- exposes a local agent server to one mobile client.
//!
//! Spawns the agent server (`codex app-server` by default), serves a
//! token-protected WebSocket at `/ws`, and prints the pairing payload a
//! client needs to connect.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:8787 with a fresh token
//! cargo run --bin agentlink-relay
//!
//! # Custom port and agent binary
//! cargo run --bin agentlink-relay -- --port 9000 --agent-bin /opt/codex/bin/codex
//!
//! # Or via environment variables
//! AGENTLINK_PORT=9000 AGENTLINK_LOG=debug cargo run --bin agentlink-relay
//! ```

use agentlink_relay::config::{RelayCliArgs, RelayConfig};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr(), agent = %config.agent_bin, "starting agentlink relay");

    let mut relay = match agentlink_relay::launch(&config).await {
        Ok(relay) => relay,
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay");
            std::process::exit(1);
        }
    };

    let info = relay.session.info();
    tracing::info!(addr = %relay.addr, name = %info.name, "relay listening");
    tracing::info!(
        lan = info.endpoints.lan.as_deref().unwrap_or("unavailable"),
        tailscale = info.endpoints.tailscale.as_deref().unwrap_or("unavailable"),
        "advertised endpoints"
    );

    match relay.pairing_payload().to_json() {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::warn!(error = %e, "no usable pairing payload, clients cannot connect"),
    }

    tokio::select! {
        () = relay.wait() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutting down");
        }
    }
    relay.shutdown();
}
