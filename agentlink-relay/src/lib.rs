//! `AgentLink` relay library.
//!
//! Exposes the relay for use in tests and embedding. The relay owns one
//! agent server subprocess and exposes it to a single authenticated mobile
//! client over a WebSocket at `/ws`.

pub mod agent;
pub mod auth_url;
pub mod client_log;
pub mod config;
pub mod network;
pub mod relay;

use std::net::SocketAddr;
use std::sync::Arc;

use agentlink_proto::pairing::PairingPayload;

use crate::agent::{AgentCommand, AgentProcess};
use crate::auth_url::{BrowserLauncher, SystemBrowser};
use crate::config::RelayConfig;
use crate::relay::{RelayInfo, RelaySession};

/// A relay whose server, agent process and event pump are all running.
pub struct RunningRelay {
    /// Address the WebSocket server is bound to.
    pub addr: SocketAddr,
    /// Shared session state.
    pub session: Arc<RelaySession>,
    agent: AgentProcess,
    server: tokio::task::JoinHandle<()>,
    pump: tokio::task::JoinHandle<()>,
}

impl RunningRelay {
    /// Pairing payload for this run.
    #[must_use]
    pub fn pairing_payload(&self) -> PairingPayload {
        self.session.info().pairing_payload()
    }

    /// Waits until the server task ends.
    pub async fn wait(&mut self) {
        if let Err(e) = (&mut self.server).await {
            tracing::error!(error = %e, "relay server task failed");
        }
    }

    /// Stops the server and kills the agent process.
    pub fn shutdown(mut self) {
        self.server.abort();
        self.agent.shutdown();
        self.pump.abort();
    }
}

/// Binds the listener, starts the agent and begins serving.
///
/// Endpoints are discovered after binding so the advertised port is the
/// bound one (useful with port 0).
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind.
pub async fn launch(
    config: &RelayConfig,
) -> Result<RunningRelay, Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let addr = listener.local_addr()?;
    let endpoints = network::resolve_endpoints(&config.host, addr.port());

    let (agent, events) = AgentProcess::spawn(&AgentCommand {
        program: config.agent_bin.clone(),
        args: config.agent_args.clone(),
        cwd: config.cwd.clone(),
    });

    let launcher = config
        .open_auth_url
        .then(|| Arc::new(SystemBrowser) as Arc<dyn BrowserLauncher>);
    let session = Arc::new(RelaySession::new(
        RelayInfo {
            name: config.name.clone(),
            token: config.token.clone(),
            cwd: config.cwd.display().to_string(),
            endpoints,
        },
        agent.input(),
        launcher,
    ));

    let pump = tokio::spawn(Arc::clone(&session).pump_agent_events(events));
    let server = relay::serve(listener, Arc::clone(&session));

    Ok(RunningRelay {
        addr,
        session,
        agent,
        server,
        pump,
    })
}
