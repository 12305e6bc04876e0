//! `AgentLink` client: drives a remote coding-agent session through the
//! relay's single-client WebSocket.

pub mod app;
pub mod approvals;
pub mod bootstrap;
pub mod config;
pub mod connect;
pub mod diagnostics;
pub mod heartbeat;
pub mod net;
pub mod reconnect;
pub mod rpc;
pub mod session;
