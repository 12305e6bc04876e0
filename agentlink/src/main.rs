//! `AgentLink` console client.
//!
//! Reads a pairing payload, connects to the relay it describes and drives a
//! coding-agent session from stdin. Transcript updates, approval requests
//! and connection diagnostics are printed to stdout; logs go to stderr or
//! to `--log-file`.
//!
//! ```bash
//! # Pairing payload printed by agentlink-relay
//! cargo run --bin agentlink -- --pairing pairing.json
//!
//! # Or piped in
//! agentlink-relay | head -n1 | cargo run --bin agentlink -- --pairing -
//! ```

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use agentlink::app::{self, HELP, Input, TranscriptPrinter};
use agentlink::bootstrap::TurnSettings;
use agentlink::config::{CliArgs, ClientConfig};
use agentlink::connect::WsDialer;
use agentlink::net::{Link, LinkEvent};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let payload = match config.read_pairing() {
        Ok(payload) => payload,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(bridge = %payload.name, "agentlink starting");

    let settings = TurnSettings {
        cwd: payload.cwd_hint.clone(),
        ..TurnSettings::default()
    };
    let (link, events) = Link::spawn(&config, payload, settings, WsDialer);
    let printer = tokio::spawn(print_events(events));

    // A payload piped through stdin leaves nothing to read commands from.
    let interactive = config.pairing_source.as_deref() != Some(Path::new("-"));
    if interactive {
        println!("{HELP}");
    }
    tokio::select! {
        () = read_input(&link, interactive) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        }
    }

    link.shutdown().await;
    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "event printer failed");
    }
    tracing::info!("agentlink exiting");
    ExitCode::SUCCESS
}

/// Initialize logging to `file_path`, or to stderr when no file is given.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered file log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter);

    let Some(log_path) = file_path else {
        subscriber.with_writer(std::io::stderr).init();
        return None;
    };
    let log_dir = log_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = log_path.file_name()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    subscriber
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();
    Some(guard)
}

/// Reads stdin until `/quit` or end of input.
async fn read_input(link: &Link, interactive: bool) {
    if !interactive {
        return std::future::pending().await;
    }
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "failed to read stdin");
                break;
            }
        };
        match app::parse_input(&line) {
            Input::Command(command) => {
                if !link.send(command) {
                    break;
                }
            }
            Input::Help => println!("{HELP}"),
            Input::Quit => break,
            Input::Empty => {}
            Input::Invalid(message) => println!("! {message}"),
        }
    }
}

async fn print_events(mut events: mpsc::Receiver<LinkEvent>) {
    let mut printer = TranscriptPrinter::new();
    while let Some(event) = events.recv().await {
        if let LinkEvent::Latency(ms) = event {
            tracing::debug!(latency_ms = ms, "heartbeat");
        }
        for line in app::render_event(&event, &mut printer) {
            println!("{line}");
        }
    }
}
