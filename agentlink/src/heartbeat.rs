//! Ping/pong liveness and latency measurement over the relay socket.
//!
//! [`HeartbeatMachine`] holds all of the protocol rules and takes the
//! current time as an argument, so it can be driven deterministically.
//! [`Heartbeat::start`] runs it on a tokio task against real timers.
//!
//! Rules:
//! - one ping immediately, then one per interval;
//! - at most one ping outstanding, each with a unique token;
//! - a pong matching the outstanding token reports latency and clears the
//!   consecutive-timeout counter;
//! - a missed deadline or a failed send counts as a timeout;
//! - reaching the maximum consecutive timeouts gives up permanently.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// Errors from heartbeat configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeartbeatError {
    /// A configured value is zero.
    #[error("invalid heartbeat config: {0} must be greater than zero")]
    InvalidConfig(&'static str),
}

/// Heartbeat timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between pings.
    pub interval: Duration,
    /// How long to wait for a pong before counting a timeout.
    pub timeout: Duration,
    /// Consecutive timeouts after which the heartbeat gives up.
    pub max_consecutive_timeouts: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(12_000),
            timeout: Duration::from_millis(5_000),
            max_consecutive_timeouts: 2,
        }
    }
}

impl HeartbeatConfig {
    /// Rejects zero durations and a zero timeout budget.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::InvalidConfig`] naming the offending field.
    pub const fn validate(&self) -> Result<(), HeartbeatError> {
        if self.interval.is_zero() {
            return Err(HeartbeatError::InvalidConfig("interval"));
        }
        if self.timeout.is_zero() {
            return Err(HeartbeatError::InvalidConfig("timeout"));
        }
        if self.max_consecutive_timeouts == 0 {
            return Err(HeartbeatError::InvalidConfig("max_consecutive_timeouts"));
        }
        Ok(())
    }
}

/// Observable heartbeat outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Round-trip time of a matched ping, in milliseconds.
    Latency(u64),
    /// A ping went unanswered; carries the consecutive count.
    Timeout { consecutive: u32 },
    /// A pong arrived after one or more timeouts.
    Recovered,
    /// The consecutive-timeout budget is exhausted; no more pings follow.
    GiveUp { consecutive: u32 },
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    token: u64,
    sent_at_ms: u64,
}

/// Deterministic heartbeat state machine.
///
/// Times are milliseconds on any monotonic clock chosen by the caller.
#[derive(Debug)]
pub struct HeartbeatMachine {
    config: HeartbeatConfig,
    in_flight: Option<InFlight>,
    consecutive_timeouts: u32,
    last_token: u64,
    stopped: bool,
}

impl HeartbeatMachine {
    /// Creates a machine with validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::InvalidConfig`] for zero values.
    pub fn new(config: HeartbeatConfig) -> Result<Self, HeartbeatError> {
        config.validate()?;
        Ok(Self {
            config,
            in_flight: None,
            consecutive_timeouts: 0,
            last_token: 0,
            stopped: false,
        })
    }

    /// Whether the machine has stopped (explicitly or by giving up).
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Token of the outstanding ping, if any.
    #[must_use]
    pub fn in_flight_token(&self) -> Option<u64> {
        self.in_flight.map(|p| p.token)
    }

    /// Consecutive timeouts seen since the last matched pong.
    #[must_use]
    pub const fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// Time at which the outstanding ping expires.
    #[must_use]
    pub fn deadline_ms(&self) -> Option<u64> {
        let timeout = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX);
        self.in_flight.map(|p| p.sent_at_ms.saturating_add(timeout))
    }

    /// Starts a ping if none is outstanding and the machine is running.
    ///
    /// Returns the token to send. Tokens are strictly increasing and never
    /// smaller than `now_ms`.
    pub fn begin_ping(&mut self, now_ms: u64) -> Option<u64> {
        if self.stopped || self.in_flight.is_some() {
            return None;
        }
        let token = now_ms.max(self.last_token + 1);
        self.last_token = token;
        self.in_flight = Some(InFlight {
            token,
            sent_at_ms: now_ms,
        });
        Some(token)
    }

    /// A pong arrived. Tokens other than the outstanding one are ignored.
    pub fn on_pong(&mut self, token: u64, now_ms: u64) -> Vec<HeartbeatEvent> {
        if self.stopped {
            return Vec::new();
        }
        let Some(in_flight) = self.in_flight.filter(|p| p.token == token) else {
            return Vec::new();
        };
        self.in_flight = None;
        let mut events = vec![HeartbeatEvent::Latency(
            now_ms.saturating_sub(in_flight.sent_at_ms),
        )];
        if self.consecutive_timeouts > 0 {
            self.consecutive_timeouts = 0;
            events.push(HeartbeatEvent::Recovered);
        }
        events
    }

    /// The outstanding ping with `token` reached its deadline.
    pub fn on_deadline(&mut self, token: u64) -> Vec<HeartbeatEvent> {
        if self.stopped || self.in_flight_token() != Some(token) {
            return Vec::new();
        }
        self.in_flight = None;
        self.record_timeout()
    }

    /// Sending the ping with `token` failed synchronously.
    pub fn on_send_failed(&mut self, token: u64) -> Vec<HeartbeatEvent> {
        self.on_deadline(token)
    }

    /// Stops the machine. Idempotent.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.in_flight = None;
    }

    fn record_timeout(&mut self) -> Vec<HeartbeatEvent> {
        self.consecutive_timeouts += 1;
        let consecutive = self.consecutive_timeouts;
        let mut events = vec![HeartbeatEvent::Timeout { consecutive }];
        if consecutive >= self.config.max_consecutive_timeouts {
            self.stop();
            events.push(HeartbeatEvent::GiveUp { consecutive });
        }
        events
    }
}

#[derive(Debug)]
enum Command {
    Pong(u64),
    Stop,
}

/// Handle to a running heartbeat task.
///
/// Dropping the handle stops the heartbeat.
#[derive(Debug)]
pub struct Heartbeat {
    commands: mpsc::UnboundedSender<Command>,
}

impl Heartbeat {
    /// Spawns the heartbeat task; the first ping is sent immediately.
    ///
    /// `send_ping` is called with each token and returns `false` if the
    /// ping could not be queued. Outcomes are published on `events`.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::InvalidConfig`] for zero values.
    pub fn start<F>(
        config: HeartbeatConfig,
        send_ping: F,
        events: mpsc::UnboundedSender<HeartbeatEvent>,
    ) -> Result<Self, HeartbeatError>
    where
        F: FnMut(u64) -> bool + Send + 'static,
    {
        let machine = HeartbeatMachine::new(config)?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(machine, config, send_ping, events, rx));
        Ok(Self { commands: tx })
    }

    /// Feeds a pong token received from the relay.
    pub fn pong(&self, token: u64) {
        let _ = self.commands.send(Command::Pong(token));
    }

    /// Stops the heartbeat. Idempotent; no ping is sent afterwards.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

async fn run<F>(
    mut machine: HeartbeatMachine,
    config: HeartbeatConfig,
    mut send_ping: F,
    events: mpsc::UnboundedSender<HeartbeatEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) where
    F: FnMut(u64) -> bool + Send + 'static,
{
    let origin = Instant::now();
    let now_ms = || u64::try_from(origin.elapsed().as_millis()).unwrap_or(u64::MAX);
    let emit = |batch: Vec<HeartbeatEvent>| {
        for event in batch {
            let _ = events.send(event);
        }
    };

    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut deadline: Option<(u64, Instant)> = None;

    loop {
        let sleep_until = deadline.map(|(_, at)| at);
        tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(Command::Pong(token)) => {
                    let batch = machine.on_pong(token, now_ms());
                    if !batch.is_empty() {
                        deadline = None;
                    }
                    emit(batch);
                }
                Some(Command::Stop) | None => {
                    machine.stop();
                }
            },
            () = sleep_until_opt(sleep_until) => {
                if let Some((token, _)) = deadline.take() {
                    emit(machine.on_deadline(token));
                }
            }
            _ = ticker.tick() => {
                if let Some(token) = machine.begin_ping(now_ms()) {
                    if send_ping(token) {
                        deadline = Some((token, Instant::now() + config.timeout));
                    } else {
                        tracing::warn!(token, "failed to send heartbeat ping");
                        emit(machine.on_send_failed(token));
                    }
                }
            }
        }

        if machine.is_stopped() {
            tracing::debug!("heartbeat stopped");
            break;
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
