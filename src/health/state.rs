//! Channel connection state machine.
//!
//! # States
//! - Init: channel created, monitor not started
//! - Connecting: monitor started, first probe pending
//! - Connected: broker reachable (and topic present, when verified)
//! - Disconnected: last probe, send or fetch failed
//! - Closed: terminal, reached from any state via close
//!
//! # State Transitions
//! ```text
//! Init → Connecting → Connected ⇄ Disconnected
//! any  → Closed
//! ```
//!
//! # Design Decisions
//! - Only Connected counts as ready
//! - A status change is published even when only the reason changes, so the
//!   health snapshot never shows a stale reason

use serde::Serialize;
use tokio::time::Instant;

/// Connection state of a single channel.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Init = 0,
    Connecting = 1,
    Connected = 2,
    Disconnected = 3,
    Closed = 4,
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Init => "INIT",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Closed => "CLOSED",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one probe attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Broker reachable, and the topic exists when verification is on.
    Reachable,
    /// Broker reachable, topic verification found no topic.
    TopicMissing,
    /// Probe errored or timed out.
    Failed(String),
}

impl ProbeOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ProbeOutcome::Reachable => "reachable",
            ProbeOutcome::TopicMissing => "topic_missing",
            ProbeOutcome::Failed(_) => "failed",
        }
    }
}

/// A timestamped probe. Only the latest one is kept.
#[derive(Debug, Clone)]
pub struct Probe {
    pub at: Instant,
    pub outcome: ProbeOutcome,
}

impl Probe {
    pub fn new(outcome: ProbeOutcome) -> Self {
        Self {
            at: Instant::now(),
            outcome,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Reachable)
    }

    /// The state this probe implies and the reason to report with it.
    pub fn verdict(&self) -> (ConnectionState, Option<String>) {
        match &self.outcome {
            ProbeOutcome::Reachable => (ConnectionState::Connected, None),
            ProbeOutcome::TopicMissing => (
                ConnectionState::Disconnected,
                Some("topic not found".to_string()),
            ),
            ProbeOutcome::Failed(reason) => {
                (ConnectionState::Disconnected, Some(reason.clone()))
            }
        }
    }
}

/// Immutable view of a channel's connection, published atomically.
#[derive(Debug, Clone)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    pub reason: Option<String>,
    pub last_probe: Option<Probe>,
    pub since: Instant,
}

impl ChannelStatus {
    pub fn initial() -> Self {
        Self {
            state: ConnectionState::Init,
            reason: None,
            last_probe: None,
            since: Instant::now(),
        }
    }

    /// Human-readable reason, falling back to a description of the state.
    pub fn describe(&self) -> String {
        match (&self.reason, self.state) {
            (Some(reason), _) => reason.clone(),
            (None, ConnectionState::Init) => "not started".to_string(),
            (None, ConnectionState::Connecting) => "connecting".to_string(),
            (None, ConnectionState::Connected) => "connected".to_string(),
            (None, ConnectionState::Disconnected) => "disconnected".to_string(),
            (None, ConnectionState::Closed) => "closed".to_string(),
        }
    }
}

/// A published status change of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub channel: String,
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: Option<String>,
}

impl Transition {
    /// The broker came back for a channel that had lost it.
    pub fn is_reconnect(&self) -> bool {
        self.from == ConnectionState::Disconnected && self.to == ConnectionState::Connected
    }

    pub fn is_state_change(&self) -> bool {
        self.from != self.to
    }
}
