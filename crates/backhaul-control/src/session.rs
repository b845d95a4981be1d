//! The agent session
//!
//! At most one agent is connected at a time. Its session moves through
//! `AwaitingHandshake → Active → Closing` and is then discarded; with no
//! session the broker is `AwaitingAgent`.

use backhaul_proto::{ControlCommand, Destination, Handshake};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Monotonic identifier of an agent session
pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No agent connected; the control listener is open
    AwaitingAgent,
    /// Control connection accepted, handshake not yet received
    AwaitingHandshake,
    /// Handshake received; clients are accepted and tunnels requested
    Active,
    /// Control connection lost; teardown in progress
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::AwaitingAgent => "awaiting-agent",
            SessionState::AwaitingHandshake => "awaiting-handshake",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// The connected agent
#[derive(Debug)]
pub struct AgentSession {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub state: SessionState,
    /// Aliases the agent said it can serve; empty until the handshake
    pub advertised: BTreeMap<String, Destination>,
    pub connected_at: DateTime<Utc>,
    /// Writer side of the control connection
    control: mpsc::UnboundedSender<ControlCommand>,
    /// Cancelled when the session is torn down; relays of this session watch it
    shutdown: CancellationToken,
}

impl AgentSession {
    pub(crate) fn new(
        id: SessionId,
        peer: SocketAddr,
        control: mpsc::UnboundedSender<ControlCommand>,
    ) -> Self {
        Self {
            id,
            peer,
            state: SessionState::AwaitingHandshake,
            advertised: BTreeMap::new(),
            connected_at: Utc::now(),
            control,
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) fn activate(&mut self, handshake: Handshake) {
        self.advertised = handshake.destinations;
        self.state = SessionState::Active;
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Whether clients of `alias` can be served right now
    pub fn supports(&self, alias: &str) -> bool {
        self.is_active() && self.advertised.contains_key(alias)
    }

    /// Queue a `new-tunnel:<alias>` command for the control writer.
    ///
    /// Fails only if the control writer has already gone away.
    pub(crate) fn send(&self, command: ControlCommand) -> Result<(), ControlCommand> {
        self.control.send(command).map_err(|e| e.0)
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            shutdown: self.shutdown.clone(),
        }
    }
}

/// What the control connection task keeps of its session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub shutdown: CancellationToken,
}
