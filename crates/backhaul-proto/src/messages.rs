//! Protocol message types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::MAX_ALIAS_LEN;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed handshake: {0}")]
    MalformedHandshake(String),

    #[error("Handshake exceeds {0} bytes")]
    HandshakeTooLarge(usize),

    #[error("Control command exceeds {0} bytes")]
    CommandTooLong(usize),

    #[error("Invalid alias {alias:?}: {reason}")]
    InvalidAlias { alias: String, reason: &'static str },

    #[error("Invalid destination {0:?}: expected host:port")]
    InvalidDestination(String),

    #[error("Data connection closed before the alias tag was complete")]
    IncompleteTag,

    #[error("Alias tag exceeds {0} bytes")]
    TagTooLong(usize),
}

/// Check that a string can be used as an alias on both channels.
///
/// Aliases travel newline-terminated on the control and data channels,
/// so whitespace and control characters are refused.
pub fn validate_alias(alias: &str) -> Result<(), ProtocolError> {
    let invalid = |reason| ProtocolError::InvalidAlias {
        alias: alias.to_string(),
        reason,
    };

    if alias.is_empty() {
        return Err(invalid("empty"));
    }
    if alias.len() > MAX_ALIAS_LEN {
        return Err(invalid("too long"));
    }
    if alias
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(invalid("contains whitespace or control characters"));
    }
    Ok(())
}

/// A `host:port` destination as advertised by the agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for Destination {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidDestination(s.to_string());

        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;

        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Destination {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Destination> for String {
    fn from(value: Destination) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Agent → server handshake: the aliases the agent can serve
///
/// Serialized as a bare JSON object, e.g. `{"web":"localhost:8080"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handshake {
    pub destinations: BTreeMap<String, Destination>,
}

impl Handshake {
    pub fn new(destinations: BTreeMap<String, Destination>) -> Self {
        Self { destinations }
    }

    /// Validate every advertised alias
    pub fn validate(&self) -> Result<(), ProtocolError> {
        for alias in self.destinations.keys() {
            validate_alias(alias)?;
        }
        Ok(())
    }

    pub fn supports(&self, alias: &str) -> bool {
        self.destinations.contains_key(alias)
    }
}

/// Server → agent control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Ask the agent to open a data connection for `alias`
    NewTunnel { alias: String },
}

impl ControlCommand {
    pub fn new_tunnel(alias: impl Into<String>) -> Self {
        Self::NewTunnel {
            alias: alias.into(),
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::NewTunnel { alias } => {
                write!(f, "{}{}", crate::NEW_TUNNEL_PREFIX, alias)
            }
        }
    }
}
