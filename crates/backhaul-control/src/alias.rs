//! Static alias table
//!
//! Maps alias names to their public listen port (and, on the agent side,
//! their destination). Built once from configuration and never mutated.

use backhaul_proto::{validate_alias, Destination, ProtocolError};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AliasError {
    #[error("No aliases configured")]
    Empty,

    #[error("Alias '{0}' is configured more than once")]
    DuplicateAlias(String),

    #[error("Port {port} is assigned to both '{first}' and '{second}'")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },

    #[error(transparent)]
    Invalid(#[from] ProtocolError),
}

/// One exposed service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    pub name: String,
    /// Public port end users connect to
    pub listen_port: u16,
    /// Where the agent forwards this alias, when known locally
    pub destination: Option<Destination>,
}

impl Alias {
    pub fn new(name: impl Into<String>, listen_port: u16) -> Self {
        Self {
            name: name.into(),
            listen_port,
            destination: None,
        }
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }
}

/// Read-only alias lookup by name and by listen port
#[derive(Debug, Clone)]
pub struct AliasTable {
    aliases: BTreeMap<String, Alias>,
    ports: BTreeMap<u16, String>,
}

impl AliasTable {
    pub fn new(aliases: impl IntoIterator<Item = Alias>) -> Result<Self, AliasError> {
        let mut by_name = BTreeMap::new();
        let mut ports: BTreeMap<u16, String> = BTreeMap::new();

        for alias in aliases {
            validate_alias(&alias.name)?;

            if let Some(first) = ports.get(&alias.listen_port) {
                return Err(AliasError::DuplicatePort {
                    port: alias.listen_port,
                    first: first.clone(),
                    second: alias.name,
                });
            }
            if by_name.contains_key(&alias.name) {
                return Err(AliasError::DuplicateAlias(alias.name));
            }

            ports.insert(alias.listen_port, alias.name.clone());
            by_name.insert(alias.name.clone(), alias);
        }

        if by_name.is_empty() {
            return Err(AliasError::Empty);
        }

        Ok(Self {
            aliases: by_name,
            ports,
        })
    }

    /// Build from a `listen port → alias` map, the shape of `--client-ports`
    pub fn from_client_ports(client_ports: &BTreeMap<u16, String>) -> Result<Self, AliasError> {
        Self::new(
            client_ports
                .iter()
                .map(|(port, name)| Alias::new(name.clone(), *port)),
        )
    }

    pub fn get(&self, name: &str) -> Option<&Alias> {
        self.aliases.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.aliases.contains_key(name)
    }

    pub fn by_port(&self, port: u16) -> Option<&Alias> {
        self.ports.get(&port).and_then(|name| self.aliases.get(name))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.aliases.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Alias> {
        self.aliases.values()
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}
