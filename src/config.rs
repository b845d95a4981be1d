//! Configuration layering for the `backhaul` binary
//!
//! Each subcommand builds a layer from its flags (and `BACKHAUL_*` env vars)
//! and, with `--config`, a layer from a JSON file. Flags win over the file.

use backhaul_agent::AgentConfig;
use backhaul_control::AliasError;
use backhaul_proto::Destination;
use backhaul_server::ServerConfig;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("--{flag} is not a valid JSON object: {source}")]
    InvalidJson {
        flag: &'static str,
        source: serde_json::Error,
    },

    #[error("Missing required setting '{0}' (pass it as a flag or in the config file)")]
    Missing(&'static str),

    #[error("Invalid client port '{0}'")]
    InvalidPort(String),

    #[error("Invalid destination '{destination}' for alias '{alias}' (expected host:port)")]
    InvalidDestination { alias: String, destination: String },

    #[error("No destinations configured")]
    NoDestinations,

    #[error(transparent)]
    Alias(#[from] AliasError),
}

fn read_layer<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse a JSON object flag such as `--client-ports '{"9000":"web"}'`
pub fn parse_json_map(
    flag: &'static str,
    value: &str,
) -> Result<BTreeMap<String, String>, ConfigError> {
    serde_json::from_str(value).map_err(|source| ConfigError::InvalidJson { flag, source })
}

/// Server settings from one source; unset fields fall through to the next
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerLayer {
    pub bind_host: Option<IpAddr>,
    pub control_port: Option<u16>,
    pub data_port: Option<u16>,
    pub client_ports: Option<BTreeMap<String, String>>,
    pub handshake_timeout_secs: Option<u64>,
    pub tag_timeout_secs: Option<u64>,
    pub queue_timeout_secs: Option<u64>,
}

impl ServerLayer {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        read_layer(path)
    }

    /// Fill every unset field from `lower`
    pub fn over(self, lower: ServerLayer) -> Self {
        Self {
            bind_host: self.bind_host.or(lower.bind_host),
            control_port: self.control_port.or(lower.control_port),
            data_port: self.data_port.or(lower.data_port),
            client_ports: self.client_ports.or(lower.client_ports),
            handshake_timeout_secs: self.handshake_timeout_secs.or(lower.handshake_timeout_secs),
            tag_timeout_secs: self.tag_timeout_secs.or(lower.tag_timeout_secs),
            queue_timeout_secs: self.queue_timeout_secs.or(lower.queue_timeout_secs),
        }
    }

    pub fn resolve(self) -> Result<ServerConfig, ConfigError> {
        let control_port = self.control_port.ok_or(ConfigError::Missing("control-port"))?;
        let data_port = self.data_port.ok_or(ConfigError::Missing("data-port"))?;
        let raw_ports = self.client_ports.ok_or(ConfigError::Missing("client-ports"))?;

        let mut client_ports = BTreeMap::new();
        for (port, alias) in raw_ports {
            let port = port
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(port.clone()))?;
            client_ports.insert(port, alias);
        }

        let mut config = ServerConfig::new(control_port, data_port, client_ports);
        if let Some(bind_host) = self.bind_host {
            config = config.with_bind_host(bind_host);
        }
        if let Some(secs) = self.handshake_timeout_secs {
            config.handshake_timeout_secs = secs;
        }
        if let Some(secs) = self.tag_timeout_secs {
            config.tag_timeout_secs = secs;
        }
        config.queue_timeout_secs = self.queue_timeout_secs;

        // Reject empty tables and duplicate aliases before anything binds
        config.alias_table()?;
        Ok(config)
    }
}

/// Agent settings from one source; unset fields fall through to the next
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentLayer {
    pub server_host: Option<String>,
    pub control_port: Option<u16>,
    pub data_port: Option<u16>,
    pub destinations: Option<BTreeMap<String, String>>,
}

impl AgentLayer {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        read_layer(path)
    }

    pub fn over(self, lower: AgentLayer) -> Self {
        Self {
            server_host: self.server_host.or(lower.server_host),
            control_port: self.control_port.or(lower.control_port),
            data_port: self.data_port.or(lower.data_port),
            destinations: self.destinations.or(lower.destinations),
        }
    }

    pub fn resolve(self) -> Result<AgentConfig, ConfigError> {
        let server_host = self.server_host.ok_or(ConfigError::Missing("server-host"))?;
        let control_port = self.control_port.ok_or(ConfigError::Missing("control-port"))?;
        let data_port = self.data_port.ok_or(ConfigError::Missing("data-port"))?;
        let raw = self.destinations.ok_or(ConfigError::Missing("destinations"))?;
        if raw.is_empty() {
            return Err(ConfigError::NoDestinations);
        }

        let mut destinations = BTreeMap::new();
        for (alias, destination) in raw {
            let parsed = destination.parse::<Destination>().map_err(|_| {
                ConfigError::InvalidDestination {
                    alias: alias.clone(),
                    destination: destination.clone(),
                }
            })?;
            destinations.insert(alias, parsed);
        }

        Ok(AgentConfig::new(server_host, control_port, data_port, destinations))
    }
}
