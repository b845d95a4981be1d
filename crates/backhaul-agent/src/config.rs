use backhaul_proto::{Destination, Handshake};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Agent configuration
///
/// JSON form:
/// `{"server_host":"tunnel.example.com","control_port":7000,"data_port":7001,
///   "destinations":{"web":"localhost:8080"}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Tunnel server host name or IP
    pub server_host: String,
    pub control_port: u16,
    pub data_port: u16,
    /// Alias → local destination
    pub destinations: BTreeMap<String, Destination>,
}

impl AgentConfig {
    pub fn new(
        server_host: impl Into<String>,
        control_port: u16,
        data_port: u16,
        destinations: BTreeMap<String, Destination>,
    ) -> Self {
        Self {
            server_host: server_host.into(),
            control_port,
            data_port,
            destinations,
        }
    }

    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.control_port)
    }

    pub fn data_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.data_port)
    }

    /// Handshake advertising every configured destination
    pub fn handshake(&self) -> Handshake {
        Handshake::new(self.destinations.clone())
    }
}
