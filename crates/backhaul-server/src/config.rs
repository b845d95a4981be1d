//! Tunnel server configuration

use backhaul_control::{AliasError, AliasTable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

fn default_bind_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_tag_timeout_secs() -> u64 {
    10
}

/// Tunnel server configuration
///
/// JSON form:
/// `{"control_port":7000,"data_port":7001,"client_ports":{"9000":"web"}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address every listener binds to
    #[serde(default = "default_bind_host")]
    pub bind_host: IpAddr,
    /// Port the agent's control connection arrives on
    pub control_port: u16,
    /// Port the agent's data connections arrive on
    pub data_port: u16,
    /// Public listen port → alias
    pub client_ports: BTreeMap<u16, String>,
    /// Time the agent has to send its handshake after connecting
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Time a data connection has to send its alias tag
    #[serde(default = "default_tag_timeout_secs")]
    pub tag_timeout_secs: u64,
    /// Drop clients that wait longer than this for a tunnel (unset: wait forever)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_timeout_secs: Option<u64>,
}

impl ServerConfig {
    pub fn new(control_port: u16, data_port: u16, client_ports: BTreeMap<u16, String>) -> Self {
        Self {
            bind_host: default_bind_host(),
            control_port,
            data_port,
            client_ports,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            tag_timeout_secs: default_tag_timeout_secs(),
            queue_timeout_secs: None,
        }
    }

    pub fn with_bind_host(mut self, bind_host: IpAddr) -> Self {
        self.bind_host = bind_host;
        self
    }

    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.control_port)
    }

    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.data_port)
    }

    pub fn client_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.bind_host, port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn tag_timeout(&self) -> Duration {
        Duration::from_secs(self.tag_timeout_secs)
    }

    pub fn queue_timeout(&self) -> Option<Duration> {
        self.queue_timeout_secs.map(Duration::from_secs)
    }

    /// Build the alias table, validating alias names and ports
    pub fn alias_table(&self) -> Result<AliasTable, AliasError> {
        AliasTable::from_client_ports(&self.client_ports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_json() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"control_port":7000,"data_port":7001,"client_ports":{"9000":"web","9001":"ssh"}}"#,
        )
        .unwrap();

        assert_eq!(config.control_addr(), "0.0.0.0:7000".parse().unwrap());
        assert_eq!(config.data_addr().port(), 7001);
        assert_eq!(config.client_ports[&9001], "ssh");
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.queue_timeout(), None);

        let table = config.alias_table().unwrap();
        assert_eq!(table.by_port(9000).unwrap().name, "web");
    }

    #[test]
    fn test_parse_full_json() {
        let config: ServerConfig = serde_json::from_str(
            r#"{
                "bind_host": "127.0.0.1",
                "control_port": 7000,
                "data_port": 7001,
                "client_ports": {"9000": "web"},
                "handshake_timeout_secs": 3,
                "tag_timeout_secs": 4,
                "queue_timeout_secs": 30
            }"#,
        )
        .unwrap();

        assert_eq!(config.client_addr(9000), "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.tag_timeout(), Duration::from_secs(4));
        assert_eq!(config.queue_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_invalid_alias_table() {
        let mut ports = BTreeMap::new();
        ports.insert(9000, "web".to_string());
        ports.insert(9001, "web".to_string());
        assert!(ServerConfig::new(7000, 7001, ports).alias_table().is_err());

        assert!(ServerConfig::new(7000, 7001, BTreeMap::new())
            .alias_table()
            .is_err());
    }
}
