//! Backhaul tunnel server
//!
//! Public clients connect to per-alias ports on this server. An agent behind
//! NAT holds one control connection and opens one outbound data connection
//! per client on request; the server splices each client to its data
//! connection.
//!
//! Three loops share a single [`backhaul_control::Broker`]:
//! - control: admits one agent at a time and forwards tunnel requests
//! - data: reads the alias tag of each data connection and pairs it
//! - ingress: queues clients and relays them once paired

pub mod config;
mod control;
mod data;
mod ingress;
pub mod server;

pub use config::ServerConfig;
pub use server::{DataConnection, ServerError, TunnelServer};
