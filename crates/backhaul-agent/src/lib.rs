//! Backhaul agent
//!
//! Runs next to the protected services. Holds the control connection to the
//! tunnel server, advertises which aliases it can reach, and opens one
//! outbound data connection per tunnel request.

pub mod agent;
pub mod config;
pub mod forwarder;

pub use agent::{Agent, AgentError};
pub use config::AgentConfig;
pub use forwarder::{ForwarderError, TunnelForwarder};
