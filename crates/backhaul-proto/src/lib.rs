//! Backhaul Protocol Definitions
//!
//! Wire types and codecs shared by the tunnel server and the agent:
//! the control-channel handshake, tunnel-request commands, and the
//! alias tag that opens every data connection.

pub mod codec;
pub mod messages;

pub use codec::{read_data_tag, AgentControlCodec, DataTag, ServerControlCodec};
pub use messages::*;

/// Prefix of the server → agent tunnel-request command
pub const NEW_TUNNEL_PREFIX: &str = "new-tunnel:";

/// Maximum size of the agent handshake (64KB)
pub const MAX_HANDSHAKE_LEN: usize = 64 * 1024;

/// Maximum length of an alias name, and therefore of a data-channel tag
pub const MAX_ALIAS_LEN: usize = 255;

/// Maximum length of a single control command line
pub const MAX_COMMAND_LEN: usize = NEW_TUNNEL_PREFIX.len() + MAX_ALIAS_LEN + 2;
