//! Transport plumbing shared by the tunnel server and the agent
//!
//! - [`relay`]: splice two connections together until either side goes away
//! - [`listener`]: TCP listener binding that tolerates TIME_WAIT on re-bind

pub mod listener;
pub mod relay;

pub use listener::{bind_with_retry, TransportError};
pub use relay::{pair, RelayEnd, RelayStats, Side};
