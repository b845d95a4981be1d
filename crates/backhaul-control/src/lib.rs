//! Control plane for the tunnel broker
//!
//! Holds every piece of mutable broker state: the single agent session and
//! the per-alias queues of clients waiting for a data connection. All state
//! transitions go through [`Broker`], which serializes them behind one lock.
pub mod alias;
pub mod broker;
pub mod queue;
pub mod session;

pub use alias::{Alias, AliasError, AliasTable};
pub use broker::{Broker, BrokerError, OfferOutcome, TeardownReport, Ticket, UnpairedReason};
pub use queue::{ClientId, PendingClient, WaitingQueueRegistry};
pub use session::{AgentSession, SessionHandle, SessionId, SessionState};
