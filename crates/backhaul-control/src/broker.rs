//! Broker state machine
//!
//! Every transition of the agent session and the waiting queues happens in
//! one of the methods below, each under a single lock acquisition that is
//! never held across an `.await`. That lock is the only serialization point:
//! a pairing pop and a teardown drain can never both see the same client.
//!
//! The broker is generic over the data-connection type `C` so the socket
//! layer decides what a "data connection" is and the state machine can be
//! exercised without sockets.

use backhaul_proto::{ControlCommand, Handshake};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alias::AliasTable;
use crate::queue::{ClientId, PendingClient, WaitingQueueRegistry};
use crate::session::{AgentSession, SessionHandle, SessionId, SessionState};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Agent already connected (session {session_id}, {state})")]
    AgentAlreadyConnected {
        session_id: SessionId,
        state: SessionState,
    },

    #[error("No active agent session")]
    NoActiveAgent,

    #[error("Unknown alias '{0}'")]
    UnknownAlias(String),

    #[error("Agent does not serve alias '{0}'")]
    UnsupportedAlias(String),

    #[error("Session {0} is not awaiting a handshake")]
    StaleSession(SessionId),

    #[error("Control channel to the agent is closed")]
    ControlChannelClosed,
}

/// Handed to a client that has been queued.
///
/// The data connection arrives on `pairing`. If the sender side is dropped
/// without a connection, the client was dropped from the queue (session
/// teardown) and must be closed.
#[derive(Debug)]
pub struct Ticket<C> {
    pub id: ClientId,
    pub alias: String,
    pub session_id: SessionId,
    /// Cancelled when the session that queued this client ends
    pub shutdown: CancellationToken,
    pub pairing: oneshot::Receiver<C>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpairedReason {
    NoActiveAgent,
    UnknownAlias,
    NoWaitingClient,
}

impl std::fmt::Display for UnpairedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnpairedReason::NoActiveAgent => write!(f, "no active agent session"),
            UnpairedReason::UnknownAlias => write!(f, "unknown alias"),
            UnpairedReason::NoWaitingClient => write!(f, "no waiting client"),
        }
    }
}

/// Result of offering a data connection to the waiting queues
#[derive(Debug)]
pub enum OfferOutcome<C> {
    /// The connection now belongs to the waiting client
    Paired {
        client_id: ClientId,
        client_peer: SocketAddr,
        waited: chrono::Duration,
    },
    /// Nobody took it; the caller still owns `conn` and should close it
    Unpaired { conn: C, reason: UnpairedReason },
}

/// Summary of a finished session teardown
#[derive(Debug, Clone)]
pub struct TeardownReport {
    pub session_id: SessionId,
    pub peer: SocketAddr,
    pub dropped_clients: usize,
    pub connected_at: DateTime<Utc>,
}

struct BrokerState<C> {
    session: Option<AgentSession>,
    queues: WaitingQueueRegistry<oneshot::Sender<C>>,
}

/// Owner of the agent session and the waiting queues
pub struct Broker<C> {
    aliases: Arc<AliasTable>,
    state: Mutex<BrokerState<C>>,
    next_session_id: AtomicU64,
    next_client_id: AtomicU64,
}

impl<C> Broker<C> {
    pub fn new(aliases: Arc<AliasTable>) -> Self {
        let queues = WaitingQueueRegistry::new(aliases.names());
        info!("Creating broker for {} aliases", aliases.len());
        Self {
            aliases,
            state: Mutex::new(BrokerState {
                session: None,
                queues,
            }),
            next_session_id: AtomicU64::new(1),
            next_client_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState<C>> {
        // State is only ever mutated in complete steps, so a poisoned lock is still consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn aliases(&self) -> &Arc<AliasTable> {
        &self.aliases
    }

    /// Start a session for a newly accepted control connection.
    ///
    /// Refused while another session exists and is not closing; the caller
    /// must then destroy the connection.
    pub fn open_session(
        &self,
        peer: SocketAddr,
        control: mpsc::UnboundedSender<ControlCommand>,
    ) -> Result<SessionHandle, BrokerError> {
        let mut state = self.lock();

        if let Some(existing) = &state.session {
            if existing.state != SessionState::Closing {
                warn!(
                    peer = %peer,
                    session_id = existing.id,
                    "Agent already connected. Rejecting new control connection."
                );
                return Err(BrokerError::AgentAlreadyConnected {
                    session_id: existing.id,
                    state: existing.state,
                });
            }
        }

        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let session = AgentSession::new(id, peer, control);
        let handle = session.handle();
        state.session = Some(session);

        info!(session_id = id, peer = %peer, "Agent connected, awaiting handshake");
        Ok(handle)
    }

    /// Record the agent's handshake and move the session to `Active`
    pub fn activate(&self, session_id: SessionId, handshake: Handshake) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let session = state
            .session
            .as_mut()
            .filter(|s| s.id == session_id && s.state == SessionState::AwaitingHandshake)
            .ok_or(BrokerError::StaleSession(session_id))?;

        for (alias, destination) in &handshake.destinations {
            if self.aliases.contains(alias) {
                info!(session_id, alias = %alias, destination = %destination, "Agent serves alias");
            } else {
                warn!(session_id, alias = %alias, "Agent advertises an alias with no listener");
            }
        }
        for alias in self.aliases.names() {
            if !handshake.supports(alias) {
                warn!(
                    session_id,
                    alias = %alias,
                    "Agent does not serve configured alias; its clients will be rejected"
                );
            }
        }

        session.activate(handshake);
        info!(session_id, "✅ Agent session active");
        Ok(())
    }

    /// Tear down a session after its control connection closed or failed.
    ///
    /// Cancels the session's relays and closes every waiting client. Only the
    /// first call for a given session does anything; later calls, or calls
    /// for a session that has already been replaced, return `None`.
    pub fn close_session(&self, session_id: SessionId) -> Option<TeardownReport> {
        let mut state = self.lock();

        let session = state.session.as_mut().filter(|s| s.id == session_id)?;
        session.state = SessionState::Closing;
        debug!(session_id, "Agent session closing");

        let session = state.session.take()?;
        session.shutdown_token().cancel();

        // Dropping the pairing senders closes every queued client
        let dropped = state.queues.drain_all();
        let dropped_clients = dropped.len();
        drop(dropped);
        drop(state);

        info!(
            session_id,
            dropped_clients, "Agent disconnected. Cleaned up resources."
        );

        Some(TeardownReport {
            session_id,
            peer: session.peer,
            dropped_clients,
            connected_at: session.connected_at,
        })
    }

    fn request_on(session: &AgentSession, alias: &str) -> Result<(), BrokerError> {
        if !session.is_active() {
            return Err(BrokerError::NoActiveAgent);
        }
        session
            .send(ControlCommand::new_tunnel(alias))
            .map_err(|_| BrokerError::ControlChannelClosed)?;
        debug!(session_id = session.id, alias = %alias, "Requested new tunnel");
        Ok(())
    }

    /// Ask the agent for a new data connection for `alias`.
    ///
    /// Fire-and-forget: the answer, if any, shows up as a data connection.
    pub fn request_tunnel(&self, alias: &str) -> Result<(), BrokerError> {
        let state = self.lock();
        let session = state.session.as_ref().ok_or(BrokerError::NoActiveAgent)?;
        Self::request_on(session, alias)
    }

    /// Queue a newly accepted client and request a tunnel for it.
    ///
    /// Refused when no session is active or the agent does not serve `alias`;
    /// the caller must then destroy the client connection.
    pub fn enqueue(&self, alias: &str, peer: SocketAddr) -> Result<Ticket<C>, BrokerError> {
        if !self.aliases.contains(alias) {
            return Err(BrokerError::UnknownAlias(alias.to_string()));
        }

        let mut guard = self.lock();
        let state = &mut *guard;

        let session = state
            .session
            .as_ref()
            .filter(|s| s.is_active())
            .ok_or(BrokerError::NoActiveAgent)?;
        if !session.supports(alias) {
            return Err(BrokerError::UnsupportedAlias(alias.to_string()));
        }

        let id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let client = PendingClient {
            id,
            alias: alias.to_string(),
            peer,
            enqueued_at: Utc::now(),
            handle: tx,
        };
        if state.queues.push(client).is_err() {
            return Err(BrokerError::UnknownAlias(alias.to_string()));
        }

        if let Err(e) = Self::request_on(session, alias) {
            state.queues.remove(alias, id);
            return Err(e);
        }

        debug!(
            client_id = id,
            alias = %alias,
            waiting = state.queues.len(alias),
            "Client queued"
        );

        Ok(Ticket {
            id,
            alias: alias.to_string(),
            session_id: session.id,
            shutdown: session.shutdown_token().clone(),
            pairing: rx,
        })
    }

    /// Remove a client that went away while waiting.
    ///
    /// Returns `false` if it is no longer queued, which means it was already
    /// paired (its data connection is in its ticket) or drained.
    pub fn prune(&self, alias: &str, client_id: ClientId) -> bool {
        let removed = self.lock().queues.remove(alias, client_id).is_some();
        if removed {
            debug!(client_id, alias = %alias, "Pruned disconnected client from queue");
        }
        removed
    }

    /// Hand a data connection to the oldest waiting client of `alias`.
    ///
    /// A client whose ticket was dropped without pruning is skipped and the
    /// connection goes to the next one, so FIFO order holds among live clients.
    pub fn offer(&self, alias: &str, conn: C) -> OfferOutcome<C> {
        let mut state = self.lock();

        if !state.session.as_ref().is_some_and(AgentSession::is_active) {
            return OfferOutcome::Unpaired {
                conn,
                reason: UnpairedReason::NoActiveAgent,
            };
        }
        if !state.queues.has_alias(alias) {
            return OfferOutcome::Unpaired {
                conn,
                reason: UnpairedReason::UnknownAlias,
            };
        }

        let mut conn = conn;
        while let Some(client) = state.queues.pop_oldest(alias) {
            match client.handle.send(conn) {
                Ok(()) => {
                    return OfferOutcome::Paired {
                        client_id: client.id,
                        client_peer: client.peer,
                        waited: Utc::now() - client.enqueued_at,
                    };
                }
                Err(returned) => {
                    debug!(
                        client_id = client.id,
                        alias = %alias,
                        "Waiting client vanished before pairing, trying next"
                    );
                    conn = returned;
                }
            }
        }

        OfferOutcome::Unpaired {
            conn,
            reason: UnpairedReason::NoWaitingClient,
        }
    }

    pub fn state(&self) -> SessionState {
        self.lock()
            .session
            .as_ref()
            .map_or(SessionState::AwaitingAgent, |s| s.state)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.lock().session.as_ref().map(|s| s.id)
    }

    pub fn queue_len(&self, alias: &str) -> usize {
        self.lock().queues.len(alias)
    }

    pub fn waiting_total(&self) -> usize {
        self.lock().queues.total_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias::Alias;
    use backhaul_proto::Destination;
    use std::collections::BTreeMap;
    use tokio::sync::oneshot::error::TryRecvError;

    type TestBroker = Broker<&'static str>;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn broker() -> TestBroker {
        let aliases = AliasTable::new(vec![
            Alias::new("web", 9000),
            Alias::new("ssh", 9001),
            Alias::new("db", 9002),
        ])
        .unwrap();
        Broker::new(Arc::new(aliases))
    }

    fn handshake(aliases: &[&str]) -> Handshake {
        let destinations: BTreeMap<_, _> = aliases
            .iter()
            .map(|a| (a.to_string(), Destination::new("localhost", 8080)))
            .collect();
        Handshake::new(destinations)
    }

    /// Open and activate a session serving `web` and `ssh`
    fn active(
        broker: &TestBroker,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<ControlCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = broker.open_session(peer(), tx).unwrap();
        broker
            .activate(handle.id, handshake(&["web", "ssh"]))
            .unwrap();
        (handle, rx)
    }

    #[test]
    fn test_single_agent_invariant() {
        let broker = broker();
        assert_eq!(broker.state(), SessionState::AwaitingAgent);

        let (tx, _rx) = mpsc::unbounded_channel();
        let first = broker.open_session(peer(), tx).unwrap();
        assert_eq!(broker.state(), SessionState::AwaitingHandshake);

        // Second agent during the handshake
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let err = broker.open_session(peer(), tx2).unwrap_err();
        assert!(matches!(
            err,
            BrokerError::AgentAlreadyConnected {
                state: SessionState::AwaitingHandshake,
                ..
            }
        ));
        assert_eq!(broker.session_id(), Some(first.id));
        assert_eq!(broker.state(), SessionState::AwaitingHandshake);

        broker.activate(first.id, handshake(&["web"])).unwrap();

        // Second agent while active
        let (tx3, _rx3) = mpsc::unbounded_channel();
        assert!(broker.open_session(peer(), tx3).is_err());
        assert_eq!(broker.state(), SessionState::Active);
        assert_eq!(broker.session_id(), Some(first.id));
    }

    #[test]
    fn test_activate_rejects_stale_session() {
        let broker = broker();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = broker.open_session(peer(), tx).unwrap();

        assert!(matches!(
            broker.activate(handle.id + 1, handshake(&["web"])),
            Err(BrokerError::StaleSession(_))
        ));

        broker.activate(handle.id, handshake(&["web"])).unwrap();
        // A second handshake for the same session is refused
        assert!(broker.activate(handle.id, handshake(&["ssh"])).is_err());
    }

    #[test]
    fn test_enqueue_rejections() {
        let broker = broker();
        assert!(matches!(
            broker.enqueue("web", peer()),
            Err(BrokerError::NoActiveAgent)
        ));

        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = broker.open_session(peer(), tx).unwrap();
        assert!(matches!(
            broker.enqueue("web", peer()),
            Err(BrokerError::NoActiveAgent)
        ));

        broker.activate(handle.id, handshake(&["web"])).unwrap();
        assert!(matches!(
            broker.enqueue("db", peer()),
            Err(BrokerError::UnsupportedAlias(_))
        ));
        assert!(matches!(
            broker.enqueue("nope", peer()),
            Err(BrokerError::UnknownAlias(_))
        ));
        assert_eq!(broker.waiting_total(), 0);
    }

    #[test]
    fn test_enqueue_requests_tunnel() {
        let broker = broker();
        let (_handle, mut rx) = active(&broker);

        let _ticket = broker.enqueue("web", peer()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), ControlCommand::new_tunnel("web"));
        assert_eq!(broker.queue_len("web"), 1);
    }

    #[test]
    fn test_enqueue_with_closed_control_channel() {
        let broker = broker();
        let (_handle, rx) = active(&broker);
        drop(rx);

        assert!(matches!(
            broker.enqueue("web", peer()),
            Err(BrokerError::ControlChannelClosed)
        ));
        assert_eq!(broker.queue_len("web"), 0);
    }

    #[test]
    fn test_request_tunnel_requires_active() {
        let broker = broker();
        assert!(broker.request_tunnel("web").is_err());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = broker.open_session(peer(), tx).unwrap();
        assert!(broker.request_tunnel("web").is_err());

        broker.activate(handle.id, handshake(&["web"])).unwrap();
        broker.request_tunnel("web").unwrap();
        assert_eq!(rx.try_recv().unwrap(), ControlCommand::new_tunnel("web"));
    }

    #[test]
    fn test_fifo_pairing() {
        let broker = broker();
        let (_handle, _rx) = active(&broker);

        let mut c1 = broker.enqueue("web", peer()).unwrap();
        let mut c2 = broker.enqueue("web", peer()).unwrap();
        let mut c3 = broker.enqueue("web", peer()).unwrap();

        for conn in ["d1", "d2", "d3"] {
            assert!(matches!(
                broker.offer("web", conn),
                OfferOutcome::Paired { .. }
            ));
        }

        assert_eq!(c1.pairing.try_recv().unwrap(), "d1");
        assert_eq!(c2.pairing.try_recv().unwrap(), "d2");
        assert_eq!(c3.pairing.try_recv().unwrap(), "d3");
        assert_eq!(broker.queue_len("web"), 0);
    }

    #[test]
    fn test_alias_isolation() {
        let broker = broker();
        let (_handle, _rx) = active(&broker);

        let mut ssh_client = broker.enqueue("ssh", peer()).unwrap();

        match broker.offer("web", "web-data") {
            OfferOutcome::Unpaired { conn, reason } => {
                assert_eq!(conn, "web-data");
                assert_eq!(reason, UnpairedReason::NoWaitingClient);
            }
            other => panic!("web data must not pair with ssh client: {:?}", other),
        }
        assert_eq!(broker.queue_len("ssh"), 1);
        assert!(matches!(
            ssh_client.pairing.try_recv(),
            Err(TryRecvError::Empty)
        ));

        // The registry is intact: ssh still pairs
        assert!(matches!(
            broker.offer("ssh", "ssh-data"),
            OfferOutcome::Paired { .. }
        ));
        assert_eq!(ssh_client.pairing.try_recv().unwrap(), "ssh-data");
    }

    #[test]
    fn test_offer_unknown_alias_or_no_session() {
        let broker = broker();
        assert!(matches!(
            broker.offer("web", "d"),
            OfferOutcome::Unpaired {
                reason: UnpairedReason::NoActiveAgent,
                ..
            }
        ));

        let (_handle, _rx) = active(&broker);
        assert!(matches!(
            broker.offer("nope", "d"),
            OfferOutcome::Unpaired {
                reason: UnpairedReason::UnknownAlias,
                ..
            }
        ));
    }

    #[test]
    fn test_pruned_client_is_never_paired() {
        let broker = broker();
        let (_handle, _rx) = active(&broker);

        let gone = broker.enqueue("web", peer()).unwrap();
        let mut waiting = broker.enqueue("web", peer()).unwrap();

        assert!(broker.prune("web", gone.id));
        assert!(!broker.prune("web", gone.id));

        assert!(matches!(
            broker.offer("web", "d1"),
            OfferOutcome::Paired { client_id, .. } if client_id == waiting.id
        ));
        assert_eq!(waiting.pairing.try_recv().unwrap(), "d1");
    }

    #[test]
    fn test_vanished_client_is_skipped() {
        let broker = broker();
        let (_handle, _rx) = active(&broker);

        let vanished = broker.enqueue("web", peer()).unwrap();
        let mut waiting = broker.enqueue("web", peer()).unwrap();
        drop(vanished);

        assert!(matches!(
            broker.offer("web", "d1"),
            OfferOutcome::Paired { .. }
        ));
        assert_eq!(waiting.pairing.try_recv().unwrap(), "d1");
        assert_eq!(broker.queue_len("web"), 0);
    }

    #[test]
    fn test_teardown_drains_everything() {
        let broker = broker();
        let (handle, _rx) = active(&broker);

        let mut web = broker.enqueue("web", peer()).unwrap();
        let mut ssh = broker.enqueue("ssh", peer()).unwrap();

        let report = broker.close_session(handle.id).unwrap();
        assert_eq!(report.session_id, handle.id);
        assert_eq!(report.dropped_clients, 2);

        assert!(handle.shutdown.is_cancelled());
        assert!(web.shutdown.is_cancelled());
        assert!(matches!(web.pairing.try_recv(), Err(TryRecvError::Closed)));
        assert!(matches!(ssh.pairing.try_recv(), Err(TryRecvError::Closed)));
        assert_eq!(broker.waiting_total(), 0);
        assert_eq!(broker.state(), SessionState::AwaitingAgent);

        // Idempotent
        assert!(broker.close_session(handle.id).is_none());
    }

    #[test]
    fn test_new_agent_after_teardown() {
        let broker = broker();
        let (first, _rx) = active(&broker);
        broker.close_session(first.id).unwrap();

        let (second, mut rx) = active(&broker);
        assert_ne!(first.id, second.id);
        assert_eq!(broker.state(), SessionState::Active);

        // A late teardown for the old session leaves the new one alone
        assert!(broker.close_session(first.id).is_none());
        assert_eq!(broker.session_id(), Some(second.id));

        let _ticket = broker.enqueue("web", peer()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), ControlCommand::new_tunnel("web"));
    }

    #[test]
    fn test_teardown_during_handshake() {
        let broker = broker();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = broker.open_session(peer(), tx).unwrap();

        let report = broker.close_session(handle.id).unwrap();
        assert_eq!(report.dropped_clients, 0);
        assert!(broker.activate(handle.id, handshake(&["web"])).is_err());
        assert_eq!(broker.state(), SessionState::AwaitingAgent);
    }

    #[tokio::test]
    async fn test_concurrent_offers_keep_fifo() {
        let broker = Arc::new(broker());
        let (_handle, _rx) = active(&broker);

        let tickets: Vec<_> = (0..32)
            .map(|_| broker.enqueue("web", peer()).unwrap())
            .collect();

        let offers: Vec<_> = (0..32)
            .map(|_| {
                let broker = broker.clone();
                tokio::spawn(async move { broker.offer("web", "data") })
            })
            .collect();
        for offer in offers {
            assert!(matches!(
                offer.await.unwrap(),
                OfferOutcome::Paired { .. }
            ));
        }

        // Every queued client got exactly one connection
        for mut ticket in tickets {
            assert_eq!(ticket.pairing.try_recv().unwrap(), "data");
        }
    }
}
