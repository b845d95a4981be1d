//! Control broker
//!
//! Owns the control listener. Accepts one agent at a time, closes the
//! listener for the life of the session, reads the handshake, forwards
//! tunnel requests, and on disconnect tears the session down and re-opens
//! the listener.

use backhaul_control::{Broker, SessionHandle};
use backhaul_proto::{ControlCommand, ServerControlCodec};
use backhaul_transport::bind_with_retry;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::server::DataConnection;

const RELISTEN_DELAY: Duration = Duration::from_secs(1);
const MAX_RELISTEN_DELAY: Duration = Duration::from_secs(60);

pub(crate) async fn run_control_loop(
    broker: Arc<Broker<DataConnection>>,
    mut listener: TcpListener,
    addr: SocketAddr,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        info!("Tunnel server waiting for agent on {}", addr);

        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept agent control connection: {}", e);
                    continue;
                }
            },
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let session = match broker.open_session(peer, commands_tx) {
            Ok(session) => session,
            Err(e) => {
                warn!("Rejecting control connection from {}: {}", peer, e);
                drop(stream);
                continue;
            }
        };

        // Stop accepting new agent connections
        drop(listener);
        debug!("Control listener closed for session {}", session.id);

        let session_id = session.id;
        tokio::select! {
            _ = serve_session(&broker, stream, peer, session, commands_rx, handshake_timeout) => {}
            _ = shutdown.cancelled() => {
                broker.close_session(session_id);
                return;
            }
        }

        if let Some(report) = broker.close_session(session_id) {
            info!(
                session_id = report.session_id,
                peer = %report.peer,
                dropped_clients = report.dropped_clients,
                connected_at = %report.connected_at,
                "Agent session ended"
            );
        }

        // Restart listening for a new agent
        listener = match relisten(addr, &shutdown).await {
            Some(listener) => listener,
            None => return,
        };
    }
}

/// Re-open the control listener, backing off until it binds or `shutdown` fires.
///
/// Client and data listeners keep running meanwhile; clients are refused
/// because no session is active.
async fn relisten(addr: SocketAddr, shutdown: &CancellationToken) -> Option<TcpListener> {
    let mut delay = RELISTEN_DELAY;
    loop {
        match bind_with_retry(addr).await {
            Ok(listener) => return Some(listener),
            Err(e) => {
                error!(
                    "Failed to re-open control listener, retrying in {}s: {}",
                    delay.as_secs(),
                    e
                );
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = std::cmp::min(delay * 2, MAX_RELISTEN_DELAY);
    }
}

/// Drive one agent session until its control connection goes away.
///
/// Returning drops the control socket; the caller then tears the session down.
async fn serve_session(
    broker: &Broker<DataConnection>,
    stream: TcpStream,
    peer: SocketAddr,
    session: SessionHandle,
    mut commands: mpsc::UnboundedReceiver<ControlCommand>,
    handshake_timeout: Duration,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, ServerControlCodec::new());
    let mut writer = FramedWrite::new(write_half, ServerControlCodec::new());

    let handshake = match tokio::time::timeout(handshake_timeout, reader.next()).await {
        Ok(Some(Ok(handshake))) => handshake,
        Ok(Some(Err(e))) => {
            error!("Error parsing agent destinations from {}: {}", peer, e);
            return;
        }
        Ok(None) => {
            info!("Agent {} disconnected before sending its destinations", peer);
            return;
        }
        Err(_) => {
            warn!(
                "Agent {} did not send its destinations within {}s",
                peer,
                handshake_timeout.as_secs()
            );
            return;
        }
    };

    debug!("Received agent destinations: {:?}", handshake.destinations);
    if let Err(e) = broker.activate(session.id, handshake) {
        warn!("Could not activate session {}: {}", session.id, e);
        return;
    }

    let forward_commands = async {
        while let Some(command) = commands.recv().await {
            debug!("Sending '{}' to agent {}", command, peer);
            writer.send(command).await?;
        }
        Ok::<(), backhaul_proto::ProtocolError>(())
    };

    let watch_close = async {
        while let Some(item) = reader.next().await {
            item?;
        }
        Ok::<(), backhaul_proto::ProtocolError>(())
    };

    let result = tokio::select! {
        result = forward_commands => result,
        result = watch_close => result,
        _ = session.shutdown.cancelled() => Ok(()),
    };

    match result {
        Ok(()) => info!("Agent {} disconnected.", peer),
        Err(e) => error!("Agent control socket error from {}: {}", peer, e),
    }
}
