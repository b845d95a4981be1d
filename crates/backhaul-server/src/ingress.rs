//! Client ingress
//!
//! One listener per alias. Each accepted client is queued on its alias and
//! a tunnel is requested from the agent; the client's task then waits for a
//! data connection and runs the relay.

use backhaul_control::{Broker, OfferOutcome, Ticket};
use backhaul_transport::relay;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::server::DataConnection;

/// Bytes buffered from a client that talks before its tunnel exists.
/// A client that sends more is dropped from the queue.
const MAX_EARLY_BYTES: usize = 64 * 1024;

pub(crate) async fn run_client_listener(
    broker: Arc<Broker<DataConnection>>,
    alias: String,
    listener: TcpListener,
    queue_timeout: Option<Duration>,
    shutdown: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(
            "Tunnel server listening for clients for alias '{}' on {}",
            alias, addr
        );
    }

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept client for alias '{}': {}", alias, e);
                    continue;
                }
            },
        };

        match broker.enqueue(&alias, peer) {
            Ok(ticket) => {
                info!(
                    client_id = ticket.id,
                    "Client {} connected for alias '{}'. Added to waiting queue and requested new tunnel.",
                    peer,
                    alias
                );
                let broker = broker.clone();
                tokio::spawn(async move {
                    serve_client(&broker, stream, peer, ticket, queue_timeout).await;
                });
            }
            Err(e) => {
                info!(
                    "Client {} connected for alias '{}', rejecting: {}",
                    peer, alias, e
                );
                drop(stream);
            }
        }
    }
}

/// Why a queued client stopped waiting without being paired
enum Abandoned {
    Disconnected,
    TimedOut,
    Overflowed,
}

async fn serve_client(
    broker: &Broker<DataConnection>,
    mut client: TcpStream,
    peer: SocketAddr,
    mut ticket: Ticket<DataConnection>,
    queue_timeout: Option<Duration>,
) {
    let mut early = BytesMut::new();
    let mut buffer = vec![0u8; 4096];

    let deadline = async {
        match queue_timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let abandoned = loop {
        tokio::select! {
            paired = &mut ticket.pairing => match paired {
                Ok(data) => {
                    relay_client(client, peer, data, early, &ticket).await;
                    return;
                }
                Err(_) => {
                    info!(
                        "Closing client {} for alias '{}': agent session ended",
                        peer, ticket.alias
                    );
                    return;
                }
            },
            read = client.read(&mut buffer) => match read {
                Ok(0) => break Abandoned::Disconnected,
                Ok(n) => {
                    early.extend_from_slice(&buffer[..n]);
                    debug!("Buffered {} bytes from waiting client {}", n, peer);
                    if early.len() > MAX_EARLY_BYTES {
                        break Abandoned::Overflowed;
                    }
                }
                Err(e) => {
                    debug!("Waiting client {} errored: {}", peer, e);
                    break Abandoned::Disconnected;
                }
            },
            _ = &mut deadline => break Abandoned::TimedOut,
        }
    };

    if broker.prune(&ticket.alias, ticket.id) {
        match abandoned {
            Abandoned::Disconnected => info!(
                "Client {} for alias '{}' disconnected while waiting",
                peer, ticket.alias
            ),
            Abandoned::TimedOut => warn!(
                "Client {} for alias '{}' waited too long for a tunnel. Closing.",
                peer, ticket.alias
            ),
            Abandoned::Overflowed => warn!(
                "Client {} for alias '{}' sent more than {} bytes before its tunnel opened. Closing.",
                peer, ticket.alias, MAX_EARLY_BYTES
            ),
        }
        return;
    }

    // Lost the race with the data broker: the connection is already ours
    let Ok(data) = ticket.pairing.try_recv() else {
        return;
    };
    match abandoned {
        Abandoned::TimedOut | Abandoned::Overflowed => {
            relay_client(client, peer, data, early, &ticket).await
        }
        Abandoned::Disconnected => {
            drop(client);
            match broker.offer(&ticket.alias, data) {
                OfferOutcome::Paired { client_id, .. } => debug!(
                    "Handed data connection of departed client {} to client {}",
                    peer, client_id
                ),
                OfferOutcome::Unpaired { reason, .. } => debug!(
                    "Dropping data connection of departed client {}: {}",
                    peer, reason
                ),
            }
        }
    }
}

async fn relay_client(
    mut client: TcpStream,
    peer: SocketAddr,
    data: DataConnection,
    early: BytesMut,
    ticket: &Ticket<DataConnection>,
) {
    let DataConnection {
        stream: mut agent,
        peer: agent_peer,
        leftover,
    } = data;

    if !early.is_empty() {
        if let Err(e) = agent.write_all(&early).await {
            warn!("Failed to forward early client bytes to agent {}: {}", agent_peer, e);
            return;
        }
    }
    if !leftover.is_empty() {
        if let Err(e) = client.write_all(&leftover).await {
            warn!("Failed to forward agent bytes to client {}: {}", peer, e);
            return;
        }
    }

    let stats = relay::pair(client, agent, ticket.shutdown.clone()).await;

    info!(
        client_id = ticket.id,
        alias = %ticket.alias,
        bytes_to_agent = stats.left_to_right + early.len() as u64,
        bytes_to_client = stats.right_to_left + leftover.len() as u64,
        "Tunnel for client {} closed ({})",
        peer,
        stats.end
    );
}
