//! Data broker
//!
//! Accepts agent data connections, reads their alias tag, and hands them to
//! the oldest client waiting on that alias.

use backhaul_control::{Broker, OfferOutcome, SessionState};
use backhaul_proto::read_data_tag;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::server::DataConnection;

pub(crate) async fn run_data_loop(
    broker: Arc<Broker<DataConnection>>,
    listener: TcpListener,
    tag_timeout: Duration,
    shutdown: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("Tunnel server listening for agent data connections on {}", addr);
    }

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept agent data connection: {}", e);
                    continue;
                }
            },
        };

        if broker.state() != SessionState::Active {
            info!(
                "Data connection from {} while no agent session is active. Closing.",
                peer
            );
            drop(stream);
            continue;
        }

        let broker = broker.clone();
        tokio::spawn(async move {
            handle_data_connection(&broker, stream, peer, tag_timeout).await;
        });
    }
}

async fn handle_data_connection(
    broker: &Broker<DataConnection>,
    mut stream: TcpStream,
    peer: SocketAddr,
    tag_timeout: Duration,
) {
    let tag = match tokio::time::timeout(tag_timeout, read_data_tag(&mut stream)).await {
        Ok(Ok(tag)) => tag,
        Ok(Err(e)) => {
            warn!("Bad alias tag on data connection from {}: {}", peer, e);
            return;
        }
        Err(_) => {
            warn!(
                "Data connection from {} sent no alias tag within {}s. Closing.",
                peer,
                tag_timeout.as_secs()
            );
            return;
        }
    };

    let alias = tag.alias;
    debug!(
        "Data connection from {} for alias '{}' ({} payload bytes after tag)",
        peer,
        alias,
        tag.leftover.len()
    );

    let conn = DataConnection {
        stream,
        peer,
        leftover: tag.leftover,
    };

    match broker.offer(&alias, conn) {
        OfferOutcome::Paired {
            client_id,
            client_peer,
            waited,
        } => {
            info!(
                client_id,
                alias = %alias,
                waited_ms = waited.num_milliseconds(),
                "Pairing client {} for alias '{}' with agent data connection {}",
                client_peer,
                alias,
                peer
            );
        }
        OfferOutcome::Unpaired { conn, reason } => {
            info!(
                "Agent data connection for alias '{}' received, but {}. Closing.",
                alias, reason
            );
            drop(conn);
        }
    }
}
