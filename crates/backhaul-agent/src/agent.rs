use backhaul_proto::{AgentControlCodec, ControlCommand, ProtocolError};
use futures::{SinkExt, StreamExt};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::forwarder::TunnelForwarder;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("No destinations configured")]
    NoDestinations,

    #[error("Failed to connect to tunnel server at {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Control connection closed by the tunnel server after {}s", uptime.as_secs())]
    ControlClosed { uptime: Duration },
}

/// One control session with the tunnel server
pub struct Agent {
    config: AgentConfig,
    forwarder: TunnelForwarder,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        if config.destinations.is_empty() {
            return Err(AgentError::NoDestinations);
        }
        config.handshake().validate()?;

        let forwarder = TunnelForwarder::new(config.data_addr());
        Ok(Self { config, forwarder })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Connect, advertise destinations and serve tunnel requests.
    ///
    /// Returns `Ok(())` when `shutdown` is cancelled and an error when the
    /// control connection could not be established or was lost. Every tunnel
    /// opened during the session is closed before this returns.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let address = self.config.control_addr();
        info!("Connecting to tunnel server at {}", address);

        let stream = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            stream = TcpStream::connect(&address) => stream.map_err(|e| AgentError::Connect {
                address: address.clone(),
                source: e,
            })?,
        };

        let connected_at = Instant::now();
        let mut control = Framed::new(stream, AgentControlCodec::new());
        control.send(self.config.handshake()).await?;
        info!(
            "✅ Connected to tunnel server, serving {} aliases",
            self.config.destinations.len()
        );

        let session = shutdown.child_token();
        let mut tunnels = JoinSet::new();

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                Some(finished) = tunnels.join_next() => {
                    if let Err(e) = finished {
                        error!("Tunnel task panicked: {}", e);
                    }
                }
                command = control.next() => match command {
                    Some(Ok(ControlCommand::NewTunnel { alias })) => {
                        self.open_tunnel(&mut tunnels, alias, session.clone());
                    }
                    Some(Err(e)) => break Err(AgentError::Protocol(e)),
                    None => break Err(AgentError::ControlClosed {
                        uptime: connected_at.elapsed(),
                    }),
                },
            }
        };

        session.cancel();
        let open = tunnels.len();
        while tunnels.join_next().await.is_some() {}
        if open > 0 {
            info!("Closed {} open tunnels", open);
        }

        result
    }

    fn open_tunnel(&self, tunnels: &mut JoinSet<()>, alias: String, session: CancellationToken) {
        let Some(destination) = self.config.destinations.get(&alias).cloned() else {
            warn!("Tunnel requested for unknown alias '{}', ignoring", alias);
            return;
        };

        debug!("Tunnel requested for alias '{}' → {}", alias, destination);
        let forwarder = self.forwarder.clone();
        tunnels.spawn(async move {
            if let Err(e) = forwarder.forward(&alias, &destination, session).await {
                warn!(alias = %alias, "Tunnel failed: {}", e);
            }
        });
    }
}
