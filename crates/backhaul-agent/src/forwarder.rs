use backhaul_proto::{DataTag, Destination, ProtocolError};
use backhaul_transport::relay;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Errors that can occur while opening or running one tunnel
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("Failed to connect to {role} address {address}: {source}")]
    ConnectionFailed {
        role: &'static str,
        address: String,
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error during forwarding: {0}")]
    Io(#[from] std::io::Error),
}

/// Opens data connections and splices them to local destinations
#[derive(Debug, Clone)]
pub struct TunnelForwarder {
    data_addr: String,
}

impl TunnelForwarder {
    pub fn new(data_addr: impl Into<String>) -> Self {
        Self {
            data_addr: data_addr.into(),
        }
    }

    /// Serve one tunnel request for `alias`.
    ///
    /// Dials the server's data port and sends the alias tag, then dials
    /// `destination`. If the destination is unreachable the data connection
    /// is dropped, which closes the waiting client.
    pub async fn forward(
        &self,
        alias: &str,
        destination: &Destination,
        shutdown: CancellationToken,
    ) -> Result<(), ForwarderError> {
        tracing::debug!(alias = %alias, destination = %destination, "Opening tunnel");

        let mut data_stream = TcpStream::connect(&self.data_addr).await.map_err(|e| {
            ForwarderError::ConnectionFailed {
                role: "data",
                address: self.data_addr.clone(),
                source: e,
            }
        })?;
        data_stream.write_all(&DataTag::encode(alias)?).await?;

        let address = destination.to_string();
        let destination_stream = TcpStream::connect(&address).await.map_err(|e| {
            ForwarderError::ConnectionFailed {
                role: "destination",
                address: address.clone(),
                source: e,
            }
        })?;

        let _ = data_stream.set_nodelay(true);
        let _ = destination_stream.set_nodelay(true);

        let stats = relay::pair(data_stream, destination_stream, shutdown).await;

        tracing::info!(
            alias = %alias,
            destination = %address,
            bytes_to_destination = stats.left_to_right,
            bytes_to_tunnel = stats.right_to_left,
            "Tunnel closed ({})",
            stats.end
        );

        Ok(())
    }
}
