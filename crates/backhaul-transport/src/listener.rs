//! TCP listener binding

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};
use tracing::{info, warn};

const BIND_ATTEMPTS: u32 = 3;
const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);
const LISTEN_BACKLOG: u32 = 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },
}

impl TransportError {
    fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        TransportError::Bind {
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: reason.into(),
        }
    }
}

fn bind_once(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    // Listeners are closed and re-opened across agent sessions
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Bind a listener, retrying while the port is still in TIME_WAIT
/// (up to 3 attempts with 1 second delays).
pub async fn bind_with_retry(addr: SocketAddr) -> Result<TcpListener, TransportError> {
    for attempt in 1..=BIND_ATTEMPTS {
        match bind_once(addr) {
            Ok(listener) => {
                if attempt > 1 {
                    info!(
                        "Successfully bound to {} on attempt {}/{}",
                        addr, attempt, BIND_ATTEMPTS
                    );
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                warn!(
                    "Port {} is in use (attempt {}/{}, may be in TIME_WAIT state), retrying in {}s...",
                    addr.port(),
                    attempt,
                    BIND_ATTEMPTS,
                    BIND_RETRY_DELAY.as_secs()
                );
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
            Err(e) => return Err(TransportError::bind(addr, e.to_string())),
        }
    }

    Err(TransportError::bind(
        addr,
        format!("Address in use after {} retry attempts", BIND_ATTEMPTS),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = bind_with_retry("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_rebind_after_close() {
        let listener = bind_with_retry("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        // Leave a connection behind so the port sees TIME_WAIT traffic
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        drop(server_side);
        drop(client);
        drop(listener);

        let rebound = bind_with_retry(addr).await.unwrap();
        assert_eq!(rebound.local_addr().unwrap(), addr);
    }

    #[test]
    fn test_bind_error_message() {
        let err = TransportError::bind("127.0.0.1:9000".parse().unwrap(), "denied");
        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1"));
        assert!(msg.contains("lsof -i :9000"));
    }
}
