//! Tunnel server
//!
//! Binds the control, data, and per-alias client listeners and runs the
//! three brokers over one shared [`Broker`].

use backhaul_control::{AliasError, Broker};
use backhaul_transport::{bind_with_retry, TransportError};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ServerConfig;
use crate::control::run_control_loop;
use crate::data::run_data_loop;
use crate::ingress::run_client_listener;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid client port configuration: {0}")]
    Alias(#[from] AliasError),
}

/// An agent data connection whose alias tag has been read
#[derive(Debug)]
pub struct DataConnection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Bytes the agent sent after the tag, owed to the client
    pub leftover: Bytes,
}

/// A bound, not yet running, tunnel server
pub struct TunnelServer {
    config: ServerConfig,
    broker: Arc<Broker<DataConnection>>,
    control_listener: TcpListener,
    control_addr: SocketAddr,
    data_listener: TcpListener,
    data_addr: SocketAddr,
    client_listeners: Vec<(String, TcpListener, SocketAddr)>,
}

impl TunnelServer {
    /// Validate the configuration and bind every listener.
    ///
    /// Port 0 anywhere picks a free port; the resolved addresses are
    /// available from the accessors before [`run`](Self::run).
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let aliases = Arc::new(config.alias_table()?);

        let control_listener = bind_with_retry(config.control_addr()).await?;
        let control_addr = control_listener.local_addr()?;

        let data_listener = bind_with_retry(config.data_addr()).await?;
        let data_addr = data_listener.local_addr()?;

        let mut client_listeners = Vec::with_capacity(aliases.len());
        for alias in aliases.iter() {
            let listener = bind_with_retry(config.client_addr(alias.listen_port)).await?;
            let addr = listener.local_addr()?;
            client_listeners.push((alias.name.clone(), listener, addr));
        }

        Ok(Self {
            config,
            broker: Arc::new(Broker::new(aliases)),
            control_listener,
            control_addr,
            data_listener,
            data_addr,
            client_listeners,
        })
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn data_addr(&self) -> SocketAddr {
        self.data_addr
    }

    /// Address clients of `alias` connect to
    pub fn client_addr(&self, alias: &str) -> Option<SocketAddr> {
        self.client_listeners
            .iter()
            .find(|(name, _, _)| name == alias)
            .map(|(_, _, addr)| *addr)
    }

    pub fn broker(&self) -> Arc<Broker<DataConnection>> {
        self.broker.clone()
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let TunnelServer {
            config,
            broker,
            control_listener,
            control_addr,
            data_listener,
            client_listeners,
            ..
        } = self;

        info!("🚀 Tunnel server starting");
        for (alias, _, addr) in &client_listeners {
            info!("  {} → alias '{}'", addr, alias);
        }

        let tasks_shutdown = shutdown.child_token();
        let mut tasks = JoinSet::new();

        tasks.spawn(run_data_loop(
            broker.clone(),
            data_listener,
            config.tag_timeout(),
            tasks_shutdown.clone(),
        ));

        for (alias, listener, _) in client_listeners {
            tasks.spawn(run_client_listener(
                broker.clone(),
                alias,
                listener,
                config.queue_timeout(),
                tasks_shutdown.clone(),
            ));
        }

        run_control_loop(
            broker.clone(),
            control_listener,
            control_addr,
            config.handshake_timeout(),
            shutdown.clone(),
        )
        .await;

        tasks_shutdown.cancel();
        while tasks.join_next().await.is_some() {}

        info!("Tunnel server stopped");
        Ok(())
    }
}
