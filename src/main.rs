//! Backhaul CLI - Expose services behind NAT through a reverse TCP tunnel
//!
//! `backhaul server` runs on a public host; `backhaul agent` runs next to the
//! services and keeps a control connection to the server.

mod config;

use anyhow::{Context, Result};
use backhaul_agent::{Agent, AgentConfig, AgentError};
use backhaul_server::TunnelServer;
use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::{parse_json_map, AgentLayer, ServerLayer};

/// Backhaul - Reverse TCP tunnel for services behind NAT
#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(about = "Reverse TCP tunnel for services behind NAT")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public tunnel server
    #[command(long_about = r#"
Run the public side of the tunnel. Clients connect to the client ports;
the agent connects to the control and data ports.

EXAMPLES:
  # Expose alias "web" on port 9000
  backhaul server --control-port 7000 --data-port 7001 \
    --client-ports '{"9000":"web"}'

  # Load settings from a file, overriding the data port
  backhaul server --config server.json --data-port 7101

ENVIRONMENT VARIABLES:
  BACKHAUL_CONFIG             JSON config file
  BACKHAUL_BIND_HOST          Address to bind listeners to
  BACKHAUL_CONTROL_PORT       Agent control port
  BACKHAUL_DATA_PORT          Agent data port
  BACKHAUL_CLIENT_PORTS       JSON object port -> alias
    "#)]
    Server(ServerArgs),

    /// Run the agent next to the protected services
    #[command(long_about = r#"
Connect to a tunnel server and serve tunnel requests by dialing local
destinations. Automatically reconnects if the control connection drops.

EXAMPLES:
  # Serve alias "web" from a local HTTP server
  backhaul agent --server-host tunnel.example.com \
    --control-port 7000 --data-port 7001 \
    --destinations '{"web":"localhost:8080"}'

ENVIRONMENT VARIABLES:
  BACKHAUL_CONFIG             JSON config file
  BACKHAUL_SERVER_HOST        Tunnel server host
  BACKHAUL_CONTROL_PORT       Tunnel server control port
  BACKHAUL_DATA_PORT          Tunnel server data port
  BACKHAUL_DESTINATIONS       JSON object alias -> host:port
    "#)]
    Agent(AgentArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// JSON config file; flags override its values
    #[arg(long, env = "BACKHAUL_CONFIG")]
    config: Option<PathBuf>,

    /// Address every listener binds to (default 0.0.0.0)
    #[arg(long, env = "BACKHAUL_BIND_HOST")]
    bind_host: Option<IpAddr>,

    /// Port the agent's control connection arrives on
    #[arg(long, env = "BACKHAUL_CONTROL_PORT")]
    control_port: Option<u16>,

    /// Port the agent's data connections arrive on
    #[arg(long, env = "BACKHAUL_DATA_PORT")]
    data_port: Option<u16>,

    /// Client listen ports as a JSON object, e.g. '{"9000":"web"}'
    #[arg(long, env = "BACKHAUL_CLIENT_PORTS")]
    client_ports: Option<String>,

    /// Seconds the agent has to send its destinations
    #[arg(long, env = "BACKHAUL_HANDSHAKE_TIMEOUT")]
    handshake_timeout: Option<u64>,

    /// Seconds a data connection has to send its alias tag
    #[arg(long, env = "BACKHAUL_TAG_TIMEOUT")]
    tag_timeout: Option<u64>,

    /// Close clients that wait longer than this many seconds for a tunnel
    #[arg(long, env = "BACKHAUL_QUEUE_TIMEOUT")]
    queue_timeout: Option<u64>,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// JSON config file; flags override its values
    #[arg(long, env = "BACKHAUL_CONFIG")]
    config: Option<PathBuf>,

    /// Tunnel server host name or IP
    #[arg(long, env = "BACKHAUL_SERVER_HOST")]
    server_host: Option<String>,

    /// Tunnel server control port
    #[arg(long, env = "BACKHAUL_CONTROL_PORT")]
    control_port: Option<u16>,

    /// Tunnel server data port
    #[arg(long, env = "BACKHAUL_DATA_PORT")]
    data_port: Option<u16>,

    /// Destinations as a JSON object, e.g. '{"web":"localhost:8080"}'
    #[arg(long, env = "BACKHAUL_DESTINATIONS")]
    destinations: Option<String>,

    /// Maximum reconnection attempts (0 = infinite)
    #[arg(long, default_value = "0")]
    max_reconnect_attempts: usize,

    /// Initial reconnection delay in seconds
    #[arg(long, default_value = "1")]
    reconnect_delay: u64,

    /// Maximum reconnection delay in seconds
    #[arg(long, default_value = "60")]
    max_reconnect_delay: u64,
}

impl ServerArgs {
    fn layer(&self) -> Result<ServerLayer> {
        let client_ports = self
            .client_ports
            .as_deref()
            .map(|value| parse_json_map("client-ports", value))
            .transpose()?;

        let flags = ServerLayer {
            bind_host: self.bind_host,
            control_port: self.control_port,
            data_port: self.data_port,
            client_ports,
            handshake_timeout_secs: self.handshake_timeout,
            tag_timeout_secs: self.tag_timeout,
            queue_timeout_secs: self.queue_timeout,
        };

        Ok(match &self.config {
            Some(path) => flags.over(ServerLayer::from_file(path)?),
            None => flags,
        })
    }
}

impl AgentArgs {
    fn layer(&self) -> Result<AgentLayer> {
        let destinations = self
            .destinations
            .as_deref()
            .map(|value| parse_json_map("destinations", value))
            .transpose()?;

        let flags = AgentLayer {
            server_host: self.server_host.clone(),
            control_port: self.control_port,
            data_port: self.data_port,
            destinations,
        };

        Ok(match &self.config {
            Some(path) => flags.over(AgentLayer::from_file(path)?),
            None => flags,
        })
    }
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Cancel `shutdown` on Ctrl+C
fn shutdown_on_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        shutdown.cancel();
    });
}

fn attempts_label(max_attempts: usize) -> String {
    if max_attempts == 0 {
        "∞".to_string()
    } else {
        max_attempts.to_string()
    }
}

/// A control session that lasted this long resets the reconnect backoff
const STABLE_SESSION: Duration = Duration::from_secs(10);

/// Run the agent, reconnecting with exponential backoff
async fn connect_with_reconnect(
    config: AgentConfig,
    max_attempts: usize,
    initial_delay: Duration,
    max_delay: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let agent = Agent::new(config).context("Failed to create agent")?;
    let mut attempt = 0;
    let mut current_delay = initial_delay;

    loop {
        attempt += 1;
        info!(
            "Connection attempt {} (max: {})",
            attempt,
            attempts_label(max_attempts)
        );

        match agent.run(shutdown.clone()).await {
            Ok(()) => {
                info!("Agent stopped normally");
                return Ok(());
            }
            Err(AgentError::ControlClosed { uptime }) if uptime >= STABLE_SESSION => {
                warn!("Control connection lost after {}s", uptime.as_secs());
                attempt = 0;
                current_delay = initial_delay;
            }
            Err(e) => {
                error!("Agent error: {:#}", e);
                if max_attempts > 0 && attempt >= max_attempts {
                    error!("Maximum reconnection attempts ({}) reached", max_attempts);
                    return Err(e).context(format!("Failed to connect after {} attempts", attempt));
                }
            }
        }

        warn!(
            "Reconnecting in {} seconds... (attempt {} of {})",
            current_delay.as_secs(),
            attempt + 1,
            attempts_label(max_attempts)
        );

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(current_delay) => {}
        }

        if attempt > 0 {
            current_delay = std::cmp::min(current_delay * 2, max_delay);
        }
    }
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let config = args
        .layer()?
        .resolve()
        .context("Invalid server configuration")?;

    info!("Control port: {}", config.control_port);
    info!("Data port: {}", config.data_port);
    if let Some(secs) = config.queue_timeout_secs {
        info!("Queue timeout: {}s", secs);
    }

    let server = TunnelServer::bind(config)
        .await
        .context("Failed to start tunnel server")?;

    let shutdown = CancellationToken::new();
    shutdown_on_ctrl_c(shutdown.clone());

    server.run(shutdown).await.context("Tunnel server failed")?;
    Ok(())
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    let config = args
        .layer()?
        .resolve()
        .context("Invalid agent configuration")?;

    info!("Tunnel server: {}", config.server_host);
    for (alias, destination) in &config.destinations {
        info!("  alias '{}' → {}", alias, destination);
    }

    let shutdown = CancellationToken::new();
    shutdown_on_ctrl_c(shutdown.clone());

    connect_with_reconnect(
        config,
        args.max_reconnect_attempts,
        Duration::from_secs(args.reconnect_delay),
        Duration::from_secs(args.max_reconnect_delay),
        shutdown,
    )
    .await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    info!("Backhaul {} starting...", env!("GIT_TAG"));

    let result = match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Agent(args) => run_agent(args).await,
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    info!("Backhaul stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_proto::Destination;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    /// Control listener that reads each handshake and hangs up at once
    async fn spawn_flapping_server(accepted: Arc<AtomicUsize>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                let _ = reader.read_line(&mut line).await;
            }
        });
        port
    }

    fn agent_config(port: u16) -> AgentConfig {
        let mut destinations = BTreeMap::new();
        destinations.insert("web".to_string(), Destination::new("127.0.0.1", 8080));
        AgentConfig::new("127.0.0.1", port, port, destinations)
    }

    #[tokio::test]
    async fn test_short_sessions_count_toward_max_attempts() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let port = spawn_flapping_server(accepted.clone()).await;

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            connect_with_reconnect(
                agent_config(port),
                3,
                Duration::from_millis(10),
                Duration::from_millis(40),
                CancellationToken::new(),
            ),
        )
        .await
        .expect("reconnect loop never gave up");

        assert!(result.is_err());
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_shutdown_stops_reconnecting() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let port = spawn_flapping_server(accepted.clone()).await;
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(connect_with_reconnect(
            agent_config(port),
            0,
            Duration::from_millis(10),
            Duration::from_millis(40),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(accepted.load(Ordering::SeqCst) >= 2);
    }
}
