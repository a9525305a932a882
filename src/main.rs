//! rtun - expose a local TCP service through a public broker
//!
//! `rtun server` runs the broker; `rtun client` registers a local service
//! with it and forwards every end-user connection.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rtun_client::{ClientConfig, Forwarder};
use rtun_server::{parse_port_list, PortRange, ServerConfig, TunnelServer};
use serde::de::DeserializeOwned;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// rtun - Reverse TCP tunnels
#[derive(Parser, Debug)]
#[command(name = "rtun")]
#[command(about = "rtun - Expose a local TCP service on a public broker port")]
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
    /// Run the broker
    #[command(long_about = r#"
Accept client registrations and lease each client a public port. Every
connection to that port is forwarded to the client's local service.

EXAMPLES:
  # Lease ports 9000-9100, falling back to OS-assigned ports when exhausted
  rtun server --listen 0.0.0.0:7000 --port-start 9000 --port-end 9100

  # Lease from an explicit list
  rtun server --ports 8080,8081,8443

ENVIRONMENT VARIABLES:
  RTUN_LISTEN         Registration address
  RTUN_PORTS          Comma-separated public ports
  RTUN_PUBLIC_BIND    Interface public ports bind on
    "#)]
    Server(ServerArgs),

    /// Register a local service with a broker
    #[command(long_about = r#"
Connect to a broker, print the public port it assigned, and forward every
connection on that port to a local address.

EXAMPLES:
  # Expose a local web server
  rtun client --server broker.example.com:7000 --local 127.0.0.1:8080

  # Keep reconnecting if the broker goes away
  rtun client --server broker.example.com:7000 --local 127.0.0.1:8080 --reconnect

ENVIRONMENT VARIABLES:
  RTUN_SERVER         Broker registration address
  RTUN_LOCAL          Local service address
    "#)]
    Client(ClientArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// YAML configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address clients register on (e.g., 0.0.0.0:7000)
    #[arg(long, env = "RTUN_LISTEN")]
    listen: Option<SocketAddr>,

    /// Public ports to lease
    #[arg(long, env = "RTUN_PORTS", value_delimiter = ',')]
    ports: Vec<String>,

    /// First port of a public port range
    #[arg(long, requires = "port_end")]
    port_start: Option<u16>,

    /// Last port (inclusive) of a public port range
    #[arg(long, requires = "port_start")]
    port_end: Option<u16>,

    /// Interface public ports bind on
    #[arg(long, env = "RTUN_PUBLIC_BIND")]
    public_bind: Option<IpAddr>,

    /// Seconds between liveness pings to each client (0 disables)
    #[arg(long)]
    ping_interval: Option<u64>,

    /// Multiplexer keepalive interval in seconds (0 disables)
    #[arg(long)]
    keepalive: Option<u64>,

    /// Consecutive accept errors tolerated on a public port
    #[arg(long)]
    accept_retries: Option<u32>,
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// YAML configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Broker registration address (e.g., broker.example.com:7000)
    #[arg(long, env = "RTUN_SERVER")]
    server: Option<String>,

    /// Local service to forward to (e.g., 127.0.0.1:8080)
    #[arg(long, env = "RTUN_LOCAL")]
    local: Option<String>,

    /// Seconds to wait for the broker connection and port announcement
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Multiplexer keepalive interval in seconds (0 disables)
    #[arg(long)]
    keepalive: Option<u64>,

    /// Reconnect when the tunnel drops
    #[arg(long)]
    reconnect: bool,

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

/// Load configuration from YAML file
fn load_config_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Merge CLI args with config file, giving precedence to CLI args
fn build_server_config(args: ServerArgs) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ServerConfig::default(),
    };

    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if !args.ports.is_empty() {
        config.ports = parse_port_list(&args.ports);
    }
    if let (Some(start), Some(end)) = (args.port_start, args.port_end) {
        config.port_range = Some(PortRange { start, end });
    }
    if let Some(public_bind) = args.public_bind {
        config.session.public_bind = public_bind;
    }
    if let Some(secs) = args.ping_interval {
        config.session.ping_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = args.keepalive {
        config.session.keepalive_interval = Duration::from_secs(secs);
    }
    if let Some(retries) = args.accept_retries {
        config.session.accept_retry_limit = retries;
    }

    Ok(config)
}

fn build_client_config(args: &ClientArgs) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ClientConfig::default(),
    };

    if let Some(server) = &args.server {
        config.server_addr = server.clone();
    }
    if let Some(local) = &args.local {
        config.local_addr = local.clone();
    }
    if let Some(secs) = args.connect_timeout {
        config.connect_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.keepalive {
        config.keepalive_interval = Duration::from_secs(secs);
    }

    Ok(config)
}

/// Resolves on SIGINT (Ctrl+C) or, on unix, SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let config = build_server_config(args)?;
    let server = TunnelServer::bind(config)
        .await
        .context("Failed to start broker")?;

    tokio::select! {
        _ = server.run() => {}
        _ = shutdown_signal() => {
            let live = server.registry().list();
            for session in &live {
                info!(
                    session_id = session.id,
                    port = session.public_port,
                    peer = %session.peer_addr,
                    "Dropping session after {:?}",
                    session.established_at.elapsed()
                );
            }
            info!("Broker stopped ({} live sessions)", live.len());
        }
    }
    Ok(())
}

/// Run the tunnel, reconnecting with exponential backoff when enabled
async fn run_client(args: ClientArgs) -> Result<()> {
    let config = build_client_config(&args)?;
    let initial_delay = Duration::from_secs(args.reconnect_delay);
    let max_delay = Duration::from_secs(args.max_reconnect_delay);
    let max_attempts = args.max_reconnect_attempts;

    info!("Broker: {}", config.server_addr);
    info!("Local service: {}", config.local_addr);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut attempt = 0;
    let mut current_delay = initial_delay;

    loop {
        attempt += 1;

        let connected = tokio::select! {
            _ = &mut shutdown => return Ok(()),
            connected = Forwarder::connect(config.clone()) => connected,
        };

        let error = match connected {
            Ok(forwarder) => {
                attempt = 0;
                current_delay = initial_delay;
                match forwarder.run_until(&mut shutdown).await {
                    Ok(()) => {
                        info!("Tunnel closed");
                        return Ok(());
                    }
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        if !args.reconnect {
            return Err(error).context("Tunnel failed");
        }

        error!("Tunnel error: {}", error);
        if max_attempts > 0 && attempt >= max_attempts {
            anyhow::bail!("Failed to connect after {} attempts", max_attempts);
        }

        warn!(
            "Reconnecting in {} seconds... (attempt {} of {})",
            current_delay.as_secs(),
            attempt + 1,
            if max_attempts == 0 {
                "∞".to_string()
            } else {
                max_attempts.to_string()
            }
        );

        tokio::select! {
            _ = &mut shutdown => return Ok(()),
            _ = tokio::time::sleep(current_delay) => {}
        }

        // Exponential backoff with max cap
        current_delay = std::cmp::min(current_delay * 2, max_delay);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Client(args) => run_client(args).await,
    }
}
