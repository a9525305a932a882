//! Registration listener and per-client session dispatch

use crate::config::{ServerConfig, SessionConfig};
use crate::port_pool::PortPool;
use crate::registry::{SessionInfo, SessionRegistry};
use crate::session::TunnelSession;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Pause after a failed accept on the registration listener
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Broker errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Reverse-tunnel broker
pub struct TunnelServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    pool: Arc<PortPool>,
    registry: Arc<SessionRegistry>,
    config: ServerConfig,
}

impl TunnelServer {
    /// Bind the registration listener and fill the port pool
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let pool = PortPool::new();
        if let Some(range) = config.port_range {
            pool.configure_range(range.start, range.end);
        }
        pool.configure(config.ports.iter().copied());

        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|e| ServerError::BindError {
                address: config.listen_addr.ip().to_string(),
                port: config.listen_addr.port(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        if pool.is_empty() {
            info!("Broker listening on {} (ephemeral public ports)", local_addr);
        } else {
            info!(
                "Broker listening on {} ({} public ports)",
                local_addr,
                pool.len()
            );
        }

        Ok(Self {
            listener,
            local_addr,
            pool: Arc::new(pool),
            registry: Arc::new(SessionRegistry::new()),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn pool(&self) -> Arc<PortPool> {
        self.pool.clone()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Accept clients forever, one task per client
    pub async fn run(&self) {
        loop {
            match self.listener.accept().await {
                Ok((conn, peer_addr)) => {
                    debug!("Accepted client connection from {}", peer_addr);
                    tokio::spawn(handle_client(
                        conn,
                        peer_addr,
                        self.pool.clone(),
                        self.registry.clone(),
                        self.config.session.clone(),
                    ));
                }
                Err(e) => {
                    error!("Failed to accept client connection: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

async fn handle_client(
    conn: TcpStream,
    peer_addr: SocketAddr,
    pool: Arc<PortPool>,
    registry: Arc<SessionRegistry>,
    config: SessionConfig,
) {
    if let Err(e) = conn.set_nodelay(true) {
        debug!(peer = %peer_addr, "Failed to set TCP_NODELAY: {}", e);
    }

    let id = registry.next_id();
    let session = match TunnelSession::establish(id, conn, peer_addr, pool, &config).await {
        Ok(session) => session,
        Err(e) => {
            warn!(session_id = id, peer = %peer_addr, "Handshake failed: {}", e);
            return;
        }
    };

    registry.insert(SessionInfo {
        id,
        peer_addr,
        public_port: session.port(),
        ephemeral: session.is_ephemeral(),
        established_at: Instant::now(),
    });

    debug!(session_id = id, "{} live sessions", registry.len());

    let reason = Arc::new(session).run().await;

    if let Some(info) = registry.remove(id) {
        info!(
            session_id = id,
            port = info.public_port,
            peer = %peer_addr,
            "Session closed after {:?} ({})",
            info.established_at.elapsed(),
            reason
        );
    }
}
