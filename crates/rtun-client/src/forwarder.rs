//! Client side of a tunnel: one broker connection, many forwarded streams

use crate::config::ClientConfig;
use rtun_proto::{read_port_announcement, HandshakeError};
use rtun_transport::{proxy, MuxSession, MuxStream, Session, TransportError};
use std::future::Future;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Tunnel session failed: {0}")]
    Session(#[from] TransportError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A registered tunnel forwarding broker streams to a local service
pub struct Forwarder {
    config: ClientConfig,
    session: Session,
    public_port: u16,
}

impl Forwarder {
    /// Dial the broker and complete the handshake.
    ///
    /// The announcement line is read through the same buffered reader that
    /// then carries the multiplexer, so no framing bytes are lost.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let connect_error = |reason: String| ClientError::Connect {
            address: config.server_addr.clone(),
            reason,
        };

        let stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(&config.server_addr),
        )
        .await
        .map_err(|_| connect_error("connection timed out".to_string()))?
        .map_err(|e| connect_error(e.to_string()))?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let mut reader = BufReader::new(stream);
        let public_port =
            tokio::time::timeout(config.connect_timeout, read_port_announcement(&mut reader))
                .await
                .map_err(|_| connect_error("timed out waiting for port announcement".to_string()))??;

        let session = Session::client(reader, config.mux_config());

        info!("End user port on server: {}", public_port);

        Ok(Self {
            config,
            session,
            public_port,
        })
    }

    /// Port end users connect to on the broker
    pub fn public_port(&self) -> u16 {
        self.public_port
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Forward streams until the session ends
    pub async fn run(&self) -> Result<(), ClientError> {
        loop {
            let stream = self.session.accept_stream().await?;
            debug!(stream_id = stream.stream_id(), "Broker opened stream");

            let local_addr = self.config.local_addr.clone();
            tokio::spawn(forward_stream(stream, local_addr));
        }
    }

    /// Forward streams until `shutdown` resolves, then close the session
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), ClientError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown => {
                info!("Shutting down tunnel");
                self.close().await;
                Ok(())
            }
        }
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}

/// Bridge one broker stream to a fresh connection to the local service
async fn forward_stream(stream: MuxStream, local_addr: String) {
    let stream_id = stream.stream_id();

    let local = match TcpStream::connect(&local_addr).await {
        Ok(local) => local,
        Err(e) => {
            warn!(stream_id, "Failed to connect to local service {}: {}", local_addr, e);
            return;
        }
    };

    match proxy(stream, local).await {
        Ok((to_local, to_broker)) => debug!(
            stream_id,
            to_local, to_broker, "Forwarded connection finished"
        ),
        Err(e) => debug!(stream_id, "Forwarded connection ended with error: {}", e),
    }
}
