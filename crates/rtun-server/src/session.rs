//! One client's registration with the broker
//!
//! A session leases a public port, announces it to the client, and then runs
//! two loops until the client is found dead: a liveness loop pinging the
//! multiplexer and an accept loop bridging end-user connections to logical
//! streams. Whichever loop notices death first calls [`TunnelSession::cleanup`],
//! which closes the public listener before the port goes back to the pool.

use crate::config::SessionConfig;
use crate::port_pool::{PortLease, PortPool};
use rtun_proto::encode_port_announcement;
use rtun_transport::{proxy, MuxSession, Session};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::task::Poll;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause between retries when `accept_retry_limit` allows them
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Errors while establishing a session. The lease is already returned to
/// the pool when one of these is reported.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Remove the port from the broker's pool")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to announce port to client: {0}")]
    Announce(std::io::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathReason {
    /// A liveness ping failed or timed out
    PingFailed,
    /// The client could not open a stream for an end user
    StreamOpenFailed,
    /// The public listener returned an accept error
    AcceptFailed,
    /// `shutdown()` was called
    Shutdown,
}

impl fmt::Display for DeathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DeathReason::PingFailed => "ping failed",
            DeathReason::StreamOpenFailed => "stream open failed",
            DeathReason::AcceptFailed => "accept failed",
            DeathReason::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

pub struct TunnelSession<S: MuxSession> {
    id: u64,
    peer_addr: SocketAddr,
    public_addr: SocketAddr,
    lease: PortLease,
    pool: Arc<PortPool>,
    /// Public listener; `None` once cleanup has closed it
    listener: Mutex<Option<TcpListener>>,
    mux: Arc<S>,
    config: SessionConfig,
    shutdown: CancellationToken,
    death: OnceLock<DeathReason>,
}

impl TunnelSession<Session> {
    /// Run the handshake on a freshly accepted client connection.
    ///
    /// Leases a port, binds the public listener, writes the port line, then
    /// starts the multiplexer over `conn`. On error the lease is retired and
    /// `conn` is dropped.
    pub async fn establish<C>(
        id: u64,
        mut conn: C,
        peer_addr: SocketAddr,
        pool: Arc<PortPool>,
        config: &SessionConfig,
    ) -> Result<Self, SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let lease = pool.lease();

        let listener = match announce(&mut conn, &lease, config).await {
            Ok(listener) => listener,
            Err(e) => {
                pool.retire(&lease);
                return Err(e);
            }
        };
        let public_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                pool.retire(&lease);
                return Err(e.into());
            }
        };

        let mux = Session::server(conn, config.mux_config());
        Ok(Self::new(
            id,
            peer_addr,
            listener,
            public_addr,
            lease,
            pool,
            Arc::new(mux),
            config.clone(),
        ))
    }
}

/// Bind the public listener for `lease` and write its port to the client
async fn announce<C>(
    conn: &mut C,
    lease: &PortLease,
    config: &SessionConfig,
) -> Result<TcpListener, SessionError>
where
    C: AsyncWrite + Unpin,
{
    let bind_addr = SocketAddr::new(config.public_bind, lease.port().unwrap_or(0));
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| SessionError::Bind {
            address: bind_addr.to_string(),
            port: bind_addr.port(),
            reason: e.to_string(),
        })?;
    let port = listener.local_addr()?.port();

    conn.write_all(encode_port_announcement(port).as_bytes())
        .await
        .map_err(SessionError::Announce)?;
    conn.flush().await.map_err(SessionError::Announce)?;

    Ok(listener)
}

impl<S: MuxSession + 'static> TunnelSession<S> {
    /// Wrap an already-announced session around any multiplexer
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        peer_addr: SocketAddr,
        listener: TcpListener,
        public_addr: SocketAddr,
        lease: PortLease,
        pool: Arc<PortPool>,
        mux: Arc<S>,
        config: SessionConfig,
    ) -> Self {
        Self {
            id,
            peer_addr,
            public_addr,
            lease,
            pool,
            listener: Mutex::new(Some(listener)),
            mux,
            config,
            shutdown: CancellationToken::new(),
            death: OnceLock::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    /// Public port end users connect to
    pub fn port(&self) -> u16 {
        self.public_addr.port()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.lease.is_ephemeral()
    }

    pub fn is_alive(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Reason recorded by the cleanup that ran, if any
    pub fn death_reason(&self) -> Option<DeathReason> {
        self.death.get().copied()
    }

    /// Whether the public port is still bound
    pub fn is_listening(&self) -> bool {
        self.listener().is_some()
    }

    fn listener(&self) -> MutexGuard<'_, Option<TcpListener>> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark the session dead: close the public listener, return the port
    /// and stop both loops.
    ///
    /// Returns true only for the call that performed the cleanup. The flag
    /// is the lease's own entry in the pool, so it is decided under the
    /// pool's lock. The port is restored only after the listener is closed.
    pub fn cleanup(&self, reason: DeathReason) -> bool {
        if !self.pool.claim(&self.lease) {
            return false;
        }
        let _ = self.death.set(reason);
        self.shutdown.cancel();

        drop(self.listener().take());
        self.pool.restore(&self.lease);

        if self.lease.is_ephemeral() {
            info!(
                session_id = self.id,
                port = self.port(),
                peer = %self.peer_addr,
                "Session dead ({}), ephemeral port closed",
                reason
            );
        } else {
            info!(
                session_id = self.id,
                port = self.port(),
                peer = %self.peer_addr,
                "Session dead ({}), port released",
                reason
            );
        }
        true
    }

    /// Ask a running session to stop
    pub fn shutdown(&self) -> bool {
        self.cleanup(DeathReason::Shutdown)
    }

    /// Drive the session until it dies, then close the multiplexer.
    pub async fn run(self: Arc<Self>) -> DeathReason {
        info!(
            session_id = self.id,
            port = self.port(),
            peer = %self.peer_addr,
            ephemeral = self.is_ephemeral(),
            "Session established"
        );

        let liveness = tokio::spawn(self.clone().liveness_loop());
        let reason = self.accept_loop().await;
        self.cleanup(reason);

        self.mux.close().await;
        let _ = liveness.await;

        self.death_reason().unwrap_or(reason)
    }

    async fn liveness_loop(self: Arc<Self>) {
        let interval = self.config.ping_interval;
        if interval.is_zero() {
            debug!(session_id = self.id, "Liveness pings disabled");
            return;
        }

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let ping = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                ping = self.mux.ping() => ping,
            };
            match ping {
                Ok(rtt) => debug!(session_id = self.id, ?rtt, "Ping ok"),
                Err(e) => {
                    warn!(
                        session_id = self.id,
                        port = self.port(),
                        "Ping failed: {}",
                        e
                    );
                    self.cleanup(DeathReason::PingFailed);
                    return;
                }
            }
        }
    }

    /// Accept on the public listener, or `None` once it has been closed
    async fn accept(&self) -> Option<io::Result<(TcpStream, SocketAddr)>> {
        std::future::poll_fn(|cx| match self.listener().as_ref() {
            Some(listener) => listener.poll_accept(cx).map(Some),
            None => Poll::Ready(None),
        })
        .await
    }

    /// Bridge end users to the client until the session dies
    async fn accept_loop(&self) -> DeathReason {
        let mut consecutive_errors = 0u32;

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return self.stopped(),
                accepted = self.accept() => accepted,
            };

            let (conn, user_addr) = match accepted {
                None => return self.stopped(),
                Some(Ok(accepted)) => {
                    consecutive_errors = 0;
                    accepted
                }
                Some(Err(e)) if consecutive_errors < self.config.accept_retry_limit => {
                    consecutive_errors += 1;
                    warn!(
                        session_id = self.id,
                        port = self.port(),
                        attempt = consecutive_errors,
                        "Accept error, retrying: {}",
                        e
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return self.stopped(),
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    }
                    continue;
                }
                Some(Err(e)) => {
                    warn!(
                        session_id = self.id,
                        port = self.port(),
                        "Accept failed on public listener: {}",
                        e
                    );
                    return DeathReason::AcceptFailed;
                }
            };

            debug!(session_id = self.id, user = %user_addr, "End user connected");

            let opened = tokio::select! {
                _ = self.shutdown.cancelled() => return self.stopped(),
                opened = self.mux.open_stream() => opened,
            };

            let stream = match opened {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(
                        session_id = self.id,
                        port = self.port(),
                        user = %user_addr,
                        "Failed to open stream to client: {}",
                        e
                    );
                    drop(conn);
                    return DeathReason::StreamOpenFailed;
                }
            };

            let session_id = self.id;
            tokio::spawn(async move {
                match proxy(conn, stream).await {
                    Ok((to_client, to_user)) => debug!(
                        session_id,
                        user = %user_addr,
                        to_client,
                        to_user,
                        "End user connection finished"
                    ),
                    Err(e) => debug!(
                        session_id,
                        user = %user_addr,
                        "End user connection ended with error: {}",
                        e
                    ),
                }
            });
        }
    }

    fn stopped(&self) -> DeathReason {
        self.death_reason().unwrap_or(DeathReason::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rtun_proto::read_port_announcement;
    use rtun_transport::{TransportError, TransportResult};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, BufReader, DuplexStream};
    use tokio::sync::mpsc;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Multiplexer stand-in whose ping and open results are switchable
    struct MockMux {
        ping_ok: AtomicBool,
        open_ok: AtomicBool,
        closed: AtomicBool,
        opens: AtomicUsize,
        client_ends: Mutex<Option<mpsc::UnboundedSender<DuplexStream>>>,
    }

    impl MockMux {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let mux = Arc::new(Self {
                ping_ok: AtomicBool::new(true),
                open_ok: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                opens: AtomicUsize::new(0),
                client_ends: Mutex::new(Some(tx)),
            });
            (mux, rx)
        }
    }

    #[async_trait]
    impl MuxSession for MockMux {
        type Stream = DuplexStream;

        async fn open_stream(&self) -> TransportResult<DuplexStream> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if !self.open_ok.load(Ordering::SeqCst) {
                return Err(TransportError::Timeout);
            }
            let (ours, theirs) = tokio::io::duplex(4096);
            if let Some(tx) = self.client_ends.lock().unwrap().as_ref() {
                let _ = tx.send(theirs);
            }
            Ok(ours)
        }

        async fn accept_stream(&self) -> TransportResult<DuplexStream> {
            Err(TransportError::SessionClosed)
        }

        async fn ping(&self) -> TransportResult<Duration> {
            if self.ping_ok.load(Ordering::SeqCst) {
                Ok(Duration::from_millis(1))
            } else {
                Err(TransportError::Timeout)
            }
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.client_ends.lock().unwrap().take();
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            public_bind: "127.0.0.1".parse().unwrap(),
            ping_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    /// A session over `mux` holding a freshly leased, bound port
    async fn mock_session(
        pool: &Arc<PortPool>,
        mux: Arc<MockMux>,
        config: SessionConfig,
    ) -> Arc<TunnelSession<MockMux>> {
        let lease = pool.lease();
        let listener = TcpListener::bind(("127.0.0.1", lease.port().unwrap_or(0)))
            .await
            .unwrap();
        let public_addr = listener.local_addr().unwrap();
        let session = TunnelSession::new(
            1,
            "127.0.0.1:5555".parse().unwrap(),
            listener,
            public_addr,
            lease,
            pool.clone(),
            mux,
            config,
        );
        Arc::new(session)
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn within<F: std::future::Future>(fut: F) -> F::Output {
        tokio::time::timeout(TEST_TIMEOUT, fut)
            .await
            .expect("test step timed out")
    }

    #[tokio::test]
    async fn test_establish_announces_pooled_port() {
        let port = free_port().await;
        let pool = Arc::new(PortPool::with_ports([port]));
        let (server_end, client_end) = tokio::io::duplex(4096);

        let session = TunnelSession::establish(
            7,
            server_end,
            "127.0.0.1:5555".parse().unwrap(),
            pool.clone(),
            &fast_config(),
        )
        .await
        .unwrap();

        let mut reader = BufReader::new(client_end);
        let announced = read_port_announcement(&mut reader).await.unwrap();

        assert_eq!(announced, port);
        assert_eq!(session.port(), port);
        assert!(session.is_listening());
        assert!(!session.is_ephemeral());
        assert!(!pool.contains(port));
    }

    #[tokio::test]
    async fn test_establish_falls_back_to_ephemeral() {
        let pool = Arc::new(PortPool::new());
        let (server_end, client_end) = tokio::io::duplex(4096);

        let session = TunnelSession::establish(
            1,
            server_end,
            "127.0.0.1:5555".parse().unwrap(),
            pool.clone(),
            &fast_config(),
        )
        .await
        .unwrap();

        let mut reader = BufReader::new(client_end);
        let announced = read_port_announcement(&mut reader).await.unwrap();

        assert!(session.is_ephemeral());
        assert_ne!(announced, 0);
        assert_eq!(announced, session.port());

        assert!(session.cleanup(DeathReason::Shutdown));
        assert!(!session.is_listening());
        assert!(pool.is_empty());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_bind_failure_returns_port_to_pool() {
        let squatter = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = squatter.local_addr().unwrap().port();
        let pool = Arc::new(PortPool::with_ports([port]));
        let (server_end, mut client_end) = tokio::io::duplex(4096);

        let result = TunnelSession::establish(
            1,
            server_end,
            "127.0.0.1:5555".parse().unwrap(),
            pool.clone(),
            &fast_config(),
        )
        .await;

        assert!(matches!(result, Err(SessionError::Bind { port: p, .. }) if p == port));
        assert_eq!(pool.available(), vec![port]);
        assert_eq!(pool.outstanding(), 0);

        // Nothing was announced and the connection is gone
        let mut buf = Vec::new();
        client_end.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_announce_failure_returns_port_to_pool() {
        let port = free_port().await;
        let pool = Arc::new(PortPool::with_ports([port]));
        let (server_end, client_end) = tokio::io::duplex(4096);
        drop(client_end);

        let result = TunnelSession::establish(
            1,
            server_end,
            "127.0.0.1:5555".parse().unwrap(),
            pool.clone(),
            &fast_config(),
        )
        .await;

        assert!(matches!(result, Err(SessionError::Announce(_))));
        assert_eq!(pool.available(), vec![port]);

        // The listener was dropped too, so the port can be bound again
        TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_failure_releases_port_and_closes_listener() {
        let port = free_port().await;
        let pool = Arc::new(PortPool::with_ports([port]));
        let (mux, _client_ends) = MockMux::new();
        let session = mock_session(&pool, mux.clone(), fast_config()).await;

        let run = tokio::spawn(session.clone().run());
        mux.ping_ok.store(false, Ordering::SeqCst);

        let reason = within(run).await.unwrap();
        assert_eq!(reason, DeathReason::PingFailed);
        assert!(!session.is_alive());
        assert!(mux.is_closed());
        assert_eq!(pool.available(), vec![port]);

        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_open_failure_kills_session() {
        let port = free_port().await;
        let pool = Arc::new(PortPool::with_ports([port]));
        let (mux, _client_ends) = MockMux::new();
        mux.open_ok.store(false, Ordering::SeqCst);

        let config = SessionConfig {
            ping_interval: Duration::ZERO,
            ..fast_config()
        };
        let session = mock_session(&pool, mux.clone(), config).await;
        let run = tokio::spawn(session.clone().run());

        let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let reason = within(run).await.unwrap();
        assert_eq!(reason, DeathReason::StreamOpenFailed);
        assert_eq!(mux.opens.load(Ordering::SeqCst), 1);
        assert_eq!(pool.available(), vec![port]);

        // The end user is closed without any data
        let mut buf = Vec::new();
        let _ = within(user.read_to_end(&mut buf)).await;
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_end_user_bytes_reach_client_stream() {
        let pool = Arc::new(PortPool::new());
        let (mux, mut client_ends) = MockMux::new();
        let session = mock_session(&pool, mux.clone(), fast_config()).await;
        let port = session.port();
        let run = tokio::spawn(session.clone().run());

        let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut client = within(client_ends.recv()).await.unwrap();

        user.write_all(b"ping?").await.unwrap();
        let mut buf = [0u8; 5];
        within(client.read_exact(&mut buf)).await.unwrap();
        assert_eq!(&buf, b"ping?");

        client.write_all(b"pong!").await.unwrap();
        within(user.read_exact(&mut buf)).await.unwrap();
        assert_eq!(&buf, b"pong!");

        assert!(session.shutdown());
        assert_eq!(within(run).await.unwrap(), DeathReason::Shutdown);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let pool = Arc::new(PortPool::with_ports([free_port().await, free_port().await]));
        let (mux, _client_ends) = MockMux::new();
        let session = mock_session(&pool, mux, fast_config()).await;
        let leased = session.port();

        assert!(session.cleanup(DeathReason::PingFailed));
        let after_once = pool.available();

        assert!(!session.cleanup(DeathReason::StreamOpenFailed));
        assert_eq!(pool.available(), after_once);
        assert!(pool.contains(leased));
        assert_eq!(session.death_reason(), Some(DeathReason::PingFailed));
    }

    #[tokio::test]
    async fn test_released_port_is_immediately_bindable() {
        let port = free_port().await;
        let pool = Arc::new(PortPool::with_ports([port]));
        let (mux, _client_ends) = MockMux::new();
        let config = SessionConfig {
            ping_interval: Duration::ZERO,
            ..fast_config()
        };
        let session = mock_session(&pool, mux, config).await;
        let run = tokio::spawn(session.clone().run());

        // Let the accept loop start waiting on the listener
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(session.cleanup(DeathReason::PingFailed));
        assert!(!session.is_listening());

        // The next session gets the same port and can bind it right away
        let next = pool.lease();
        assert_eq!(next.lease(), crate::port_pool::Lease::Pooled(port));
        TcpListener::bind(("127.0.0.1", port)).await.unwrap();

        assert_eq!(within(run).await.unwrap(), DeathReason::PingFailed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_cleanups_release_once() {
        for _ in 0..20 {
            let port = free_port().await;
            let pool = Arc::new(PortPool::with_ports([port]));
            let (mux, _client_ends) = MockMux::new();
            let session = mock_session(&pool, mux, fast_config()).await;

            let liveness = {
                let session = session.clone();
                tokio::spawn(async move { session.cleanup(DeathReason::PingFailed) })
            };
            let accept = {
                let session = session.clone();
                tokio::spawn(async move { session.cleanup(DeathReason::AcceptFailed) })
            };

            let (a, b) = tokio::join!(liveness, accept);
            assert!(a.unwrap() ^ b.unwrap());
            assert_eq!(pool.available(), vec![port]);
            assert_eq!(pool.outstanding(), 0);
        }
    }

    #[test]
    fn test_death_reason_display() {
        assert_eq!(DeathReason::PingFailed.to_string(), "ping failed");
        assert_eq!(DeathReason::Shutdown.to_string(), "shutdown");
    }
}
