//! Multiplexer session over a single byte stream
//!
//! Three background tasks drive a session: a reader that dispatches incoming
//! frames, a writer that serializes every outgoing frame onto the
//! connection, and (optionally) a keepalive that pings the peer. Each
//! logical stream adds two pump tasks bridging its [`MuxStream`] handle to
//! the frame channels.
//!
//! Streams are flow controlled with per-stream credit. A sender may have at
//! most [`STREAM_WINDOW`] unacknowledged bytes in flight; the receiver grants
//! credit back with a window update once bytes reach the stream handle's
//! buffer. A handle that is never read therefore stalls its peer's writer.

use crate::{MuxConfig, MuxSession, MuxStream, TransportError, TransportResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rtun_proto::{
    Frame, FrameCodec, FrameType, Role, StreamId, StreamIdAllocator, SESSION_STREAM_ID,
    STREAM_WINDOW,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Bytes buffered between a stream handle and its pump tasks
const STREAM_BUFFER: usize = 64 * 1024;

/// Largest chunk read from a stream handle into one data frame
const READ_CHUNK: usize = 16 * 1024;

/// How long `close()` waits for the go-away frame to be flushed
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct StreamSlot {
    /// Feeds the stream's inbound pump; `None` once the peer closed its side
    inbound: Option<mpsc::UnboundedSender<Bytes>>,
    /// Bytes received and not yet credited back to the peer
    unacked: usize,
    /// Send credit granted by the peer, in bytes
    credit: Arc<Semaphore>,
    local_closed: bool,
}

struct Shared {
    role: Role,
    config: MuxConfig,
    frames: mpsc::UnboundedSender<Frame>,
    streams: Mutex<HashMap<StreamId, StreamSlot>>,
    pending_opens: Mutex<HashMap<StreamId, oneshot::Sender<bool>>>,
    pending_pings: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    ids: StreamIdAllocator,
    next_nonce: AtomicU32,
    shutdown: CancellationToken,
}

/// Multiplexed session (see [`MuxSession`])
pub struct Session {
    shared: Arc<Shared>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Start a session over `io` and spawn its background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<T>(io: T, role: Role, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(config.accept_backlog.max(1));
        let keepalive = config.keepalive_interval;

        let shared = Arc::new(Shared {
            role,
            config,
            frames: frames_tx,
            streams: Mutex::new(HashMap::new()),
            pending_opens: Mutex::new(HashMap::new()),
            pending_pings: Mutex::new(HashMap::new()),
            ids: StreamIdAllocator::new(role),
            next_nonce: AtomicU32::new(1),
            shutdown: CancellationToken::new(),
        });

        let writer = tokio::spawn(write_loop(
            shared.clone(),
            FramedWrite::new(write_half, FrameCodec::new()),
            frames_rx,
        ));
        tokio::spawn(read_loop(
            shared.clone(),
            FramedRead::new(read_half, FrameCodec::new()),
            incoming_tx,
        ));
        if let Some(interval) = keepalive {
            tokio::spawn(keepalive_loop(shared.clone(), interval));
        }

        debug!(role = ?role, "Multiplexer session started");

        Self {
            shared,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn server<T>(io: T, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, Role::Server, config)
    }

    pub fn client<T>(io: T, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, Role::Client, config)
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Number of logical streams not yet closed by both sides
    pub fn active_streams(&self) -> usize {
        lock(&self.shared.streams).len()
    }
}

#[async_trait]
impl MuxSession for Session {
    type Stream = MuxStream;

    async fn open_stream(&self) -> TransportResult<MuxStream> {
        self.shared.open().await
    }

    async fn accept_stream(&self) -> TransportResult<MuxStream> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.shared.shutdown.cancelled() => Err(TransportError::SessionClosed),
            stream = incoming.recv() => stream.ok_or(TransportError::SessionClosed),
        }
    }

    async fn ping(&self) -> TransportResult<Duration> {
        self.shared.ping().await
    }

    async fn close(&self) {
        self.shared.terminate();
        let writer = lock(&self.writer).take();
        if let Some(writer) = writer {
            let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer).await;
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.terminate();
    }
}

impl Shared {
    fn send(&self, frame: Frame) -> TransportResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }
        self.frames
            .send(frame)
            .map_err(|_| TransportError::SessionClosed)
    }

    async fn open(self: &Arc<Self>) -> TransportResult<MuxStream> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }

        let id = {
            let streams = lock(&self.streams);
            self.ids.allocate(|id| streams.contains_key(&id))?
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        lock(&self.pending_opens).insert(id, ack_tx);
        let stream = self.attach(id);

        if let Err(e) = self.send(Frame::open(id)) {
            lock(&self.pending_opens).remove(&id);
            self.forget(id);
            return Err(e);
        }

        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => Err(TransportError::SessionClosed),
            ack = tokio::time::timeout(self.config.open_timeout, ack_rx) => match ack {
                Ok(Ok(true)) => Ok(()),
                Ok(Ok(false)) => Err(TransportError::StreamRefused(id)),
                Ok(Err(_)) => Err(TransportError::SessionClosed),
                Err(_) => Err(TransportError::Timeout),
            },
        };

        match outcome {
            Ok(()) => {
                trace!(stream_id = id, "Stream opened");
                Ok(stream)
            }
            Err(e) => {
                lock(&self.pending_opens).remove(&id);
                self.forget(id);
                Err(e)
            }
        }
    }

    async fn ping(&self) -> TransportResult<Duration> {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (pong_tx, pong_rx) = oneshot::channel();
        lock(&self.pending_pings).insert(nonce, pong_tx);

        let started = Instant::now();
        if let Err(e) = self.send(Frame::ping(nonce)) {
            lock(&self.pending_pings).remove(&nonce);
            return Err(e);
        }

        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => Err(TransportError::SessionClosed),
            pong = tokio::time::timeout(self.config.ping_timeout, pong_rx) => match pong {
                Ok(Ok(())) => Ok(started.elapsed()),
                Ok(Err(_)) => Err(TransportError::SessionClosed),
                Err(_) => Err(TransportError::Timeout),
            },
        };

        if outcome.is_err() {
            lock(&self.pending_pings).remove(&nonce);
        }
        outcome
    }

    /// Register a stream slot and spawn the pumps behind its handle
    fn attach(self: &Arc<Self>, id: StreamId) -> MuxStream {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Semaphore::new(STREAM_WINDOW as usize));
        lock(&self.streams).insert(
            id,
            StreamSlot {
                inbound: Some(inbound_tx),
                unacked: 0,
                credit: credit.clone(),
                local_closed: false,
            },
        );

        let (handle, pipe) = tokio::io::duplex(STREAM_BUFFER);
        let (pipe_read, pipe_write) = tokio::io::split(pipe);
        tokio::spawn(self.clone().pump_outbound(id, pipe_read, credit));
        tokio::spawn(self.clone().pump_inbound(id, inbound_rx, pipe_write));

        MuxStream::new(id, handle)
    }

    fn forget(&self, id: StreamId) {
        lock(&self.streams).remove(&id);
    }

    fn mark_local_closed(&self, id: StreamId) {
        let mut streams = lock(&self.streams);
        let finished = match streams.get_mut(&id) {
            Some(slot) => {
                slot.local_closed = true;
                slot.inbound.is_none()
            }
            None => false,
        };
        if finished {
            streams.remove(&id);
        }
    }

    fn mark_remote_closed(&self, id: StreamId) {
        let mut streams = lock(&self.streams);
        let finished = match streams.get_mut(&id) {
            Some(slot) => {
                slot.inbound = None;
                slot.local_closed
            }
            None => false,
        };
        if finished {
            streams.remove(&id);
        }
    }

    /// Handle one frame from the peer. Returns false when the session should end.
    fn dispatch(self: &Arc<Self>, frame: Frame, incoming: &mpsc::Sender<MuxStream>) -> bool {
        let id = frame.stream_id;
        match frame.frame_type {
            FrameType::Open if frame.flags.has_ack() || frame.flags.has_rst() => {
                if let Some(ack) = lock(&self.pending_opens).remove(&id) {
                    let _ = ack.send(frame.flags.has_ack());
                }
            }
            FrameType::Open => self.accept_remote(id, incoming),
            FrameType::Data => {
                let mut streams = lock(&self.streams);
                let Some(slot) = streams.get_mut(&id) else {
                    trace!(stream_id = id, "Dropping data for unknown stream");
                    return true;
                };
                slot.unacked += frame.payload.len();
                if slot.unacked > STREAM_WINDOW as usize {
                    warn!(stream_id = id, "Peer overran the stream window, closing session");
                    return false;
                }
                if let Some(inbound) = slot.inbound.as_ref() {
                    let _ = inbound.send(frame.payload);
                }
            }
            FrameType::WindowUpdate => {
                let Some(increment) = frame.window_increment() else {
                    warn!(stream_id = id, "Window update without increment");
                    return true;
                };
                if let Some(slot) = lock(&self.streams).get(&id) {
                    // Credit never grows past one window
                    let room = (STREAM_WINDOW as usize)
                        .saturating_sub(slot.credit.available_permits());
                    slot.credit.add_permits((increment as usize).min(room));
                }
            }
            FrameType::Close => self.mark_remote_closed(id),
            FrameType::Ping if frame.flags.has_ack() => {
                if let Some(nonce) = frame.ping_nonce() {
                    if let Some(pong) = lock(&self.pending_pings).remove(&nonce) {
                        let _ = pong.send(());
                    }
                }
            }
            FrameType::Ping => match frame.ping_nonce() {
                Some(nonce) => {
                    let _ = self.send(Frame::pong(nonce));
                }
                None => warn!("Ping frame without nonce"),
            },
            FrameType::GoAway => {
                debug!(role = ?self.role, "Peer sent go-away");
                return false;
            }
        }
        true
    }

    fn accept_remote(self: &Arc<Self>, id: StreamId, incoming: &mpsc::Sender<MuxStream>) {
        let duplicate = lock(&self.streams).contains_key(&id);
        if duplicate || id == SESSION_STREAM_ID || self.ids.owns(id) {
            warn!(stream_id = id, "Peer opened a stream with an invalid id");
            let _ = self.send(Frame::open_rst(id));
            return;
        }

        let stream = self.attach(id);
        match incoming.try_send(stream) {
            Ok(()) => {
                let _ = self.send(Frame::open_ack(id));
            }
            Err(_) => {
                warn!(stream_id = id, "Accept backlog full, refusing stream");
                self.forget(id);
                let _ = self.send(Frame::open_rst(id));
            }
        }
    }

    /// Hand `len` bytes of receive window on `id` back to the peer
    fn grant(&self, id: StreamId, len: usize) {
        if let Some(slot) = lock(&self.streams).get_mut(&id) {
            slot.unacked = slot.unacked.saturating_sub(len);
        }
        let _ = self.send(Frame::window_update(id, len as u32));
    }

    /// Tear the session down. Safe to call any number of times.
    fn terminate(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        lock(&self.streams).clear();
        lock(&self.pending_opens).clear();
        lock(&self.pending_pings).clear();
        debug!(role = ?self.role, "Multiplexer session closed");
    }

    async fn pump_outbound(
        self: Arc<Self>,
        id: StreamId,
        mut pipe: ReadHalf<DuplexStream>,
        credit: Arc<Semaphore>,
    ) {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                read = pipe.read(&mut buf) => read.unwrap_or(0),
            };
            if n == 0 {
                break;
            }

            // READ_CHUNK never exceeds the window, so this always resolves
            // once the peer drains its side
            let granted = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                granted = credit.acquire_many(n as u32) => granted,
            };
            match granted {
                Ok(permits) => permits.forget(),
                Err(_) => return,
            }

            if self
                .send(Frame::data(id, Bytes::copy_from_slice(&buf[..n])))
                .is_err()
            {
                return;
            }
        }

        let _ = self.send(Frame::close(id));
        self.mark_local_closed(id);
    }

    async fn pump_inbound(
        self: Arc<Self>,
        id: StreamId,
        mut inbound: mpsc::UnboundedReceiver<Bytes>,
        mut pipe: WriteHalf<DuplexStream>,
    ) {
        let mut discarding = false;
        loop {
            let chunk = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                chunk = inbound.recv() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };

            if !discarding {
                let written = tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    written = pipe.write_all(&chunk) => written,
                };
                if written.is_err() {
                    trace!(stream_id = id, "Stream handle dropped, discarding inbound data");
                    discarding = true;
                }
            }

            // Discarded bytes are credited too, so the peer never stalls on
            // a handle that is gone
            self.grant(id, chunk.len());
        }
        let _ = pipe.shutdown().await;
    }
}

async fn write_loop<W>(
    shared: Arc<Shared>,
    mut sink: FramedWrite<W, FrameCodec>,
    mut frames: mpsc::UnboundedReceiver<Frame>,
) where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame).await {
                    debug!(role = ?shared.role, "Failed to write frame: {}", e);
                    break;
                }
            }
            _ = shared.shutdown.cancelled() => {
                while let Ok(frame) = frames.try_recv() {
                    if sink.feed(frame).await.is_err() {
                        break;
                    }
                }
                let _ = sink.send(Frame::go_away()).await;
                break;
            }
        }
    }

    shared.terminate();
    let _ = sink.close().await;
}

async fn read_loop<R>(
    shared: Arc<Shared>,
    mut frames: FramedRead<R, FrameCodec>,
    incoming: mpsc::Sender<MuxStream>,
) where
    R: AsyncRead + Unpin + Send,
{
    loop {
        let next = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                if !shared.dispatch(frame, &incoming) {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(role = ?shared.role, "Malformed frame, closing session: {}", e);
                break;
            }
            None => {
                debug!(role = ?shared.role, "Connection closed by peer");
                break;
            }
        }
    }

    shared.terminate();
}

async fn keepalive_loop(shared: Arc<Shared>, interval: Duration) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match shared.ping().await {
            Ok(rtt) => trace!(role = ?shared.role, ?rtt, "Keepalive ok"),
            Err(TransportError::SessionClosed) => return,
            Err(e) => {
                warn!(role = ?shared.role, "Keepalive failed, closing session: {}", e);
                shared.terminate();
                return;
            }
        }
    }
}
