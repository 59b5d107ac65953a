use crate::{
    codec::FrameCodec,
    config::Config,
    error::{MuxRpcError, Result},
    frame::{Command, Frame},
    listener::PeerAddrs,
    stream::Stream,
    stream_id::StreamIdGenerator,
};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::{
    fmt,
    future::Future,
    io,
    marker::PhantomData,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Mutex,
    task::JoinHandle,
    time::{Instant, interval_at},
};
use tokio_util::{codec::Framed, sync::CancellationToken};

/// The session-side half of a stream: where the receive loop delivers data.
#[derive(Debug)]
pub(crate) struct StreamState {
    data_tx: flume::Sender<Bytes>,
}

/// Why a session ended. Only the first reason is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CloseReason {
    Local,
    PeerEof,
    KeepAliveTimeout,
    Io(io::ErrorKind, String),
    Protocol(String),
}

impl CloseReason {
    fn from_error(err: &MuxRpcError) -> Self {
        match err {
            MuxRpcError::KeepAliveTimeout => CloseReason::KeepAliveTimeout,
            MuxRpcError::Io(e) if err.is_transient() => CloseReason::Io(e.kind(), e.to_string()),
            other => CloseReason::Protocol(other.to_string()),
        }
    }
}

#[derive(Debug)]
pub(crate) struct SessionState {
    die: CancellationToken,
    reason: OnceLock<CloseReason>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            die: CancellationToken::new(),
            reason: OnceLock::new(),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.die.is_cancelled()
    }

    /// Returns true for the call that actually closed the session.
    fn close(&self, reason: CloseReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.die.cancel();
        first
    }

    /// What `accept_stream` reports once the session is gone: a clean end,
    /// or the transient failure that killed it, repeated on every call.
    fn terminal<S>(&self) -> Result<Option<S>> {
        match self.reason.get() {
            Some(CloseReason::KeepAliveTimeout) => Err(MuxRpcError::KeepAliveTimeout),
            Some(CloseReason::Io(kind, msg)) => Err(io::Error::new(*kind, msg.clone()).into()),
            _ => Ok(None),
        }
    }
}

/// Internal session state shared between tasks and streams
pub(crate) struct SessionInner {
    /// Active streams mapped by stream ID
    pub(crate) streams: DashMap<u32, StreamState>,
    pub(crate) config: Arc<Config>,
    /// Peer-opened streams (or per-SYN errors) waiting for `accept_stream`
    incoming_tx: flume::Sender<Result<Stream>>,
    incoming_rx: flume::Receiver<Result<Stream>>,
    ids: StreamIdGenerator,
    /// Outgoing frames, drained by the send loop
    pub(crate) frame_tx: flume::Sender<Frame>,
    pub(crate) state: SessionState,
    pub(crate) addrs: PeerAddrs,
    /// Set by the receive loop on every frame, cleared by the keep-alive check
    data_ready: AtomicBool,
}

impl SessionInner {
    fn shutdown(&self, reason: CloseReason) {
        if self.state.close(reason) {
            tracing::debug!(reason = ?self.state.reason.get(), "session closed");
        }
        self.streams.clear();
        // Streams nobody accepted are released here.
        while self.incoming_rx.try_recv().is_ok() {}
    }

    fn register_stream(self: &Arc<Self>, stream_id: u32) -> Stream {
        let (data_tx, data_rx) = flume::unbounded();
        self.streams.insert(stream_id, StreamState { data_tx });
        Stream::new(stream_id, data_rx, Arc::clone(self))
    }
}

struct IoTasks {
    recv: JoinHandle<()>,
    send: JoinHandle<Result<()>>,
    keepalive: Option<JoinHandle<()>>,
}

/// A multiplexed session that manages multiple streams over a single connection
pub struct Session<T> {
    inner: Arc<SessionInner>,
    io_tasks: Arc<Mutex<Option<IoTasks>>>,
    _transport: PhantomData<fn() -> T>,
}

impl<T> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            io_tasks: Arc::clone(&self.io_tasks),
            _transport: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("streams", &self.inner.streams.len())
            .field("closed", &self.inner.state.is_closed())
            .field("addrs", &self.inner.addrs)
            .finish()
    }
}

impl<T> Session<T> {
    pub(crate) fn close_now(&self) {
        self.inner.shutdown(CloseReason::Local);
    }
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
{
    /// Create a new client session
    pub async fn client(transport: T, config: Config) -> Result<Self> {
        Self::new(transport, config, true, PeerAddrs::default()).await
    }

    /// Create a new server session
    pub async fn server(transport: T, config: Config) -> Result<Self> {
        Self::new(transport, config, false, PeerAddrs::default()).await
    }

    /// Create a server session whose streams report the given addresses.
    pub async fn server_with_addrs(transport: T, config: Config, addrs: PeerAddrs) -> Result<Self> {
        Self::new(transport, config, false, addrs).await
    }

    async fn new(transport: T, config: Config, is_client: bool, addrs: PeerAddrs) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let framed = Framed::new(transport, FrameCodec::new((*config).clone()));
        let (sink, stream) = framed.split();

        let (frame_tx, frame_rx) = flume::bounded(config.send_queue_size);
        let (incoming_tx, incoming_rx) = flume::bounded(config.accept_backlog);

        let inner = Arc::new(SessionInner {
            streams: DashMap::new(),
            config: Arc::clone(&config),
            incoming_tx,
            incoming_rx,
            ids: StreamIdGenerator::new(is_client),
            frame_tx,
            state: SessionState::new(),
            addrs,
            data_ready: AtomicBool::new(false),
        });

        let recv = tokio::spawn(recv_loop(stream, Arc::clone(&inner)));
        let send = tokio::spawn(send_loop(sink, frame_rx, Arc::clone(&inner)));
        let keepalive = config
            .enable_keep_alive
            .then(|| tokio::spawn(keepalive_loop(Arc::clone(&inner))));

        Ok(Session {
            inner,
            io_tasks: Arc::new(Mutex::new(Some(IoTasks {
                recv,
                send,
                keepalive,
            }))),
            _transport: PhantomData,
        })
    }

    /// Open a new outgoing stream
    pub async fn open_stream(&self) -> Result<Stream> {
        if self.is_closed() {
            return Err(MuxRpcError::SessionClosed);
        }

        let stream_id = self.inner.ids.next()?;
        let stream = self.inner.register_stream(stream_id);

        let syn = Frame::syn(self.inner.config.version, stream_id);
        self.inner
            .frame_tx
            .send_async(syn)
            .await
            .map_err(|_| MuxRpcError::SessionClosed)?;

        Ok(stream)
    }

    /// Accept an incoming stream initiated by the peer.
    ///
    /// Returns `Ok(None)` once the session has ended cleanly. If it was torn
    /// down by a transient failure (reset, broken pipe, keep-alive timeout)
    /// that error is returned instead, on this and every later call.
    pub async fn accept_stream(&self) -> Result<Option<Stream>> {
        if self.is_closed() {
            return self.inner.state.terminal();
        }

        tokio::select! {
            biased;
            _ = self.inner.state.die.cancelled() => self.inner.state.terminal(),
            result = self.inner.incoming_rx.recv_async() => match result {
                Ok(incoming) => incoming.map(Some),
                Err(_) => self.inner.state.terminal(),
            },
        }
    }

    /// Close the session: every stream sees EOF, no new streams are opened
    /// or accepted, and the I/O tasks begin shutting the transport down.
    #[inline]
    pub async fn close(&self) -> Result<()> {
        self.close_now();
        Ok(())
    }

    /// Closes the session if needed, then waits for its I/O tasks to release
    /// the underlying transport. Reports a failure to shut the transport down.
    pub async fn close_transport(&self) -> Result<()> {
        self.inner.shutdown(CloseReason::Local);

        let Some(tasks) = self.io_tasks.lock().await.take() else {
            return Ok(());
        };
        if let Some(keepalive) = tasks.keepalive {
            let _ = keepalive.await;
        }
        let _ = tasks.recv.await;
        match tasks.send.await {
            Ok(result) => result,
            Err(e) => Err(io::Error::other(e).into()),
        }
    }

    /// Check if the session is closed
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.state.is_closed()
    }

    /// Number of streams currently open in this session.
    pub fn num_streams(&self) -> usize {
        self.inner.streams.len()
    }

    pub fn peer_addrs(&self) -> PeerAddrs {
        self.inner.addrs
    }
}

/// Background task that reads frames from the transport and dispatches them
async fn recv_loop<T>(mut stream: SplitStream<Framed<T, FrameCodec>>, inner: Arc<SessionInner>)
where
    T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
{
    let reason = loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(frame)) => {
                    inner.data_ready.store(true, Ordering::Release);
                    handle_frame(frame, &inner).await;
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "frame decode error");
                    break CloseReason::from_error(&e);
                }
                None => {
                    tracing::debug!("transport closed by peer");
                    break CloseReason::PeerEof;
                }
            },
            _ = inner.state.die.cancelled() => break CloseReason::Local,
        }
    };

    inner.shutdown(reason);
}

/// Background task that writes frames to the transport. Returns the result of
/// shutting the transport down after a local close.
async fn send_loop<T>(
    mut sink: SplitSink<Framed<T, FrameCodec>, Frame>,
    frame_rx: flume::Receiver<Frame>,
    inner: Arc<SessionInner>,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
{
    loop {
        tokio::select! {
            frame = frame_rx.recv_async() => {
                let Ok(frame) = frame else { break };
                let mut result = sink.feed(frame).await;
                if result.is_ok() && frame_rx.is_empty() {
                    result = sink.flush().await;
                }
                if let Err(e) = result {
                    tracing::error!(error = %e, "frame send error");
                    inner.shutdown(CloseReason::from_error(&e));
                    let _ = sink.close().await;
                    return Ok(());
                }
            }
            _ = inner.state.die.cancelled() => break,
        }
    }

    // Frames queued before the close (FINs, final payloads) still go out.
    while let Ok(frame) = frame_rx.try_recv() {
        if sink.feed(frame).await.is_err() {
            break;
        }
    }

    let alive = matches!(inner.state.reason.get(), Some(CloseReason::Local) | None);
    match sink.close().await {
        Err(e) if alive => Err(e),
        _ => Ok(()),
    }
}

/// Sends NOPs every interval and closes the session if nothing at all was
/// received from the peer within one timeout period.
async fn keepalive_loop(inner: Arc<SessionInner>) {
    let interval = inner.config.keep_alive_interval;
    let timeout = inner.config.keep_alive_timeout;
    let start = Instant::now();
    let mut ping = interval_at(start + interval, interval);
    let mut check = interval_at(start + timeout, timeout);

    loop {
        tokio::select! {
            _ = inner.state.die.cancelled() => break,
            _ = ping.tick() => {
                let _ = inner.frame_tx.try_send(Frame::nop(inner.config.version));
            }
            _ = check.tick() => {
                if !inner.data_ready.swap(false, Ordering::AcqRel) {
                    tracing::warn!(remote_addr = ?inner.addrs.remote, "keep-alive timeout, closing session");
                    inner.shutdown(CloseReason::KeepAliveTimeout);
                    break;
                }
            }
        }
    }
}

/// Handle an incoming frame based on its command type
async fn handle_frame(frame: Frame, inner: &Arc<SessionInner>) {
    match frame.cmd {
        Command::Syn => handle_syn_frame(frame.stream_id, inner).await,
        Command::Fin => {
            // Dropping the sender signals EOF to the local reader
            inner.streams.remove(&frame.stream_id);
        }
        Command::Psh => {
            if let Some(state) = inner.streams.get(&frame.stream_id) {
                // The reader may already be gone; its data is discarded.
                let _ = state.data_tx.send(frame.data);
            }
        }
        // NOP is a keep-alive; window updates are accepted but not enforced.
        Command::Nop | Command::Upd { .. } => {}
    }
}

/// Handle SYN frame (new stream from peer)
async fn handle_syn_frame(stream_id: u32, inner: &Arc<SessionInner>) {
    let incoming = match inner.ids.validate_peer_stream_id(stream_id) {
        Err(e) => Err(e),
        Ok(()) if inner.streams.contains_key(&stream_id) => {
            Err(MuxRpcError::StreamAlreadyExists(stream_id))
        }
        Ok(()) => Ok(inner.register_stream(stream_id)),
    };

    tokio::select! {
        result = inner.incoming_tx.send_async(incoming) => {
            if result.is_err() {
                tracing::debug!(stream_id, "accept queue closed");
            }
        }
        _ = inner.state.die.cancelled() => {}
    }
}

/// The session operations the server's accept loop relies on.
///
/// Implemented by [`Session`]; tests substitute scripted sessions.
pub trait MuxSession: Send + Sync + 'static {
    type Stream: SubStream;

    fn open(&self) -> impl Future<Output = Result<Self::Stream>> + Send;

    /// `Ok(None)` signals a clean end of the session.
    fn accept(&self) -> impl Future<Output = Result<Option<Self::Stream>>> + Send;

    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// A sub-stream that knows which connection it belongs to.
pub trait SubStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    fn peer_addrs(&self) -> PeerAddrs;
}

impl SubStream for Stream {
    fn peer_addrs(&self) -> PeerAddrs {
        Stream::peer_addrs(self)
    }
}

impl<T> MuxSession for Session<T>
where
    T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
{
    type Stream = Stream;

    fn open(&self) -> impl Future<Output = Result<Stream>> + Send {
        self.open_stream()
    }

    fn accept(&self) -> impl Future<Output = Result<Option<Stream>>> + Send {
        self.accept_stream()
    }

    fn close(&self) -> impl Future<Output = Result<()>> + Send {
        Session::close(self)
    }
}
