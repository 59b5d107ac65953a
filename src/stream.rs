use crate::{
    frame::{Frame, HEADER_SIZE},
    listener::PeerAddrs,
    session::SessionInner,
};
use bytes::{Buf, Bytes};
use flume::{
    TrySendError,
    r#async::{RecvStream, SendSink},
};
use futures::{Sink, Stream as _, ready};
use std::{
    fmt, io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    runtime::Handle,
};

/// State shared between a [`Stream`] and its [`StreamCloser`]s.
struct StreamShared {
    stream_id: u32,
    closed: AtomicBool,
    session: Arc<SessionInner>,
}

impl StreamShared {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Dropping the data sender ends any pending read with EOF.
        self.session.streams.remove(&self.stream_id);

        if !self.session.state.is_closed() {
            let fin = Frame::fin(self.session.config.version, self.stream_id);
            match self.session.frame_tx.try_send(fin) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(fin)) => self.queue_fin(fin),
            }
        }
    }

    /// Waits for room in the send queue. Pending senders are served in
    /// order, so the FIN still follows every frame this stream queued.
    fn queue_fin(&self, fin: Frame) {
        let Ok(handle) = Handle::try_current() else {
            tracing::debug!(stream_id = self.stream_id, "FIN dropped, no runtime");
            return;
        };
        let frame_tx = self.session.frame_tx.clone();
        handle.spawn(async move {
            // Fails only once the session's send loop has exited.
            let _ = frame_tx.send_async(fin).await;
        });
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.session.state.is_closed()
    }
}

/// A multiplexed sub-stream within a session.
///
/// Reads yield the peer's `PSH` payloads in order and return EOF once the peer
/// sends `FIN` or the session ends. `shutdown` half-closes the stream by
/// sending `FIN`; dropping the stream (or calling [`Stream::close`]) releases
/// it from the session immediately.
pub struct Stream {
    shared: Arc<StreamShared>,
    data_rx: RecvStream<'static, Bytes>,
    pending: Bytes,
    frame_sink: SendSink<'static, Frame>,
    write_closed: bool,
    max_payload: usize,
    addrs: PeerAddrs,
}

impl Stream {
    pub(crate) fn new(
        stream_id: u32,
        data_rx: flume::Receiver<Bytes>,
        session: Arc<SessionInner>,
    ) -> Self {
        let max_payload = session.config.max_frame_size - HEADER_SIZE;
        let frame_sink = session.frame_tx.clone().into_sink();
        let addrs = session.addrs;
        Self {
            shared: Arc::new(StreamShared {
                stream_id,
                closed: AtomicBool::new(false),
                session,
            }),
            data_rx: data_rx.into_stream(),
            pending: Bytes::new(),
            frame_sink,
            write_closed: false,
            max_payload,
            addrs,
        }
    }

    /// Get the stream ID
    pub fn stream_id(&self) -> u32 {
        self.shared.stream_id
    }

    pub fn peer_addrs(&self) -> PeerAddrs {
        self.addrs
    }

    /// A handle that can close this stream from another task.
    pub fn closer(&self) -> StreamCloser {
        StreamCloser {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Releases the stream from the session and notifies the peer.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    fn map_send_err<E>(_: E) -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "session closed")
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("stream_id", &self.shared.stream_id)
            .field("closed", &self.shared.is_closed())
            .field("write_closed", &self.write_closed)
            .field("addrs", &self.addrs)
            .finish()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if !this.pending.is_empty() {
                let n = buf.remaining().min(this.pending.len());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.data_rx).poll_next(cx)) {
                Some(chunk) => this.pending = chunk,
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_closed || this.shared.is_closed() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream closed",
            )));
        }
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        // Waits for the previous frame to reach the send queue.
        ready!(Pin::new(&mut this.frame_sink).poll_ready(cx)).map_err(Self::map_send_err)?;

        let n = data.len().min(this.max_payload);
        let frame = Frame::psh(
            this.shared.session.config.version,
            this.shared.stream_id,
            Bytes::copy_from_slice(&data[..n]),
        );
        Pin::new(&mut this.frame_sink)
            .start_send(frame)
            .map_err(Self::map_send_err)?;

        // Hand the frame over now; a full queue parks it until the next poll.
        if let Poll::Ready(Err(e)) = Pin::new(&mut this.frame_sink).poll_flush(cx) {
            return Poll::Ready(Err(Self::map_send_err(e)));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.frame_sink)
            .poll_flush(cx)
            .map_err(Self::map_send_err)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.write_closed && !this.shared.is_closed() {
            ready!(Pin::new(&mut this.frame_sink).poll_ready(cx)).map_err(Self::map_send_err)?;
            let fin = Frame::fin(this.shared.session.config.version, this.shared.stream_id);
            Pin::new(&mut this.frame_sink)
                .start_send(fin)
                .map_err(Self::map_send_err)?;
            this.write_closed = true;
        }
        Pin::new(&mut this.frame_sink)
            .poll_flush(cx)
            .map_err(Self::map_send_err)
    }
}

/// Closes a [`Stream`] without owning it.
#[derive(Clone)]
pub struct StreamCloser {
    shared: Arc<StreamShared>,
}

impl StreamCloser {
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn stream_id(&self) -> u32 {
        self.shared.stream_id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl fmt::Debug for StreamCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCloser")
            .field("stream_id", &self.shared.stream_id)
            .finish()
    }
}
