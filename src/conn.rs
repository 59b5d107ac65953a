use crate::{
    config::ClientOptions,
    error::{MuxRpcError, Result},
    rpc::{Encoding, RpcStream, Transport},
    session::Session,
    stream::Stream,
};
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::{
    sync::{CancellationToken, WaitForCancellationFutureOwned},
    task::TaskTracker,
};

/// Client side of a multiplexed RPC connection.
///
/// Every call runs over its own sub-stream of one client session. Unary calls
/// release their sub-stream before returning; streaming calls hand it to two
/// tracked watcher tasks that release it once the stream ends. [`Conn::close`]
/// waits for those watchers.
pub struct Conn<T> {
    session: Session<T>,
    closed: AtomicBool,
    /// Tells stream watchers to close their transports.
    shutdown: CancellationToken,
    /// Fired once `close` has completed.
    done: CancellationToken,
    tracker: TaskTracker,
    max_message_size: usize,
}

impl<T> Conn<T>
where
    T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
{
    /// Establishes a client session over `io` with default options.
    pub async fn new(io: T) -> Result<Self> {
        Self::with_options(io, ClientOptions::default()).await
    }

    pub async fn with_options(io: T, options: ClientOptions) -> Result<Self> {
        options.validate()?;
        let session = Session::client(io, options.session).await?;
        Ok(Self {
            session,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
            tracker: TaskTracker::new(),
            max_message_size: options.max_message_size,
        })
    }

    /// Performs a unary call on a fresh sub-stream.
    ///
    /// The sub-stream is released before this returns, whatever the outcome,
    /// and also if the returned future is dropped early.
    pub async fn invoke<In, Out, E>(
        &self,
        ctx: &CancellationToken,
        rpc: &str,
        enc: &E,
        input: &In,
    ) -> Result<Out>
    where
        E: Encoding<In> + Encoding<Out>,
    {
        if self.is_closed() {
            return Err(MuxRpcError::ConnectionClosed);
        }
        let request = <E as Encoding<In>>::marshal(enc, input)?;
        let transport =
            Transport::with_max_message_size(self.open_stream().await?, self.max_message_size);
        let response = transport.invoke(ctx, rpc, request).await;
        drop(transport);
        <E as Encoding<Out>>::unmarshal(enc, response?)
    }

    /// Starts a streaming call on a fresh sub-stream.
    ///
    /// The stream's context is a child of `ctx`. Once it is cancelled (the
    /// RPC ended, the stream was dropped or `ctx` was cancelled) or the
    /// connection closes, the transport is closed and the sub-stream released.
    pub async fn new_stream(&self, ctx: &CancellationToken, rpc: &str) -> Result<RpcStream<Stream>> {
        let sub_stream = self.open_stream().await?;
        let closer = sub_stream.closer();
        let transport = Arc::new(Transport::with_max_message_size(
            sub_stream,
            self.max_message_size,
        ));

        let transport_closed = transport.closed();
        self.tracker.spawn(async move {
            transport_closed.await;
            tracing::trace!(stream_id = closer.stream_id(), "releasing sub-stream");
            closer.close();
        });

        let stream = match transport.new_stream(ctx, rpc).await {
            Ok(stream) => stream,
            Err(e) => {
                transport.close();
                return Err(e);
            }
        };

        let stream_ctx = stream.context().clone();
        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = stream_ctx.cancelled() => {}
                _ = shutdown.cancelled() => {}
            }
            transport.close();
        });

        Ok(stream)
    }

    /// Closes the connection. Only the first call does anything.
    ///
    /// Closes the session, then the underlying transport, then waits for all
    /// stream watchers. Both closes are attempted; the first failure is
    /// returned.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown.cancel();
        let session_result = self
            .session
            .close()
            .await
            .map_err(|e| MuxRpcError::CloseSession(Box::new(e)));
        let transport_result = self
            .session
            .close_transport()
            .await
            .map_err(|e| MuxRpcError::CloseTransport(Box::new(e)));

        self.tracker.close();
        self.tracker.wait().await;
        self.done.cancel();

        tracing::debug!("connection closed");
        session_result.and(transport_result)
    }

    /// Resolves once [`Conn::close`] has completed.
    pub fn closed(&self) -> WaitForCancellationFutureOwned {
        self.done.clone().cancelled_owned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The underlying session, e.g. to inspect its open stream count.
    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    async fn open_stream(&self) -> Result<Stream> {
        if self.is_closed() {
            return Err(MuxRpcError::ConnectionClosed);
        }
        self.session
            .open_stream()
            .await
            .map_err(|e| MuxRpcError::OpenStream(Box::new(e)))
    }
}

impl<T> Drop for Conn<T> {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.shutdown.cancel();
            self.session.close_now();
        }
    }
}

impl<T> fmt::Debug for Conn<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("session", &self.session)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .field("watchers", &self.tracker.len())
            .finish()
    }
}
