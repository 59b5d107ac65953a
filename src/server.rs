use crate::{
    config::ServerOptions,
    error::{MuxRpcError, Result},
    error_window::ErrorWindow,
    listener::{Listener, PeerAddrs},
    rpc::{Handler, RequestContext, RpcServer},
    session::{MuxSession, Session, SubStream},
};
use std::{
    fmt,
    future::{self, Future},
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::Instant,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// How a session's accept loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The session ended cleanly, usually because the peer went away.
    PeerClosed,
    /// Too many transient errors in a short time; the session was closed.
    Tripped,
    /// The serving context was cancelled.
    Shutdown,
}

/// Multiplexed RPC server.
///
/// Every accepted connection becomes a server session with its own accept
/// loop; every sub-stream in it carries one RPC served by the handler. All of
/// these run as tracked tasks that [`Server::close`] waits for.
pub struct Server<H> {
    rpc: Arc<RpcServer<H>>,
    options: ServerOptions,
    active: AtomicBool,
    tracker: TaskTracker,
}

/// Holds the server's active flag for the duration of one `serve` call.
struct ActiveGuard<'a>(&'a AtomicBool);

impl<'a> ActiveGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| MuxRpcError::ServerActive)?;
        Ok(Self(flag))
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<H: Handler> Server<H> {
    pub fn new(handler: H) -> Self {
        Self::with_options(handler, ServerOptions::default())
    }

    pub fn with_options(handler: H, options: ServerOptions) -> Self {
        Self {
            rpc: Arc::new(RpcServer::with_max_message_size(
                handler,
                options.max_message_size,
            )),
            options,
            active: AtomicBool::new(false),
            tracker: TaskTracker::new(),
        }
    }

    pub fn handler(&self) -> &H {
        self.rpc.handler()
    }

    /// Accepts connections from `listener` until `ctx` is cancelled.
    ///
    /// Only one `serve` may run at a time; a concurrent call fails with
    /// [`MuxRpcError::ServerActive`]. A failure to accept a connection or to
    /// establish its session ends `serve` with that error. `ctx` is also the
    /// parent of every served RPC's context, and cancelling it closes every
    /// session. Use [`Server::serve_until`] to stop accepting without that.
    pub async fn serve<L: Listener>(&self, ctx: &CancellationToken, listener: L) -> Result<()> {
        self.serve_until(ctx, listener, future::pending()).await
    }

    /// Like [`Server::serve`], but also stops once `shutdown` completes.
    ///
    /// The listener is dropped and `serve_until` returns `Ok(())`, while
    /// established sessions keep serving. [`Server::close`] then waits for
    /// them to end.
    pub async fn serve_until<L, F>(
        &self,
        ctx: &CancellationToken,
        mut listener: L,
        shutdown: F,
    ) -> Result<()>
    where
        L: Listener,
        F: Future<Output = ()>,
    {
        let _active = ActiveGuard::acquire(&self.active)?;
        let mut shutdown = pin!(shutdown);
        tracing::info!("server listening");

        loop {
            let (io, addrs) = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    tracing::info!("server stopped accepting");
                    return Ok(());
                }
                _ = &mut shutdown => {
                    tracing::info!(tasks = self.tracker.len(), "listener closed, sessions keep serving");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed, stopping server");
                        return Err(e.into());
                    }
                },
            };

            self.serve_conn(ctx, io, addrs).await?;
        }
    }

    /// Establishes a server session over `io` and spawns its accept loop.
    pub async fn serve_conn<T>(&self, ctx: &CancellationToken, io: T, addrs: PeerAddrs) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let session = Session::server_with_addrs(io, self.options.session.clone(), addrs)
            .await
            .inspect_err(|e| tracing::error!(remote_addr = ?addrs.remote, error = %e, "session setup failed"))?;
        tracing::info!(remote_addr = ?addrs.remote, "session established");

        let ctx = ctx.clone();
        let rpc = Arc::clone(&self.rpc);
        let tracker = self.tracker.clone();
        let window = ErrorWindow::new(
            self.options.error_window_capacity,
            self.options.error_window_threshold,
        );
        self.tracker.spawn(async move {
            let end = handle_session(&session, &ctx, &tracker, &rpc, window).await;
            match end {
                SessionEnd::Tripped => {
                    tracing::warn!(remote_addr = ?addrs.remote, "session abandoned after repeated errors")
                }
                SessionEnd::PeerClosed | SessionEnd::Shutdown => {
                    tracing::info!(remote_addr = ?addrs.remote, ?end, "session ended")
                }
            }
            if let Err(e) = session.close_transport().await {
                tracing::debug!(remote_addr = ?addrs.remote, error = %e, "transport shutdown failed");
            }
        });
        Ok(())
    }

    /// Serves a single RPC over a raw, non-multiplexed stream.
    pub async fn serve_one<S>(&self, ctx: RequestContext, io: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.rpc.serve_one(ctx, io).await
    }

    /// Waits for every session loop and RPC task to finish.
    ///
    /// Fails with [`MuxRpcError::ListenerActive`] while `serve` is running;
    /// stop it first.
    pub async fn close(&self) -> Result<()> {
        if self.active.load(Ordering::Acquire) {
            return Err(MuxRpcError::ListenerActive);
        }
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl<H> fmt::Debug for Server<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("options", &self.options)
            .field("active", &self.active.load(Ordering::Acquire))
            .field("tasks", &self.tracker.len())
            .finish()
    }
}

/// Accepts sub-streams from `session` and serves one RPC on each, until the
/// session ends, trips its error window, or `ctx` is cancelled.
pub(crate) async fn handle_session<M, H>(
    session: &M,
    ctx: &CancellationToken,
    tracker: &TaskTracker,
    rpc: &Arc<RpcServer<H>>,
    mut window: ErrorWindow,
) -> SessionEnd
where
    M: MuxSession,
    H: Handler,
{
    loop {
        let accepted = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                if let Err(e) = session.close().await {
                    tracing::debug!(error = %e, "session close failed");
                }
                return SessionEnd::Shutdown;
            }
            accepted = session.accept() => accepted,
        };

        match accepted {
            Ok(Some(stream)) => {
                let req = RequestContext::new(ctx.child_token(), SubStream::peer_addrs(&stream));
                let rpc = Arc::clone(rpc);
                tracker.spawn(async move {
                    let remote_addr = req.remote_addr();
                    if let Err(e) = rpc.serve_one(req, stream).await {
                        tracing::debug!(?remote_addr, error = %e, "rpc ended with error");
                    }
                });
            }
            Ok(None) => return SessionEnd::PeerClosed,
            Err(e) if e.is_transient() => {
                if window.record(Instant::now()) {
                    tracing::warn!(error = %e, errors = window.len(), "error window tripped, closing session");
                    if let Err(e) = session.close().await {
                        tracing::debug!(error = %e, "session close failed");
                    }
                    return SessionEnd::Tripped;
                }
                tracing::debug!(error = %e, "transient accept error");
            }
            Err(e) => tracing::error!(error = %e, "unexpected accept error"),
        }
    }
}
