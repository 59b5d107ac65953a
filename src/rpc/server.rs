use super::{
    guarded,
    packet::{PacketCodec, PacketKind},
    stream::RpcStream,
};
use crate::{
    config::DEFAULT_MAX_MESSAGE_SIZE,
    error::{MuxRpcError, Result},
    listener::PeerAddrs,
};
use futures::{StreamExt, future::BoxFuture};
use std::{net::SocketAddr, sync::Arc};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::{codec::Framed, sync::CancellationToken};

/// Any byte stream an RPC can be served over.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

/// The stream handed to a [`Handler`].
pub type ServerStream = RpcStream<Box<dyn AsyncIo>>;

/// Per-RPC context: cancellation plus the addresses of the connection the
/// RPC arrived on.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    addrs: PeerAddrs,
}

impl RequestContext {
    pub fn new(cancel: CancellationToken, addrs: PeerAddrs) -> Self {
        Self { cancel, addrs }
    }

    /// Cancelled when the server shuts down or the RPC ends.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.addrs.remote
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addrs.local
    }

    pub fn addrs(&self) -> PeerAddrs {
        self.addrs
    }
}

/// Serves RPCs. Returning `Err` sends an `ERROR` packet to the caller.
pub trait Handler: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        ctx: RequestContext,
        rpc: &'a str,
        stream: &'a mut ServerStream,
    ) -> BoxFuture<'a, Result<()>>;
}

impl<H: Handler> Handler for Arc<H> {
    fn handle<'a>(
        &'a self,
        ctx: RequestContext,
        rpc: &'a str,
        stream: &'a mut ServerStream,
    ) -> BoxFuture<'a, Result<()>> {
        (**self).handle(ctx, rpc, stream)
    }
}

/// Reads the `INVOKE` on a sub-stream and dispatches it to the handler.
#[derive(Debug)]
pub struct RpcServer<H> {
    handler: H,
    max_message_size: usize,
}

impl<H: Handler> RpcServer<H> {
    pub fn new(handler: H) -> Self {
        Self::with_max_message_size(handler, DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(handler: H, max_message_size: usize) -> Self {
        Self {
            handler,
            max_message_size,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Serves the single RPC carried by `io`.
    ///
    /// A peer that goes away before invoking anything is not an error.
    pub async fn serve_one<S>(&self, ctx: RequestContext, io: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let io: Box<dyn AsyncIo> = Box::new(io);
        let mut framed = Framed::new(io, PacketCodec::new(self.max_message_size));

        let never = CancellationToken::new();
        let first = guarded(&ctx.cancel, &never, async {
            framed.next().await.transpose()
        })
        .await?;

        let rpc = match first {
            None => return Ok(()),
            Some(packet) if packet.kind == PacketKind::Invoke => String::from_utf8(packet.data.to_vec())
                .map_err(|_| MuxRpcError::ProtocolViolation("rpc name is not UTF-8".into()))?,
            Some(packet) => {
                return Err(MuxRpcError::ProtocolViolation(format!(
                    "expected invoke, got {:?}",
                    packet.kind
                )));
            }
        };

        let rpc_ctx = RequestContext::new(ctx.cancel.child_token(), ctx.addrs);
        let mut stream = RpcStream::new(framed, rpc_ctx.cancel.clone(), never);

        tracing::debug!(rpc = %rpc, remote_addr = ?ctx.addrs.remote, "serving rpc");
        match self.handler.handle(rpc_ctx, &rpc, &mut stream).await {
            Ok(()) => stream.close().await,
            Err(e) => {
                tracing::debug!(rpc = %rpc, error = %e, "rpc handler failed");
                if let Err(send_err) = stream.send_error(&e.to_string()).await {
                    tracing::debug!(rpc = %rpc, error = %send_err, "failed to report rpc error");
                }
                Err(e)
            }
        }
    }
}
