use super::{
    guarded,
    packet::{Packet, PacketCodec, PacketKind},
    stream::RpcStream,
};
use crate::{
    config::DEFAULT_MAX_MESSAGE_SIZE,
    error::{MuxRpcError, Result},
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::fmt;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Mutex,
};
use tokio_util::{
    codec::Framed,
    sync::{CancellationToken, WaitForCancellationFutureOwned},
};

/// Client side of the RPC protocol over one sub-stream.
///
/// A transport carries either one unary call or one stream. `close` may be
/// called from any task; in-flight operations then fail with
/// [`MuxRpcError::TransportClosed`].
pub struct Transport<S> {
    io: Mutex<Option<Framed<S, PacketCodec>>>,
    closed: CancellationToken,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    pub fn new(io: S) -> Self {
        Self::with_max_message_size(io, DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(io: S, max_message_size: usize) -> Self {
        Self {
            io: Mutex::new(Some(Framed::new(io, PacketCodec::new(max_message_size)))),
            closed: CancellationToken::new(),
        }
    }

    /// Performs a unary call: one request, one response.
    pub async fn invoke(&self, ctx: &CancellationToken, rpc: &str, request: Bytes) -> Result<Bytes> {
        let mut io = self.io.lock().await;
        let io = io.as_mut().ok_or(MuxRpcError::TransportClosed)?;
        guarded(ctx, &self.closed, unary(io, rpc, request)).await
    }

    /// Starts a streaming call. The transport hands its sub-stream over to
    /// the returned stream, whose context is a child of `ctx`.
    pub async fn new_stream(&self, ctx: &CancellationToken, rpc: &str) -> Result<RpcStream<S>> {
        let mut io = self
            .io
            .lock()
            .await
            .take()
            .ok_or(MuxRpcError::TransportClosed)?;
        guarded(ctx, &self.closed, io.send(Packet::invoke(rpc))).await?;
        Ok(RpcStream::new(io, ctx.child_token(), self.closed.clone()))
    }
}

impl<S> Transport<S> {
    /// Closes the transport. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
        // Release the sub-stream now unless a call is using it.
        if let Ok(mut io) = self.io.try_lock() {
            io.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the transport is closed. Not tied to `self`'s lifetime.
    pub fn closed(&self) -> WaitForCancellationFutureOwned {
        self.closed.clone().cancelled_owned()
    }
}

impl<S> fmt::Debug for Transport<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

async fn unary<S>(io: &mut Framed<S, PacketCodec>, rpc: &str, request: Bytes) -> Result<Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    io.feed(Packet::invoke(rpc)).await?;
    io.feed(Packet::message(request)).await?;
    io.send(Packet::close_send()).await?;

    let mut response = None;
    loop {
        let Some(packet) = io.next().await.transpose()? else {
            return response.ok_or(MuxRpcError::StreamClosed);
        };
        match packet.kind {
            PacketKind::Message if response.is_none() => response = Some(packet.data),
            PacketKind::Message => {
                return Err(MuxRpcError::ProtocolViolation(
                    "more than one response to a unary call".into(),
                ));
            }
            PacketKind::CloseSend | PacketKind::Close => {
                return response.ok_or_else(|| {
                    MuxRpcError::ProtocolViolation("unary call ended without a response".into())
                });
            }
            PacketKind::Error => {
                return Err(MuxRpcError::Remote(
                    String::from_utf8_lossy(&packet.data).into_owned(),
                ));
            }
            PacketKind::Invoke => {
                return Err(MuxRpcError::ProtocolViolation(
                    "invoke received by a client".into(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn server_side(io: DuplexStream) -> Framed<DuplexStream, PacketCodec> {
        Framed::new(io, PacketCodec::new(DEFAULT_MAX_MESSAGE_SIZE))
    }

    #[tokio::test]
    async fn test_invoke_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let transport = Transport::new(client);
        let mut server = server_side(server);

        let peer = tokio::spawn(async move {
            let invoke = server.next().await.unwrap().unwrap();
            assert_eq!(invoke, Packet::invoke("/echo"));
            let request = server.next().await.unwrap().unwrap();
            assert_eq!(server.next().await.unwrap().unwrap().kind, PacketKind::CloseSend);
            server.send(Packet::message(request.data)).await.unwrap();
            server.send(Packet::close()).await.unwrap();
        });

        let ctx = CancellationToken::new();
        let response = transport
            .invoke(&ctx, "/echo", Bytes::from("ping"))
            .await
            .unwrap();
        assert_eq!(response, "ping");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_invoke_reports_remote_error() {
        let (client, server) = tokio::io::duplex(4096);
        let transport = Transport::new(client);
        let mut server = server_side(server);

        tokio::spawn(async move {
            for _ in 0..3 {
                server.next().await.unwrap().unwrap();
            }
            server.send(Packet::error("no such rpc")).await.unwrap();
        });

        let ctx = CancellationToken::new();
        let err = transport
            .invoke(&ctx, "/missing", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MuxRpcError::Remote(ref msg) if msg == "no such rpc"));
    }

    #[tokio::test]
    async fn test_close_interrupts_pending_call() {
        let (client, _server) = tokio::io::duplex(4096);
        let transport = std::sync::Arc::new(Transport::new(client));
        let closed = transport.closed();

        let call = {
            let transport = transport.clone();
            tokio::spawn(async move {
                let ctx = CancellationToken::new();
                transport.invoke(&ctx, "/slow", Bytes::new()).await
            })
        };

        tokio::task::yield_now().await;
        transport.close();
        closed.await;

        assert!(matches!(
            call.await.unwrap(),
            Err(MuxRpcError::TransportClosed)
        ));
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_new_stream_takes_the_sub_stream() {
        let (client, server) = tokio::io::duplex(4096);
        let transport = Transport::new(client);
        let mut server = server_side(server);

        let ctx = CancellationToken::new();
        let stream = transport.new_stream(&ctx, "/chat").await.unwrap();
        assert_eq!(server.next().await.unwrap().unwrap(), Packet::invoke("/chat"));

        // The sub-stream now belongs to the stream
        assert!(matches!(
            transport.new_stream(&ctx, "/again").await,
            Err(MuxRpcError::TransportClosed)
        ));

        // The stream context derives from the caller's
        ctx.cancel();
        assert!(stream.context().is_cancelled());
    }
}
