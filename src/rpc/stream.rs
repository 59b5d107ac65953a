use super::{
    encoding::Encoding,
    guarded,
    packet::{Packet, PacketCodec, PacketKind},
};
use crate::error::{MuxRpcError, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::{codec::Framed, sync::CancellationToken};

/// One streaming RPC over a dedicated sub-stream.
///
/// Every operation fails with [`MuxRpcError::Canceled`] once the stream's
/// context is cancelled and with [`MuxRpcError::TransportClosed`] once the
/// owning transport is closed. The context is cancelled when the RPC finishes
/// (peer `CLOSE`/`ERROR`, [`RpcStream::close`]) or the stream is dropped.
pub struct RpcStream<S> {
    io: Framed<S, PacketCodec>,
    ctx: CancellationToken,
    transport_closed: CancellationToken,
    send_closed: bool,
    recv_closed: bool,
}

impl<S> RpcStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(
        io: Framed<S, PacketCodec>,
        ctx: CancellationToken,
        transport_closed: CancellationToken,
    ) -> Self {
        Self {
            io,
            ctx,
            transport_closed,
            send_closed: false,
            recv_closed: false,
        }
    }

    /// The stream's context; cancelled when the RPC ends.
    pub fn context(&self) -> &CancellationToken {
        &self.ctx
    }

    pub async fn send(&mut self, msg: Bytes) -> Result<()> {
        if self.send_closed {
            return Err(MuxRpcError::StreamClosed);
        }
        self.write(Packet::message(msg)).await
    }

    pub async fn send_msg<M, E: Encoding<M>>(&mut self, enc: &E, msg: &M) -> Result<()> {
        let bytes = enc.marshal(msg)?;
        self.send(bytes).await
    }

    /// Next message from the peer, or `None` once it stopped sending.
    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        if self.recv_closed {
            return Ok(None);
        }

        let Self {
            io,
            ctx,
            transport_closed,
            ..
        } = self;
        let next = guarded(ctx, transport_closed, async { io.next().await.transpose() }).await?;

        let Some(packet) = next else {
            self.finish();
            return Err(MuxRpcError::StreamClosed);
        };

        match packet.kind {
            PacketKind::Message => Ok(Some(packet.data)),
            PacketKind::CloseSend => {
                self.recv_closed = true;
                Ok(None)
            }
            PacketKind::Close => {
                self.recv_closed = true;
                self.finish();
                Ok(None)
            }
            PacketKind::Error => {
                self.recv_closed = true;
                self.finish();
                Err(MuxRpcError::Remote(
                    String::from_utf8_lossy(&packet.data).into_owned(),
                ))
            }
            PacketKind::Invoke => Err(MuxRpcError::ProtocolViolation(
                "invoke received inside an rpc".into(),
            )),
        }
    }

    pub async fn recv_msg<M, E: Encoding<M>>(&mut self, enc: &E) -> Result<Option<M>> {
        match self.recv().await? {
            Some(bytes) => enc.unmarshal(bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Tells the peer no more messages follow. Receiving still works.
    pub async fn close_send(&mut self) -> Result<()> {
        if self.send_closed {
            return Ok(());
        }
        self.send_closed = true;
        self.write(Packet::close_send()).await
    }

    /// Ends the RPC for both directions.
    pub async fn close(&mut self) -> Result<()> {
        if self.ctx.is_cancelled() {
            return Ok(());
        }
        self.send_closed = true;
        let result = self.write(Packet::close()).await;
        self.finish();
        result
    }

    pub(crate) async fn send_error(&mut self, description: &str) -> Result<()> {
        self.send_closed = true;
        let result = self.write(Packet::error(description)).await;
        self.finish();
        result
    }

    async fn write(&mut self, packet: Packet) -> Result<()> {
        let Self {
            io,
            ctx,
            transport_closed,
            ..
        } = self;
        guarded(ctx, transport_closed, io.send(packet)).await
    }

    fn finish(&self) {
        self.ctx.cancel();
    }
}

impl<S> Drop for RpcStream<S> {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}

impl<S> fmt::Debug for RpcStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcStream")
            .field("send_closed", &self.send_closed)
            .field("recv_closed", &self.recv_closed)
            .field("done", &self.ctx.is_cancelled())
            .finish()
    }
}
