//! RPC protocol spoken over a single multiplexed sub-stream.
//!
//! Each RPC owns one sub-stream. The client sends `INVOKE(name)`, then any
//! number of `MESSAGE`s and a `CLOSE_SEND`. The server answers with
//! `MESSAGE`s and ends the RPC with `CLOSE`, or with `ERROR` if the handler
//! failed.

mod encoding;
mod packet;
mod server;
mod stream;
mod transport;

pub use encoding::{Encoding, RawEncoding};
pub use packet::{PACKET_HEADER_SIZE, Packet, PacketCodec, PacketKind};
pub use server::{AsyncIo, Handler, RequestContext, RpcServer, ServerStream};
pub use stream::RpcStream;
pub use transport::Transport;

use crate::error::{MuxRpcError, Result};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Runs `fut` unless `ctx` is cancelled or `closed` fires first.
pub(crate) async fn guarded<T>(
    ctx: &CancellationToken,
    closed: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(MuxRpcError::Canceled),
        _ = closed.cancelled() => Err(MuxRpcError::TransportClosed),
        result = fut => result,
    }
}
