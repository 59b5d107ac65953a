use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// Addresses of the raw connection a session (and so every sub-stream in it)
/// runs over. Either side may be unknown, e.g. for in-memory pipes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerAddrs {
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
}

impl PeerAddrs {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            local: Some(local),
            remote: Some(remote),
        }
    }
}

/// A source of raw connections for [`Server::serve`](crate::Server::serve).
pub trait Listener: Send {
    type Io: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static;

    /// Waits for the next connection. An error here ends `serve`.
    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Io, PeerAddrs)>> + Send;
}

impl Listener for tokio::net::TcpListener {
    type Io = tokio::net::TcpStream;

    async fn accept(&mut self) -> io::Result<(Self::Io, PeerAddrs)> {
        let (stream, remote) = tokio::net::TcpListener::accept(self).await?;
        let addrs = PeerAddrs {
            local: stream.local_addr().ok(),
            remote: Some(remote),
        };
        Ok((stream, addrs))
    }
}

#[cfg(unix)]
impl Listener for tokio::net::UnixListener {
    type Io = tokio::net::UnixStream;

    async fn accept(&mut self) -> io::Result<(Self::Io, PeerAddrs)> {
        let (stream, _) = tokio::net::UnixListener::accept(self).await?;
        Ok((stream, PeerAddrs::default()))
    }
}
