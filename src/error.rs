use std::io;
use thiserror::Error;

/// Convenient type alias for `Result<T, MuxRpcError>`.
pub type Result<T> = std::result::Result<T, MuxRpcError>;

/// Error types for the muxrpc library.
///
/// `MuxRpcError` covers the session framing layer, the per-stream RPC layer,
/// and the state errors reported by [`Conn`](crate::Conn) and
/// [`Server`](crate::Server).
#[derive(Debug, Error)]
pub enum MuxRpcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid protocol version: {0}")]
    InvalidProtocol(u8),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Session closed")]
    SessionClosed,

    #[error("Stream closed")]
    StreamClosed,

    #[error("Stream already exists: {0}")]
    StreamAlreadyExists(u32),

    #[error("Invalid stream ID: {0}")]
    InvalidStreamId(u32),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid frame format")]
    InvalidFrame,

    #[error("Keep-alive timeout")]
    KeepAliveTimeout,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("failed to open internal stream: {0}")]
    OpenStream(#[source] Box<MuxRpcError>),

    #[error("failed to close internal session: {0}")]
    CloseSession(#[source] Box<MuxRpcError>),

    #[error("failed to close internal connection: {0}")]
    CloseTransport(#[source] Box<MuxRpcError>),

    #[error("server is already active")]
    ServerActive,

    #[error("server listener is still active - close listener first")]
    ListenerActive,

    #[error("Operation canceled")]
    Canceled,

    #[error("Transport closed")]
    TransportClosed,

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("failed to dial proxy: {0}")]
    ProxyDial(#[source] io::Error),

    #[error("failed to send CONNECT request to proxy: {0}")]
    ProxyWrite(#[source] io::Error),

    #[error("failed to read response from proxy: {0}")]
    ProxyRead(#[source] io::Error),

    #[error("failed to connect to proxy server, status code: {0}")]
    ProxyStatus(u16),

    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),

    #[error("failed to perform TLS handshake: {0}")]
    TlsHandshake(#[source] io::Error),
}

impl MuxRpcError {
    /// Whether this error belongs to the family of network failures that
    /// tend to repeat while a session is flapping: connection resets, broken
    /// pipes and keep-alive timeouts.
    pub fn is_transient(&self) -> bool {
        match self {
            MuxRpcError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            MuxRpcError::KeepAliveTimeout => true,
            MuxRpcError::OpenStream(inner) => inner.is_transient(),
            _ => false,
        }
    }
}
