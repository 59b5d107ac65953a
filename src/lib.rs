//! Many concurrent RPCs over one connection.
//!
//! A [`Conn`] runs a client [`Session`] over any byte stream and opens one
//! sub-stream per call. A [`Server`] accepts connections from a [`Listener`],
//! runs a server session on each and serves every incoming sub-stream with its
//! [`Handler`].

pub mod codec;
pub mod config;
pub mod conn;
pub mod error;
pub mod error_window;
pub mod frame;
pub mod listener;
pub mod proxy;
pub mod rpc;
pub mod server;
pub mod session;
pub mod stream;
pub mod stream_id;

pub use codec::FrameCodec;
pub use config::{ClientOptions, Config, ConfigBuilder, ServerOptions, ServerOptionsBuilder};
pub use conn::Conn;
pub use error::{MuxRpcError, Result};
pub use error_window::ErrorWindow;
pub use frame::{Command, Frame, HEADER_SIZE};
pub use listener::{Listener, PeerAddrs};
pub use proxy::dial_tls_proxy;
pub use rpc::{Encoding, Handler, RawEncoding, RequestContext, RpcStream, ServerStream};
pub use server::{Server, SessionEnd};
pub use session::{MuxSession, Session, SubStream};
pub use stream::{Stream, StreamCloser};
pub use stream_id::StreamIdGenerator;
pub use tokio_util::sync::CancellationToken;
