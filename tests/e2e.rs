use bytes::Bytes;
use futures::future::BoxFuture;
use muxrpc::{
    CancellationToken, Conn, Handler, Listener, MuxRpcError, PeerAddrs, RawEncoding,
    RequestContext, Server, ServerStream,
};
use std::{io, sync::Arc, time::Duration};
use tokio::{
    io::DuplexStream,
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

/// Helper macro to add timeout to tests
macro_rules! test_with_timeout {
    ($test_name:ident, $timeout_secs:expr, $test_body:block) => {
        #[tokio::test]
        async fn $test_name() {
            let result = tokio::time::timeout(
                Duration::from_secs($timeout_secs),
                async move $test_body
            ).await;

            match result {
                Ok(Ok(())) => {},
                Ok(Err(e)) => panic!("Test failed: {:?}", e),
                Err(_) => panic!("Test timed out after {} seconds", $timeout_secs),
            }
        }
    };
}

struct EchoHandler;

impl Handler for EchoHandler {
    fn handle<'a>(
        &'a self,
        ctx: RequestContext,
        rpc: &'a str,
        stream: &'a mut ServerStream,
    ) -> BoxFuture<'a, muxrpc::Result<()>> {
        Box::pin(async move {
            match rpc {
                "/echo" => {
                    while let Some(msg) = stream.recv().await? {
                        stream.send(msg).await?;
                    }
                    Ok(())
                }
                "/peer" => {
                    stream.recv().await?;
                    let addr = ctx.remote_addr().map(|a| a.to_string()).unwrap_or_default();
                    stream.send(Bytes::from(addr)).await
                }
                other => Err(MuxRpcError::Remote(format!("unknown rpc {other}"))),
            }
        })
    }
}

/// A listener fed through a channel. Dropping the sender closes it: the next
/// accept fails, as a closed socket listener would.
struct ChannelListener(mpsc::Receiver<DuplexStream>);

impl Listener for ChannelListener {
    type Io = DuplexStream;

    async fn accept(&mut self) -> io::Result<(DuplexStream, PeerAddrs)> {
        match self.0.recv().await {
            Some(io) => Ok((io, PeerAddrs::default())),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed")),
        }
    }
}

async fn spawn_server(
    server: &Arc<Server<EchoHandler>>,
    ctx: &CancellationToken,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<muxrpc::Result<()>>), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn({
        let server = Arc::clone(server);
        let ctx = ctx.clone();
        async move { server.serve(&ctx, listener).await }
    });
    while !server.is_active() {
        tokio::task::yield_now().await;
    }
    Ok((addr, handle))
}

test_with_timeout!(test_e2e_unary_over_tcp, 30, {
    let server = Arc::new(Server::new(EchoHandler));
    let ctx = CancellationToken::new();
    let (addr, serving) = spawn_server(&server, &ctx).await?;

    let socket = TcpStream::connect(addr).await?;
    let client_addr = socket.local_addr()?;
    let conn = Conn::new(socket).await?;

    let call = CancellationToken::new();
    let payload = Bytes::from(vec![7u8; 256 * 1024]);
    let reply: Bytes = conn.invoke(&call, "/echo", &RawEncoding, &payload).await?;
    assert_eq!(reply, payload);

    let peer: String = conn
        .invoke(&call, "/peer", &RawEncoding, &String::new())
        .await?;
    assert_eq!(peer, client_addr.to_string());
    assert_eq!(conn.session().num_streams(), 0);

    conn.close().await?;
    ctx.cancel();
    serving.await??;
    server.close().await?;
    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_e2e_many_connections, 30, {
    let server = Arc::new(Server::new(EchoHandler));
    let ctx = CancellationToken::new();
    let (addr, serving) = spawn_server(&server, &ctx).await?;

    let mut clients = Vec::new();
    for c in 0..4 {
        clients.push(tokio::spawn(async move {
            let conn = Conn::new(TcpStream::connect(addr).await?).await?;
            let call = CancellationToken::new();

            let mut stream = conn.new_stream(&call, "/echo").await?;
            for i in 0..20 {
                let msg = Bytes::from(format!("conn {c} message {i}"));
                stream.send(msg.clone()).await?;
                assert_eq!(stream.recv().await?, Some(msg));
            }
            stream.close_send().await?;
            assert_eq!(stream.recv().await?, None);

            conn.close().await
        }));
    }
    for client in clients {
        client.await??;
    }

    ctx.cancel();
    serving.await??;
    server.close().await?;
    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_e2e_second_serve_is_rejected, 30, {
    let server = Arc::new(Server::new(EchoHandler));
    let ctx = CancellationToken::new();
    let (addr, serving) = spawn_server(&server, &ctx).await?;

    let other = TcpListener::bind("127.0.0.1:0").await?;
    let err = server.serve(&ctx, other).await.unwrap_err();
    assert!(matches!(err, MuxRpcError::ServerActive));

    // The running serve is unaffected
    let conn = Conn::new(TcpStream::connect(addr).await?).await?;
    let call = CancellationToken::new();
    let reply: String = conn
        .invoke(&call, "/echo", &RawEncoding, &"still serving".to_string())
        .await?;
    assert_eq!(reply, "still serving");

    assert!(matches!(server.close().await, Err(MuxRpcError::ListenerActive)));

    conn.close().await?;
    ctx.cancel();
    serving.await??;
    assert!(!server.is_active());
    server.close().await?;
    server.close().await?;
    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_e2e_cancel_stream_then_close, 30, {
    let server = Arc::new(Server::new(EchoHandler));
    let ctx = CancellationToken::new();
    let (addr, serving) = spawn_server(&server, &ctx).await?;

    let conn = Conn::new(TcpStream::connect(addr).await?).await?;
    let call = CancellationToken::new();
    let mut stream = conn.new_stream(&call, "/echo").await?;
    for i in 0..5 {
        let msg = Bytes::from(format!("before cancel {i}"));
        stream.send(msg.clone()).await?;
        assert_eq!(stream.recv().await?, Some(msg));
    }

    call.cancel();
    assert!(matches!(
        stream.send(Bytes::from("after cancel")).await,
        Err(MuxRpcError::Canceled)
    ));

    let released = async {
        while conn.session().num_streams() != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), released).await?;

    tokio::time::timeout(Duration::from_secs(5), conn.close()).await??;
    ctx.cancel();
    serving.await??;
    server.close().await?;
    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_e2e_closed_listener_ends_serve, 30, {
    let server = Arc::new(Server::new(EchoHandler));
    let ctx = CancellationToken::new();
    let (tx, rx) = mpsc::channel(4);

    let serving = tokio::spawn({
        let server = Arc::clone(&server);
        let ctx = ctx.clone();
        async move { server.serve(&ctx, ChannelListener(rx)).await }
    });

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    tx.send(server_io).await?;
    let conn = Conn::new(client_io).await?;
    let call = CancellationToken::new();
    let mut stream = conn.new_stream(&call, "/echo").await?;
    stream.send(Bytes::from("ping")).await?;
    assert_eq!(stream.recv().await?, Some(Bytes::from("ping")));

    while !server.is_active() {
        tokio::task::yield_now().await;
    }
    assert!(matches!(server.close().await, Err(MuxRpcError::ListenerActive)));

    // Closing the listener is fatal to serve
    drop(tx);
    let err = serving.await?.unwrap_err();
    assert!(matches!(err, MuxRpcError::Io(ref e) if e.kind() == io::ErrorKind::NotConnected));

    // The session outlives serve; close waits for it once the client is gone
    stream.close_send().await?;
    assert_eq!(stream.recv().await?, None);
    conn.close().await?;
    server.close().await?;
    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_e2e_stopped_listener_drains_sessions, 30, {
    let server = Arc::new(Server::new(EchoHandler));
    let ctx = CancellationToken::new();
    let stop = CancellationToken::new();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let serving = tokio::spawn({
        let server = Arc::clone(&server);
        let ctx = ctx.clone();
        let stop = stop.clone();
        async move { server.serve_until(&ctx, listener, stop.cancelled_owned()).await }
    });

    let conn = Conn::new(TcpStream::connect(addr).await?).await?;
    let call = CancellationToken::new();
    let mut stream = conn.new_stream(&call, "/echo").await?;
    stream.send(Bytes::from("before stop")).await?;
    assert_eq!(stream.recv().await?, Some(Bytes::from("before stop")));

    // Stopping the listener ends serve but leaves the session alone
    stop.cancel();
    serving.await??;
    assert!(!server.is_active());
    assert!(TcpStream::connect(addr).await.is_err());

    let closing = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.close().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!closing.is_finished());

    for i in 0..5 {
        let msg = Bytes::from(format!("after stop {i}"));
        stream.send(msg.clone()).await?;
        assert_eq!(stream.recv().await?, Some(msg));
    }
    stream.close_send().await?;
    assert_eq!(stream.recv().await?, None);
    assert!(!ctx.is_cancelled());
    assert!(!closing.is_finished());

    // Close returns once the client has gone
    conn.close().await?;
    closing.await??;
    Ok::<(), Box<dyn std::error::Error>>(())
});
