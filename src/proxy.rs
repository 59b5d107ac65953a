//! TLS through an HTTP `CONNECT` proxy.

use crate::error::{MuxRpcError, Result};
use rustls::pki_types::ServerName;
use std::{io, sync::Arc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{TlsConnector, client::TlsStream};

/// Upper bound on the proxy's response head.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Opens a TLS connection to `target` (`host:port`) tunnelled through the
/// HTTP proxy at `proxy_addr`.
///
/// The TLS server name is the host part of `target`. On any failure the
/// partially established connection is dropped and the error names the stage
/// that failed.
pub async fn dial_tls_proxy(
    target: &str,
    proxy_addr: &str,
    tls_config: Arc<rustls::ClientConfig>,
) -> Result<TlsStream<TcpStream>> {
    let mut tcp = TcpStream::connect(proxy_addr)
        .await
        .map_err(MuxRpcError::ProxyDial)?;

    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    tcp.write_all(request.as_bytes())
        .await
        .map_err(MuxRpcError::ProxyWrite)?;

    // Unbuffered: a BufReader could swallow the first bytes of the TLS
    // handshake that follow the head.
    let head = read_response_head(&mut tcp)
        .await
        .map_err(MuxRpcError::ProxyRead)?;
    let status = parse_status(&head).map_err(MuxRpcError::ProxyRead)?;
    if status != 200 {
        tracing::debug!(proxy = %proxy_addr, connect_target = %target, status, "proxy refused CONNECT");
        return Err(MuxRpcError::ProxyStatus(status));
    }

    let host = host_of(target);
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| MuxRpcError::InvalidServerName(host.to_string()))?;

    TlsConnector::from(tls_config)
        .connect(server_name, tcp)
        .await
        .map_err(MuxRpcError::TlsHandshake)
}

/// Reads up to and including the blank line ending the response head.
///
/// Reads one byte at a time so no tunnelled bytes are consumed.
async fn read_response_head(tcp: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(256);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "proxy response head too large",
            ));
        }
        head.push(tcp.read_u8().await?);
    }
    Ok(head)
}

fn parse_status(head: &[u8]) -> io::Result<u16> {
    let malformed = || io::Error::new(io::ErrorKind::InvalidData, "malformed proxy response");

    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(malformed)?;
    let line = std::str::from_utf8(&head[..line_end]).map_err(|_| malformed())?;

    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/1.") => {
            code.parse().map_err(|_| malformed())
        }
        _ => Err(malformed()),
    }
}

/// `host:port` to `host`, unwrapping bracketed IPv6 literals.
fn host_of(target: &str) -> &str {
    if let Some(rest) = target.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match target.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => target,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn tls_config() -> Arc<rustls::ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        Arc::new(config)
    }

    /// A one-shot proxy that checks the CONNECT request and answers with
    /// `response`, then closes.
    async fn fake_proxy(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let head = read_response_head(&mut socket).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8(head).unwrap()
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_rejected_connect() {
        let (proxy, handle) = fake_proxy("HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n").await;

        let err = dial_tls_proxy("example.com:443", &proxy, tls_config())
            .await
            .unwrap_err();
        assert!(matches!(err, MuxRpcError::ProxyStatus(403)));

        let request = handle.await.unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("Host: example.com:443\r\n"));
    }

    #[tokio::test]
    async fn test_unreachable_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = dial_tls_proxy("example.com:443", &addr, tls_config())
            .await
            .unwrap_err();
        assert!(matches!(err, MuxRpcError::ProxyDial(_)));
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let (proxy, _handle) = fake_proxy("SSH-2.0-OpenSSH\r\n\r\n").await;
        let err = dial_tls_proxy("example.com:443", &proxy, tls_config())
            .await
            .unwrap_err();
        assert!(matches!(err, MuxRpcError::ProxyRead(_)));
    }

    #[tokio::test]
    async fn test_handshake_failure_after_tunnel() {
        let (proxy, _handle) = fake_proxy("HTTP/1.1 200 Connection established\r\n\r\n").await;
        let err = dial_tls_proxy("example.com:443", &proxy, tls_config())
            .await
            .unwrap_err();
        assert!(matches!(err, MuxRpcError::TlsHandshake(_)));
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("example.com:443"), "example.com");
        assert_eq!(host_of("example.com"), "example.com");
        assert_eq!(host_of("10.1.2.3:8443"), "10.1.2.3");
        assert_eq!(host_of("[::1]:443"), "::1");
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status(b"HTTP/1.0 200 OK\r\n\r\n").unwrap(), 200);
        assert_eq!(parse_status(b"HTTP/1.1 407 Proxy Auth\r\n\r\n").unwrap(), 407);
        assert!(parse_status(b"HTTP/1.1 abc\r\n\r\n").is_err());
        assert!(parse_status(b"nonsense").is_err());
    }
}
