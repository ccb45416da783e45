//! Dialing primitives for the APNs provider client: a direct TCP dialer and
//! an HTTP CONNECT proxy tunnel, both behind a single [`Dialer`] trait so
//! the TLS/HTTP2 layer above does not need to know which path was used.

use std::fmt;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

/// A host/port pair. Used both for the ultimate target (APNs) and for an
/// optional HTTP proxy in front of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Marker trait for a boxed duplex byte stream, implemented for anything
/// that is already `AsyncRead + AsyncWrite + Unpin + Send`.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

impl fmt::Debug for dyn AsyncReadWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BoxedStream")
    }
}

pub type BoxedStream = Box<dyn AsyncReadWrite>;

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    /// Could not open a TCP connection directly to the target.
    #[error("cannot connect to target server: {0}")]
    Connect(#[source] std::io::Error),

    /// Could not establish an HTTP CONNECT tunnel through the configured
    /// proxy. Message prefix is part of the crate's external contract:
    /// callers match on `"cannot connect to proxy server"`.
    #[error("cannot connect to proxy server: {0}")]
    ProxyConnect(#[source] ProxyConnectCause),
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyConnectCause {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("proxy responded with status {0}")]
    BadStatus(u16),

    #[error("malformed CONNECT response: {0}")]
    Malformed(String),
}

/// Establishes a duplex stream to a target endpoint, directly or through a
/// tunnel. Implementations must not perform TLS; that is layered on top by
/// the caller once a plaintext duplex stream is available.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &Endpoint) -> Result<BoxedStream, DialError>;
}

/// Dials the target directly over TCP, with no intermediary.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectDialer;

#[async_trait::async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, target: &Endpoint) -> Result<BoxedStream, DialError> {
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(DialError::Connect)?;
        tracing::debug!(%target, "dialed target directly");
        Ok(Box::new(stream))
    }
}

/// Wraps an inner [`Dialer`] used to reach the proxy itself, and tunnels to
/// the real target through an HTTP CONNECT request over that connection.
pub struct HttpConnectDialer<D> {
    inner: D,
    proxy: Endpoint,
}

impl<D> HttpConnectDialer<D> {
    pub fn new(inner: D, proxy: Endpoint) -> Self {
        Self { inner, proxy }
    }
}

#[async_trait::async_trait]
impl<D> Dialer for HttpConnectDialer<D>
where
    D: Dialer,
{
    async fn dial(&self, target: &Endpoint) -> Result<BoxedStream, DialError> {
        let stream = self.inner.dial(&self.proxy).await.map_err(|e| match e {
            // The inner dialer already speaks in terms of "target server";
            // from our caller's perspective that target *is* the proxy.
            DialError::Connect(io) => DialError::ProxyConnect(ProxyConnectCause::Io(io)),
            other => other,
        })?;

        let tunneled = connect_tunnel(stream, target)
            .await
            .map_err(DialError::ProxyConnect)?;

        tracing::debug!(proxy = %self.proxy, %target, "established CONNECT tunnel");
        Ok(Box::new(tunneled))
    }
}

async fn connect_tunnel(
    stream: BoxedStream,
    target: &Endpoint,
) -> Result<BufStream<BoxedStream>, ProxyConnectCause> {
    let mut buffered = BufStream::new(stream);

    let request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nConnection: Keep-Alive\r\n\r\n",
        authority = target.authority()
    );
    buffered.write_all(request.as_bytes()).await?;
    buffered.flush().await?;

    let mut status_line = String::new();
    buffered.read_line(&mut status_line).await?;
    let status = parse_status_line(&status_line)?;

    // Drain the rest of the header block.
    loop {
        let mut line = String::new();
        let n = buffered.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    if !(200..300).contains(&status) {
        return Err(ProxyConnectCause::BadStatus(status));
    }

    Ok(buffered)
}

fn parse_status_line(line: &str) -> Result<u16, ProxyConnectCause> {
    let status = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| ProxyConnectCause::Malformed(line.trim().to_string()))?;
    status
        .parse::<u16>()
        .map_err(|_| ProxyConnectCause::Malformed(line.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn direct_dialer_connects_to_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hello").await.unwrap();
        });

        let dialer = DirectDialer;
        let mut stream = dialer
            .dial(&Endpoint::new(addr.ip().to_string(), addr.port()))
            .await
            .unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        accept.await.unwrap();
    }

    #[tokio::test]
    async fn direct_dialer_surfaces_connect_error() {
        let dialer = DirectDialer;
        // Port 0 on connect is not connectable; exercise the error path via
        // a closed listener instead for a stable, fast failure.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = dialer
            .dial(&Endpoint::new(addr.ip().to_string(), addr.port()))
            .await
            .unwrap_err();

        assert!(matches!(err, DialError::Connect(_)));
    }

    #[tokio::test]
    async fn http_connect_dialer_succeeds_on_200() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).starts_with("CONNECT "));
            socket
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .unwrap();
            socket.write_all(b"post-tunnel-bytes").await.unwrap();
        });

        let proxy = Endpoint::new(addr.ip().to_string(), addr.port());
        let dialer = HttpConnectDialer::new(DirectDialer, proxy);
        let mut stream = dialer
            .dial(&Endpoint::new("api.push.apple.com", 443))
            .await
            .unwrap();

        let mut buf = [0u8; "post-tunnel-bytes".len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"post-tunnel-bytes");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn http_connect_dialer_fails_on_non_2xx_with_descriptive_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let proxy = Endpoint::new(addr.ip().to_string(), addr.port());
        let dialer = HttpConnectDialer::new(DirectDialer, proxy);
        let err = dialer
            .dial(&Endpoint::new("api.push.apple.com", 443))
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("cannot connect to proxy server"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn http_connect_dialer_wraps_underlying_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let proxy = Endpoint::new(addr.ip().to_string(), addr.port());
        let dialer = HttpConnectDialer::new(DirectDialer, proxy);
        let err = dialer
            .dial(&Endpoint::new("api.push.apple.com", 443))
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("cannot connect to proxy server"));
        assert!(matches!(err, DialError::ProxyConnect(ProxyConnectCause::Io(_))));
    }
}
