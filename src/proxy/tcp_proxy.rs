//! TCP proxy implementation.
//!
//! Provides upstream dialing and bidirectional data transfer with half-close.

use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Copy buffer size per direction.
const BUFFER_SIZE: usize = 16 * 1024;

/// Idle time before the first keep-alive probe.
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// A byte stream the splicer can relay, plain or TLS.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased stream so plain and TLS legs share one copy path.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Outcome of one copy direction.
#[derive(Debug)]
pub struct HalfResult {
    /// Bytes written to the destination, including those before any error.
    pub bytes: u64,
    /// Time from the start of the copy until the destination was shut down.
    pub duration: Duration,
    pub error: Option<io::Error>,
}

/// Result of a proxy operation.
#[derive(Debug)]
pub struct ProxyResult {
    /// Bytes sent from client to upstream.
    pub bytes_to_upstream: u64,
    /// Bytes sent from upstream to client.
    pub bytes_to_client: u64,
    /// Error that ended the client to upstream direction.
    pub upstream_error: Option<io::Error>,
    /// Error that ended the upstream to client direction.
    pub client_error: Option<io::Error>,
}

impl ProxyResult {
    pub fn is_clean(&self) -> bool {
        self.upstream_error.is_none() && self.client_error.is_none()
    }
}

/// Splice error.
#[derive(Debug, thiserror::Error)]
pub enum SpliceError {
    #[error("failed to connect to upstream {authority}: {source}")]
    ConnectFailed { authority: String, source: io::Error },

    #[error("connection timeout to upstream {authority} after {timeout:?}")]
    ConnectTimeout { authority: String, timeout: Duration },

    #[error("TLS handshake with {peer} failed: {source}")]
    Handshake { peer: String, source: io::Error },
}

/// Render `address:port`, bracketing IPv6 literals.
pub fn upstream_authority(address: &str, port: u16) -> String {
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, port),
        _ => format!("{}:{}", address, port),
    }
}

/// Enable `TCP_NODELAY` and keep-alive. Failures only cost latency, so they are logged.
pub fn tune_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "failed to set TCP_NODELAY");
    }

    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "failed to enable TCP keep-alive");
    }
}

/// Connect to an upstream API server with timeout.
#[instrument(skip_all, fields(upstream = %address))]
pub async fn connect_upstream(
    address: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, SpliceError> {
    debug!("connecting to upstream");

    match timeout(connect_timeout, TcpStream::connect((address, port))).await {
        Ok(Ok(stream)) => {
            debug!("connected to upstream");
            tune_socket(&stream);
            Ok(stream)
        }
        Ok(Err(source)) => Err(SpliceError::ConnectFailed {
            authority: upstream_authority(address, port),
            source,
        }),
        Err(_) => Err(SpliceError::ConnectTimeout {
            authority: upstream_authority(address, port),
            timeout: connect_timeout,
        }),
    }
}

/// Copy `reader` into `writer` until EOF or error, then shut down `writer`.
///
/// With `idle_timeout` set, a read that waits longer than that ends the copy
/// with `TimedOut`.
pub async fn copy_half<R, W>(reader: &mut R, writer: &mut W, idle_timeout: Option<Duration>) -> HalfResult
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let start = Instant::now();
    let mut bytes = 0u64;
    let mut buf = vec![0u8; BUFFER_SIZE];

    let error = loop {
        let read = match idle_timeout {
            Some(limit) => match timeout(limit, reader.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => break Some(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            },
            None => reader.read(&mut buf).await,
        };

        match read {
            Ok(0) => break None,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    break Some(e);
                }
                bytes += n as u64;
            }
            Err(e) => break Some(e),
        }
    };

    // Propagate the half-close; the peer may already be gone.
    let shutdown = writer.shutdown().await;
    let error = match (error, shutdown) {
        (Some(e), _) => Some(e),
        (None, Err(e)) if e.kind() != io::ErrorKind::NotConnected => Some(e),
        (None, _) => None,
    };

    HalfResult {
        bytes,
        duration: start.elapsed(),
        error,
    }
}

/// Proxy data bidirectionally between two streams.
///
/// Each direction half-closes its destination when its source ends, and the
/// call returns once both directions are done.
#[instrument(skip_all)]
pub async fn proxy_bidirectional<C, U>(client: C, upstream: U, idle_timeout: Option<Duration>) -> ProxyResult
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = copy_half(&mut client_read, &mut upstream_write, idle_timeout);
    let upstream_to_client = copy_half(&mut upstream_read, &mut client_write, idle_timeout);

    let (up, down) = tokio::join!(client_to_upstream, upstream_to_client);

    debug!(
        bytes = up.bytes,
        duration_ms = up.duration.as_millis() as u64,
        error = up.error.as_ref().map(tracing::field::display),
        "client to upstream finished"
    );
    debug!(
        bytes = down.bytes,
        duration_ms = down.duration.as_millis() as u64,
        error = down.error.as_ref().map(tracing::field::display),
        "upstream to client finished"
    );

    ProxyResult {
        bytes_to_upstream: up.bytes,
        bytes_to_client: down.bytes,
        upstream_error: up.error,
        client_error: down.error,
    }
}
