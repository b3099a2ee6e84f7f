//! Per-connection splicing: pick an endpoint, dial it, relay bytes, release.

use super::tcp_proxy::{connect_upstream, proxy_bidirectional, BoxedStream, SpliceError};
use crate::backend::{BackendTable, EndpointLease};
use crate::config::ProxyConfig;
use crate::metrics::MetricsCollector;
use crate::tls::TlsTermination;
use crate::util::ConnectionId;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// How one client connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceOutcome {
    /// Bytes were relayed until both directions closed.
    Completed,
    /// No endpoint was registered.
    NoBackend,
    /// The upstream could not be dialed in time.
    DialFailed,
    /// The client or upstream TLS handshake failed.
    HandshakeFailed,
    /// The connection scope was cancelled.
    Cancelled,
}

/// A leased endpoint whose gauge follows the table's counter.
struct ActiveLease {
    lease: Option<EndpointLease>,
    address: String,
    table: Arc<BackendTable>,
    metrics: MetricsCollector,
}

impl ActiveLease {
    fn new(lease: EndpointLease, table: &Arc<BackendTable>, metrics: &MetricsCollector) -> Self {
        let address = lease.address().to_string();
        metrics.set_active_connections(&address, table.connections(&address));
        Self {
            lease: Some(lease),
            address,
            table: Arc::clone(table),
            metrics: metrics.clone(),
        }
    }

    fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for ActiveLease {
    fn drop(&mut self) {
        drop(self.lease.take());
        // A deregistered endpoint reads as None and loses its series.
        self.metrics
            .set_active_connections(&self.address, self.table.connections(&self.address));
    }
}

/// Relays client connections to the least-loaded API server.
pub struct Splicer {
    table: Arc<BackendTable>,
    upstream_port: u16,
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
    tls: Option<TlsTermination>,
    metrics: MetricsCollector,
}

impl Splicer {
    pub fn new(
        table: Arc<BackendTable>,
        config: &ProxyConfig,
        tls: Option<TlsTermination>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            table,
            upstream_port: config.upstream_port,
            connect_timeout: config.connect_timeout,
            idle_timeout: config.idle_timeout,
            tls,
            metrics,
        }
    }

    /// Serve one client connection to completion.
    ///
    /// Cancelling `cancel` aborts the connection at any stage. The endpoint
    /// slot, if one was taken, is released before this returns.
    #[instrument(skip_all, fields(conn = %id, client = %peer))]
    pub async fn handle(
        &self,
        client: TcpStream,
        peer: SocketAddr,
        id: &ConnectionId,
        cancel: CancellationToken,
    ) -> SpliceOutcome {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("connection cancelled");
                SpliceOutcome::Cancelled
            }
            outcome = self.splice(client, peer) => outcome,
        };

        self.metrics.record_outcome(outcome);
        outcome
    }

    async fn splice(&self, client: TcpStream, peer: SocketAddr) -> SpliceOutcome {
        let (client, alpn): (BoxedStream, Option<Vec<u8>>) = match &self.tls {
            Some(tls) => match tls.accept(client).await {
                Ok(stream) => {
                    let alpn = stream.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
                    (Box::new(stream), alpn)
                }
                Err(source) => {
                    let error = SpliceError::Handshake {
                        peer: peer.to_string(),
                        source,
                    };
                    info!(%error, "client handshake failed");
                    return SpliceOutcome::HandshakeFailed;
                }
            },
            None => (Box::new(client), None),
        };

        let Some(lease) = self.table.lease() else {
            info!("no API server available, closing connection");
            return SpliceOutcome::NoBackend;
        };
        let lease = ActiveLease::new(lease, &self.table, &self.metrics);
        let endpoint = lease.address().to_string();

        let upstream = match connect_upstream(&endpoint, self.upstream_port, self.connect_timeout).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(endpoint = %endpoint, %error, "dial failed");
                return SpliceOutcome::DialFailed;
            }
        };

        let upstream: BoxedStream = match &self.tls {
            Some(tls) => match tls.connect(upstream, &endpoint, alpn).await {
                Ok(stream) => Box::new(stream),
                Err(source) => {
                    let error = SpliceError::Handshake {
                        peer: endpoint.clone(),
                        source,
                    };
                    warn!(endpoint = %endpoint, %error, "upstream handshake failed");
                    return SpliceOutcome::HandshakeFailed;
                }
            },
            None => Box::new(upstream),
        };

        debug!(endpoint = %endpoint, "splicing");
        let start = Instant::now();
        let result = proxy_bidirectional(client, upstream, self.idle_timeout).await;
        let duration = start.elapsed();

        self.metrics
            .record_splice(result.bytes_to_upstream, result.bytes_to_client, duration);

        if result.is_clean() {
            info!(
                endpoint = %endpoint,
                bytes_to_upstream = result.bytes_to_upstream,
                bytes_to_client = result.bytes_to_client,
                duration_ms = duration.as_millis() as u64,
                "splice completed"
            );
        } else {
            info!(
                endpoint = %endpoint,
                bytes_to_upstream = result.bytes_to_upstream,
                bytes_to_client = result.bytes_to_client,
                duration_ms = duration.as_millis() as u64,
                upstream_error = result.upstream_error.as_ref().map(tracing::field::display),
                client_error = result.client_error.as_ref().map(tracing::field::display),
                "splice ended with error"
            );
        }

        drop(lease);
        SpliceOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TlsConfig, TlsMode};
    use crate::tls::TlsSettings;
    use prometheus_client::encoding::text::encode;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// A connected client socket and the server side handed to the splicer.
    async fn client_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, server, peer)
    }

    /// An upstream that echoes everything until EOF.
    async fn echo_upstream() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                    let _ = w.shutdown().await;
                });
            }
        });
        port
    }

    fn splicer(table: &Arc<BackendTable>, port: u16) -> Splicer {
        splicer_with(table, port, None, MetricsCollector::new())
    }

    fn splicer_with(
        table: &Arc<BackendTable>,
        port: u16,
        tls: Option<TlsTermination>,
        metrics: MetricsCollector,
    ) -> Splicer {
        let config = ProxyConfig {
            upstream_port: port,
            ..ProxyConfig::default()
        };
        Splicer::new(Arc::clone(table), &config, tls, metrics)
    }

    fn encoded(metrics: &MetricsCollector) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, metrics.registry()).unwrap();
        buffer
    }

    fn write_temp(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    /// Terminating TLS settings for 127.0.0.1, trusted by the same bundle
    /// they serve. The temp files must outlive the returned value's use.
    fn termination() -> (TlsTermination, Vec<NamedTempFile>) {
        let generated = rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()]).unwrap();
        let ca = write_temp(&generated.cert.pem());
        let cert = write_temp(&generated.cert.pem());
        let key = write_temp(&generated.key_pair.serialize_pem());

        let settings = TlsSettings::load(&TlsConfig {
            mode: TlsMode::Terminate,
            ca_bundle: ca.path().to_path_buf(),
            cert: Some(cert.path().to_path_buf()),
            key: Some(key.path().to_path_buf()),
        })
        .unwrap();
        let termination = settings.termination().unwrap().clone();
        (termination, vec![ca, cert, key])
    }

    /// A TLS upstream that echoes one connection and reports its negotiated ALPN.
    async fn tls_echo_upstream(tls: TlsTermination) -> (u16, oneshot::Receiver<Option<Vec<u8>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (alpn_tx, alpn_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let stream = tls.accept(stream).await.unwrap();
            let alpn = stream.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
            let _ = alpn_tx.send(alpn);

            let (mut r, mut w) = tokio::io::split(stream);
            let _ = tokio::io::copy(&mut r, &mut w).await;
            let _ = w.shutdown().await;
        });
        (port, alpn_rx)
    }

    #[tokio::test]
    async fn test_splice_completes_and_releases() {
        let port = echo_upstream().await;
        let table = Arc::new(BackendTable::new());
        table.add("127.0.0.1");
        let splicer = splicer(&table, port);

        let (mut client, server, peer) = client_pair().await;
        let handle = tokio::spawn(async move {
            splicer
                .handle(server, peer, &ConnectionId::next(), CancellationToken::new())
                .await
        });

        client.write_all(b"GET /version").await.unwrap();
        client.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"GET /version");

        assert_eq!(handle.await.unwrap(), SpliceOutcome::Completed);
        assert_eq!(table.connections("127.0.0.1"), Some(0));
    }

    #[tokio::test]
    async fn test_no_backend_closes_client() {
        let table = Arc::new(BackendTable::new());
        let splicer = splicer(&table, 6443);

        let (mut client, server, peer) = client_pair().await;
        let outcome = splicer
            .handle(server, peer, &ConnectionId::next(), CancellationToken::new())
            .await;
        assert_eq!(outcome, SpliceOutcome::NoBackend);

        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dial_failure_releases_and_keeps_endpoint() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let table = Arc::new(BackendTable::new());
        table.add("127.0.0.1");
        let splicer = splicer(&table, port);

        let (_client, server, peer) = client_pair().await;
        let outcome = splicer
            .handle(server, peer, &ConnectionId::next(), CancellationToken::new())
            .await;

        assert_eq!(outcome, SpliceOutcome::DialFailed);
        assert_eq!(table.connections("127.0.0.1"), Some(0));
    }

    #[tokio::test]
    async fn test_cancel_releases() {
        // Upstream that accepts and then stays silent.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let held = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let table = Arc::new(BackendTable::new());
        table.add("127.0.0.1");
        let splicer = Arc::new(splicer(&table, port));

        let (_client, server, peer) = client_pair().await;
        let token = CancellationToken::new();
        let task = {
            let splicer = Arc::clone(&splicer);
            let token = token.clone();
            tokio::spawn(async move {
                splicer
                    .handle(server, peer, &ConnectionId::next(), token)
                    .await
            })
        };

        // Wait for the splice to take its slot.
        while table.connections("127.0.0.1") != Some(1) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        token.cancel();
        assert_eq!(task.await.unwrap(), SpliceOutcome::Cancelled);
        assert_eq!(table.connections("127.0.0.1"), Some(0));
        held.abort();
    }

    #[tokio::test]
    async fn test_deregistered_endpoint_drops_gauge_series() {
        let port = echo_upstream().await;
        let table = Arc::new(BackendTable::new());
        table.add("127.0.0.1");
        let metrics = MetricsCollector::new();
        let splicer = splicer_with(&table, port, None, metrics.clone());

        let (mut client, server, peer) = client_pair().await;
        let handle = tokio::spawn(async move {
            splicer
                .handle(server, peer, &ConnectionId::next(), CancellationToken::new())
                .await
        });

        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();
        assert!(encoded(&metrics).contains("proxyd_active_connections{endpoint=\"127.0.0.1\"} 1"));

        // The pod goes away while the splice is still open.
        assert!(table.delete("127.0.0.1"));
        metrics.endpoint_removed("127.0.0.1", table.len());

        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(handle.await.unwrap(), SpliceOutcome::Completed);

        let buffer = encoded(&metrics);
        assert!(!buffer.contains("endpoint=\"127.0.0.1\""));
        assert!(!buffer.contains("} -1"));
    }

    #[tokio::test]
    async fn test_terminate_round_trip_forwards_alpn() {
        let (tls, _files) = termination();
        let (port, upstream_alpn) = tls_echo_upstream(tls.clone()).await;

        let table = Arc::new(BackendTable::new());
        table.add("127.0.0.1");
        let splicer = splicer_with(&table, port, Some(tls.clone()), MetricsCollector::new());

        let (client, server, peer) = client_pair().await;
        let handle = tokio::spawn(async move {
            splicer
                .handle(server, peer, &ConnectionId::next(), CancellationToken::new())
                .await
        });

        let mut client = tls
            .connect(client, "127.0.0.1", Some(b"h2".to_vec()))
            .await
            .unwrap();
        assert_eq!(client.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));

        client.write_all(b"GET /version").await.unwrap();
        client.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"GET /version");

        assert_eq!(upstream_alpn.await.unwrap(), Some(b"h2".to_vec()));
        assert_eq!(handle.await.unwrap(), SpliceOutcome::Completed);
        assert_eq!(table.connections("127.0.0.1"), Some(0));
    }

    #[tokio::test]
    async fn test_plaintext_client_fails_before_lease() {
        let (tls, _files) = termination();
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = upstream.local_addr().unwrap().port();

        let table = Arc::new(BackendTable::new());
        table.add("127.0.0.1");
        let metrics = MetricsCollector::new();
        let splicer = splicer_with(&table, port, Some(tls), metrics.clone());

        let (mut client, server, peer) = client_pair().await;
        client.write_all(b"GET /version HTTP/1.1\r\n\r\n").await.unwrap();

        let outcome = splicer
            .handle(server, peer, &ConnectionId::next(), CancellationToken::new())
            .await;
        assert_eq!(outcome, SpliceOutcome::HandshakeFailed);

        // No slot was taken and the upstream was never dialed.
        assert_eq!(table.connections("127.0.0.1"), Some(0));
        assert!(!encoded(&metrics).contains("proxyd_active_connections{"));
        let dialed = tokio::time::timeout(Duration::from_millis(50), upstream.accept()).await;
        assert!(dialed.is_err());
    }

    #[tokio::test]
    async fn test_upstream_handshake_failure_releases() {
        let (tls, _files) = termination();

        // An upstream that answers in plaintext and hangs up.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
            let _ = stream.shutdown().await;
        });

        let table = Arc::new(BackendTable::new());
        table.add("127.0.0.1");
        let metrics = MetricsCollector::new();
        let splicer = splicer_with(&table, port, Some(tls.clone()), metrics.clone());

        let (client, server, peer) = client_pair().await;
        let id = ConnectionId::next();
        let (outcome, _client) = tokio::join!(
            splicer.handle(server, peer, &id, CancellationToken::new()),
            tls.connect(client, "127.0.0.1", None),
        );

        assert_eq!(outcome, SpliceOutcome::HandshakeFailed);
        assert_eq!(table.connections("127.0.0.1"), Some(0));
        assert!(encoded(&metrics).contains("proxyd_active_connections{endpoint=\"127.0.0.1\"} 0"));
    }
}
