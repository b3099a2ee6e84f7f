//! Frontend listener implementation.
//!
//! Accepts incoming connections and dispatches each to the splicer.

use crate::metrics::MetricsCollector;
use crate::proxy::{tune_socket, Splicer};
use crate::util::{ConnectionId, ShutdownSignal};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Consecutive transient errors retried without delay.
const IMMEDIATE_RETRIES: u32 = 3;
const BACKOFF_STEP: Duration = Duration::from_millis(10);
const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Per-process and system-wide file descriptor limits.
const EMFILE: i32 = 24;
const ENFILE: i32 = 23;

/// Listener error.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind {address}: {source}")]
    Bind { address: SocketAddr, source: io::Error },

    #[error("failed to read local address: {0}")]
    LocalAddr(#[source] io::Error),

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

/// Whether an accept error is worth retrying.
pub fn is_transient_accept_error(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::OutOfMemory => true,
        _ => matches!(e.raw_os_error(), Some(EMFILE | ENFILE)),
    }
}

/// Delay policy for consecutive transient accept errors.
///
/// The first few retries are immediate, then the delay grows linearly up to a cap.
#[derive(Debug, Default)]
pub struct AcceptBackoff {
    consecutive: u32,
}

impl AcceptBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.consecutive = self.consecutive.saturating_add(1);
        let excess = self.consecutive.saturating_sub(IMMEDIATE_RETRIES);
        BACKOFF_STEP.saturating_mul(excess).min(BACKOFF_MAX)
    }

    /// Forget past failures after a successful accept.
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}

/// Frontend listener that accepts and handles connections.
pub struct FrontendListener {
    listener: TcpListener,
    splicer: Arc<Splicer>,
    metrics: MetricsCollector,
}

impl FrontendListener {
    /// Bind the listening socket.
    pub async fn bind(
        address: SocketAddr,
        splicer: Arc<Splicer>,
        metrics: MetricsCollector,
    ) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| ListenerError::Bind { address, source })?;

        info!(listen = %address, "frontend listener bound");

        Ok(Self {
            listener,
            splicer,
            metrics,
        })
    }

    /// The address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, ListenerError> {
        self.listener.local_addr().map_err(ListenerError::LocalAddr)
    }

    /// Run the listener, accepting connections until the accept scope is cancelled.
    ///
    /// Every connection runs in a task on `tracker` under its own child scope.
    /// Returns an error only for accept failures that are not transient.
    #[instrument(skip_all, name = "listener")]
    pub async fn run(self, shutdown: ShutdownSignal, tracker: TaskTracker) -> Result<(), ListenerError> {
        let accept_scope = shutdown.accept();
        let mut backoff = AcceptBackoff::new();

        info!("frontend listener starting");

        loop {
            let accepted = tokio::select! {
                biased;
                _ = accept_scope.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    backoff.reset();
                    tune_socket(&stream);

                    let id = ConnectionId::next();
                    let cancel = shutdown.connection();
                    let splicer = Arc::clone(&self.splicer);
                    debug!(conn = %id, client = %peer, "connection accepted");

                    tracker.spawn(async move {
                        let outcome = splicer.handle(stream, peer, &id, cancel).await;
                        debug!(conn = %id, ?outcome, "connection closed");
                    });
                }
                Err(e) if is_transient_accept_error(&e) => {
                    self.metrics.accept_error();
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in = ?delay, "failed to accept connection");

                    if !delay.is_zero() {
                        tokio::select! {
                            _ = accept_scope.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                Err(e) => {
                    self.metrics.accept_error();
                    error!(error = %e, "fatal accept error");
                    return Err(ListenerError::Accept(e));
                }
            }
        }

        info!("frontend listener shutting down");
        Ok(())
    }
}
