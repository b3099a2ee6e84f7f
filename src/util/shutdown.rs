//! Graceful shutdown handling.

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Cancellation scopes for everything the supervisor owns.
///
/// All scopes are children of one root: cancelling the root cancels every
/// task. The accept and discovery scopes can be cancelled on their own to stop
/// taking new work while in-flight connections drain.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    root: CancellationToken,
    accept: CancellationToken,
    discovery: CancellationToken,
    connections: CancellationToken,
}

impl ShutdownSignal {
    /// Create a fresh set of scopes.
    pub fn new() -> Self {
        let root = CancellationToken::new();
        Self {
            accept: root.child_token(),
            discovery: root.child_token(),
            connections: root.child_token(),
            root,
        }
    }

    /// Scope of the accept loop.
    pub fn accept(&self) -> CancellationToken {
        self.accept.clone()
    }

    /// Scope of the membership watcher.
    pub fn discovery(&self) -> CancellationToken {
        self.discovery.clone()
    }

    /// A new scope for one client connection.
    pub fn connection(&self) -> CancellationToken {
        self.connections.child_token()
    }

    /// Scope of auxiliary servers that live as long as the process.
    pub fn root(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Stop accepting connections and watching for endpoints.
    pub fn stop_intake(&self) {
        self.accept.cancel();
        self.discovery.cancel();
    }

    /// Cancel every scope, closing in-flight connections.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    /// Whether the root scope has been cancelled.
    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve when the process receives SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                wait_for_ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = wait_for_ctrl_c() => {}
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received SIGINT"),
        Err(e) => {
            error!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
