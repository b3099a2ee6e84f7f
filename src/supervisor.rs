//! Process lifecycle: startup, the running tasks, and graceful drain.

use crate::backend::BackendTable;
use crate::config::{validate_config, Config};
use crate::discovery::{Membership, PodSource};
use crate::frontend::{FrontendListener, ListenerError};
use crate::metrics::{MetricsCollector, MetricsServer};
use crate::proxy::Splicer;
use crate::tls::{TlsError, TlsSettings};
use crate::util::ShutdownSignal;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinError;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Errors that stop the proxy.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("task panicked: {0}")]
    Task(#[from] JoinError),
}

/// A started proxy: TLS material loaded, table seeded, listener bound.
pub struct Supervisor {
    config: Config,
    table: Arc<BackendTable>,
    metrics: MetricsCollector,
    membership: Membership,
    listener: FrontendListener,
    signal: ShutdownSignal,
    tracker: TaskTracker,
}

impl Supervisor {
    /// Perform every startup step that can fail.
    pub async fn start(config: Config) -> Result<Self, SupervisorError> {
        validate_config(&config).map_err(SupervisorError::Config)?;

        let tls = TlsSettings::load(&config.tls)?;
        let table = Arc::new(BackendTable::new());
        let metrics = MetricsCollector::new();

        let membership = Membership::new(
            Arc::clone(&table),
            metrics.clone(),
            config.proxy.bootstrap_endpoint.clone(),
        );

        let splicer = Arc::new(Splicer::new(
            Arc::clone(&table),
            &config.proxy,
            tls.termination().cloned(),
            metrics.clone(),
        ));
        let listener = FrontendListener::bind(config.proxy.listen, splicer, metrics.clone()).await?;

        Ok(Self {
            config,
            table,
            metrics,
            membership,
            listener,
            signal: ShutdownSignal::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Address of the client listener.
    pub fn local_addr(&self) -> Result<SocketAddr, SupervisorError> {
        Ok(self.listener.local_addr()?)
    }

    /// The shared backend table.
    pub fn table(&self) -> &Arc<BackendTable> {
        &self.table
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Serve until `shutdown` resolves or the listener fails.
    ///
    /// On shutdown, intake stops first and in-flight connections get the
    /// configured grace period before they are cancelled.
    pub async fn run<S, F>(self, source: S, shutdown: F) -> Result<(), SupervisorError>
    where
        S: PodSource,
        F: Future<Output = ()>,
    {
        let Self {
            config,
            table,
            metrics,
            membership,
            listener,
            signal,
            tracker,
        } = self;

        let metrics_task = config.global.metrics.enabled.then(|| {
            let server = MetricsServer::new(
                config.global.metrics.address,
                config.global.metrics.path.clone(),
                metrics.clone(),
                Arc::clone(&table),
            );
            tokio::spawn(server.run(signal.root()))
        });

        let mut discovery = tokio::spawn(source.run(membership, signal.discovery()));
        let mut accept = tokio::spawn(listener.run(signal.clone(), tracker.clone()));
        let mut discovery_done = false;

        info!(
            listen = %config.proxy.listen,
            upstream_port = config.proxy.upstream_port,
            tls_mode = ?config.tls.mode,
            endpoints = table.len(),
            "proxyd running"
        );

        tokio::pin!(shutdown);
        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break None;
                }
                result = &mut accept => {
                    break Some(result);
                }
                result = &mut discovery, if !discovery_done => {
                    discovery_done = true;
                    match result {
                        Ok(()) => warn!("discovery stopped, endpoints are no longer updated"),
                        Err(e) => error!(error = %e, "discovery task failed"),
                    }
                }
            }
        };

        signal.stop_intake();
        tracker.close();

        let result = match outcome {
            // Clean shutdown: let in-flight splices finish within the grace period.
            None => {
                let accept_result = accept.await?;
                let grace = config.proxy.shutdown_grace;
                info!(connections = tracker.len(), grace = ?grace, "draining connections");
                if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
                    warn!(
                        connections = tracker.len(),
                        "grace period elapsed, closing remaining connections"
                    );
                }
                accept_result.map_err(SupervisorError::from)
            }
            Some(Ok(Ok(()))) => Ok(()),
            Some(Ok(Err(e))) => {
                error!(error = %e, "listener failed, shutting down");
                Err(SupervisorError::from(e))
            }
            Some(Err(e)) => Err(SupervisorError::from(e)),
        };

        signal.shutdown();
        tracker.wait().await;

        if !discovery_done {
            if let Err(e) = discovery.await {
                error!(error = %e, "discovery task failed");
            }
        }
        if let Some(task) = metrics_task {
            if let Err(e) = task.await {
                error!(error = %e, "metrics server task failed");
            }
        }

        info!(endpoints = table.len(), "proxyd stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::ChannelSource;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    fn ca_bundle() -> NamedTempFile {
        let ca = rcgen::generate_simple_self_signed(vec!["kubernetes".to_string()]).unwrap();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(ca.cert.pem().as_bytes()).unwrap();
        file
    }

    fn test_config(ca: &NamedTempFile) -> Config {
        let mut config = Config::default();
        config.proxy.listen = "127.0.0.1:0".parse().unwrap();
        config.tls.ca_bundle = ca.path().to_path_buf();
        config.global.metrics.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_start_fails_without_ca_bundle() {
        let ca = ca_bundle();
        let mut config = test_config(&ca);
        config.tls.ca_bundle = PathBuf::from("/nonexistent/ca.crt");

        let result = Supervisor::start(config).await;
        assert!(matches!(result, Err(SupervisorError::Tls(_))));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let ca = ca_bundle();
        let mut config = test_config(&ca);
        config.proxy.upstream_port = 0;

        let result = Supervisor::start(config).await;
        assert!(matches!(result, Err(SupervisorError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_seeds_bootstrap_endpoint() {
        let ca = ca_bundle();
        let mut config = test_config(&ca);
        config.proxy.bootstrap_endpoint = Some("192.168.1.10".to_string());

        let supervisor = Supervisor::start(config).await.unwrap();
        assert_eq!(supervisor.table().addresses(), vec!["192.168.1.10"]);
    }

    #[tokio::test]
    async fn test_run_returns_on_shutdown() {
        let ca = ca_bundle();
        let supervisor = Supervisor::start(test_config(&ca)).await.unwrap();
        let (_tx, source) = ChannelSource::channel();

        let result = supervisor.run(source, async {}).await;
        assert!(result.is_ok());
    }
}
