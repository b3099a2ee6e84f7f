//! Pod source backed by the Kubernetes API.

use super::{DiscoveryError, Membership, PodEvent, PodInfo, PodSource};
use crate::config::DiscoveryConfig;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Server-side timeout for a single watch request, in seconds.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Folds raw watch events into [`PodEvent`]s.
///
/// Only API server pods are remembered, which is enough to pair every update
/// with the state that was last applied to the table.
#[derive(Debug, Default)]
pub struct PodTracker {
    known: HashMap<String, PodInfo>,
    listing: Option<Vec<PodInfo>>,
}

impl PodTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of API server pods currently known.
    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Translate one watch event. Events inside an initial listing are
    /// buffered and come out together as a single resync.
    pub fn on_event(&mut self, event: Event<Pod>) -> Option<PodEvent> {
        match event {
            Event::Init => {
                self.listing = Some(Vec::new());
                None
            }
            Event::InitApply(pod) => {
                let pod = PodInfo::from(pod);
                if pod.is_api_server() {
                    self.listing.get_or_insert_with(Vec::new).push(pod);
                }
                None
            }
            Event::InitDone => {
                let pods = self.listing.take().unwrap_or_default();
                self.known = pods.iter().map(|pod| (pod.key(), pod.clone())).collect();
                Some(PodEvent::Resync(pods))
            }
            Event::Apply(pod) => Some(self.apply(PodInfo::from(pod))),
            Event::Delete(pod) => {
                let pod = PodInfo::from(pod);
                let last = self.known.remove(&pod.key());
                Some(PodEvent::Deleted(last.unwrap_or(pod)))
            }
        }
    }

    fn apply(&mut self, new: PodInfo) -> PodEvent {
        let key = new.key();
        let old = if new.is_api_server() {
            self.known.insert(key, new.clone())
        } else {
            self.known.remove(&key)
        };

        match old {
            Some(old) => PodEvent::Updated { old, new },
            None => PodEvent::Added(new),
        }
    }
}

/// Watches pods through the Kubernetes API and feeds them to [`Membership`].
pub struct KubeWatcher {
    api: Api<Pod>,
    resync_interval: Duration,
}

impl KubeWatcher {
    /// Build a client from the kubeconfig at `config.kubeconfig`.
    pub async fn connect(config: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let kubeconfig = Kubeconfig::read_from(&config.kubeconfig)?;
        let client_config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
        let client = Client::try_from(client_config)?;

        info!(
            kubeconfig = %config.kubeconfig.display(),
            namespace = config.namespace.as_deref().unwrap_or("<all>"),
            "kubernetes client ready"
        );

        Ok(Self::new(client, config))
    }

    /// Wrap an existing client.
    pub fn new(client: Client, config: &DiscoveryConfig) -> Self {
        let api = match &config.namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        };

        Self {
            api,
            resync_interval: config.resync_interval,
        }
    }

    /// Consume one watch stream until it ends, the resync interval elapses,
    /// or `shutdown` fires. Returns `false` on shutdown.
    async fn watch_once(
        &self,
        tracker: &mut PodTracker,
        membership: &mut Membership,
        shutdown: &CancellationToken,
    ) -> bool {
        let config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = watcher(self.api.clone(), config).default_backoff();
        futures::pin_mut!(stream);

        let resync = tokio::time::sleep(self.resync_interval);
        tokio::pin!(resync);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return false,

                _ = &mut resync => {
                    debug!("restarting pod watch for resync");
                    return true;
                }

                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        if let Some(event) = tracker.on_event(event) {
                            membership.handle(event);
                        }
                    }
                    Some(Err(error)) => {
                        // The stream backs off and re-lists on its own.
                        warn!(%error, "pod watch failed");
                    }
                    None => {
                        warn!("pod watch stream ended");
                        return true;
                    }
                },
            }
        }
    }
}

impl PodSource for KubeWatcher {
    #[instrument(skip_all, name = "discovery")]
    async fn run(self, mut membership: Membership, shutdown: CancellationToken) {
        info!(resync_interval = ?self.resync_interval, "watching API server pods");

        let mut tracker = PodTracker::new();
        while self
            .watch_once(&mut tracker, &mut membership, &shutdown)
            .await
        {}

        info!(api_servers = tracker.len(), "pod watch stopped");
    }
}
