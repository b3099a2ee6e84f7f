//! API server discovery.
//!
//! A [`PodSource`] produces [`PodEvent`]s and hands them to a [`Membership`],
//! which keeps the backend table in line with the ready API server pods.

mod membership;
mod pod;
mod watcher;

pub use membership::{membership_events, Membership, MembershipEvent, PodEvent};
pub use pod::PodInfo;
pub use watcher::{KubeWatcher, PodTracker};

use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Errors that can occur while setting up discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("failed to create kubernetes client: {0}")]
    Client(#[from] kube::Error),
}

/// Something that reports pod changes until shutdown.
pub trait PodSource: Send + 'static {
    /// Feed events into `membership` until `shutdown` fires or the source is exhausted.
    fn run(
        self,
        membership: Membership,
        shutdown: CancellationToken,
    ) -> impl Future<Output = ()> + Send;
}

/// A pod source fed by hand through a channel.
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<PodEvent>,
}

impl ChannelSource {
    /// Create a source and the sender that drives it.
    pub fn channel() -> (mpsc::UnboundedSender<PodEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

impl PodSource for ChannelSource {
    async fn run(mut self, mut membership: Membership, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.rx.recv() => match event {
                    Some(event) => {
                        debug!(?event, "pod event");
                        membership.handle(event);
                    }
                    None => {
                        info!("pod event channel closed");
                        break;
                    }
                },
            }
        }
    }
}
