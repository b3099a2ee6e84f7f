//! Translation of pod events into backend table changes.

use super::PodInfo;
use crate::backend::BackendTable;
use crate::metrics::MetricsCollector;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// A change observed on the pod stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodEvent {
    /// A pod seen for the first time.
    Added(PodInfo),
    /// A known pod changed.
    Updated { old: PodInfo, new: PodInfo },
    /// A pod went away.
    Deleted(PodInfo),
    /// A complete listing of the pods that currently exist.
    Resync(Vec<PodInfo>),
}

/// A change to apply to the backend table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Added(String),
    Removed(String),
    /// `old_ready`/`new_ready` say whether the pod was registrable before and after.
    Updated {
        old_ready: bool,
        new_ready: bool,
        address: String,
    },
}

/// Table changes implied by one incremental pod event.
///
/// Pods that are not API servers produce nothing. A resync is not incremental
/// and yields nothing here; see [`Membership::handle`].
pub fn membership_events(event: &PodEvent) -> Vec<MembershipEvent> {
    match event {
        PodEvent::Added(pod) => {
            if pod.is_api_server() && pod.is_registrable() {
                vec![MembershipEvent::Added(pod.ip.clone())]
            } else {
                vec![]
            }
        }
        PodEvent::Updated { old, new } => update_events(old, new),
        PodEvent::Deleted(pod) => {
            if pod.is_api_server() && !pod.ip.is_empty() {
                vec![MembershipEvent::Removed(pod.ip.clone())]
            } else {
                vec![]
            }
        }
        PodEvent::Resync(_) => vec![],
    }
}

fn update_events(old: &PodInfo, new: &PodInfo) -> Vec<MembershipEvent> {
    if !new.is_api_server() {
        // Relabelled away from the API server role.
        if old.is_api_server() && !old.ip.is_empty() {
            return vec![MembershipEvent::Removed(old.ip.clone())];
        }
        return vec![];
    }

    let old_ready = old.is_api_server() && old.is_registrable();
    let new_ready = new.is_registrable();

    if !new.all_ready() {
        if old.ip.is_empty() {
            return vec![];
        }
        return vec![MembershipEvent::Updated {
            old_ready,
            new_ready: false,
            address: old.ip.clone(),
        }];
    }

    match (old_ready, new_ready) {
        (false, true) => vec![MembershipEvent::Updated {
            old_ready,
            new_ready,
            address: new.ip.clone(),
        }],
        (true, true) if old.ip != new.ip => vec![
            MembershipEvent::Removed(old.ip.clone()),
            MembershipEvent::Added(new.ip.clone()),
        ],
        _ => vec![],
    }
}

/// Applies membership changes to the backend table.
///
/// Owns the bootstrap endpoint, which is retired as soon as a discovered API
/// server is registered. Each address remembers the pods registered under it,
/// so a replacement pod that reuses an IP keeps the endpoint alive when the
/// pod it replaced goes away.
pub struct Membership {
    table: Arc<BackendTable>,
    metrics: MetricsCollector,
    bootstrap: Option<String>,
    owners: BTreeMap<String, BTreeSet<String>>,
}

impl Membership {
    /// Create a membership applier, registering `bootstrap` if given.
    pub fn new(
        table: Arc<BackendTable>,
        metrics: MetricsCollector,
        bootstrap: Option<String>,
    ) -> Self {
        let membership = Self {
            table,
            metrics,
            bootstrap,
            owners: BTreeMap::new(),
        };

        if let Some(address) = membership.bootstrap.clone() {
            if membership.table.add(&address) {
                membership.metrics.endpoint_added(membership.table.len());
                info!(address = %address, "registered bootstrap endpoint");
            }
        }

        membership
    }

    /// The backend table being maintained.
    pub fn table(&self) -> &Arc<BackendTable> {
        &self.table
    }

    /// The bootstrap endpoint, while it is still registered.
    pub fn bootstrap(&self) -> Option<&str> {
        self.bootstrap.as_deref()
    }

    /// Number of pods currently registered under `address`.
    pub fn owners(&self, address: &str) -> usize {
        self.owners.get(address).map_or(0, BTreeSet::len)
    }

    /// Apply one pod event.
    pub fn handle(&mut self, event: PodEvent) {
        let (before, after) = match &event {
            PodEvent::Resync(pods) => {
                self.reconcile(pods);
                return;
            }
            PodEvent::Added(pod) | PodEvent::Deleted(pod) => (pod.key(), pod.key()),
            PodEvent::Updated { old, new } => (old.key(), new.key()),
        };

        for change in membership_events(&event) {
            self.apply(change, &before, &after);
        }
    }

    /// Apply one table change. Removals are charged to the pod as it was
    /// (`before`), registrations to the pod as it is now (`after`).
    fn apply(&mut self, event: MembershipEvent, before: &str, after: &str) {
        match event {
            MembershipEvent::Added(address) => self.register(&address, after),
            MembershipEvent::Removed(address) => self.deregister(&address, before),
            MembershipEvent::Updated {
                new_ready: false,
                address,
                ..
            } => self.deregister(&address, before),
            MembershipEvent::Updated {
                old_ready: false,
                new_ready: true,
                address,
            } => self.register(&address, after),
            MembershipEvent::Updated { .. } => {}
        }
    }

    /// Make the table match the ready API servers in a full listing.
    pub fn reconcile(&mut self, pods: &[PodInfo]) {
        let mut owners: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for pod in pods
            .iter()
            .filter(|pod| pod.is_api_server() && pod.is_registrable())
        {
            owners.entry(pod.ip.clone()).or_default().insert(pod.key());
        }
        self.owners = owners;
        let desired: BTreeSet<String> = self.owners.keys().cloned().collect();

        let current = self.table.addresses();
        let mut removed = 0;
        for address in &current {
            if desired.contains(address.as_str()) {
                continue;
            }
            // Keep serving through the bootstrap endpoint until something replaces it.
            if desired.is_empty() && self.bootstrap.as_deref() == Some(address.as_str()) {
                continue;
            }
            self.remove_endpoint(address);
            removed += 1;
        }

        let mut added = 0;
        for address in &desired {
            if !self.table.contains(address) {
                self.insert_endpoint(address);
                added += 1;
            }
        }

        info!(
            pods = pods.len(),
            ready = desired.len(),
            added,
            removed,
            endpoints = self.table.len(),
            "resynchronized API server endpoints"
        );
    }

    fn register(&mut self, address: &str, owner: &str) {
        self.owners
            .entry(address.to_string())
            .or_default()
            .insert(owner.to_string());
        self.insert_endpoint(address);
    }

    fn deregister(&mut self, address: &str, owner: &str) {
        if let Some(owners) = self.owners.get_mut(address) {
            owners.remove(owner);
            if !owners.is_empty() {
                debug!(
                    address = %address,
                    pod = %owner,
                    remaining = owners.len(),
                    "API server address still in use by another pod"
                );
                return;
            }
            self.owners.remove(address);
        }
        self.remove_endpoint(address);
    }

    fn insert_endpoint(&mut self, address: &str) {
        if self.table.add(address) {
            self.metrics.endpoint_added(self.table.len());
            info!(address = %address, "registered API server");
        } else {
            debug!(address = %address, "API server already registered");
        }

        if let Some(bootstrap) = self.bootstrap.take_if(|b| b.as_str() != address) {
            if self.table.delete(&bootstrap) {
                self.metrics.endpoint_removed(&bootstrap, self.table.len());
                info!(address = %bootstrap, "deregistered bootstrap endpoint");
            }
        }
    }

    fn remove_endpoint(&mut self, address: &str) {
        if self.bootstrap.as_deref() == Some(address) {
            self.bootstrap = None;
        }

        if self.table.delete(address) {
            self.metrics.endpoint_removed(address, self.table.len());
            info!(address = %address, "deregistered API server");
        }
    }
}
