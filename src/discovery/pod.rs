//! The subset of a Pod that membership decisions depend on.

use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;

/// Label used by static-pod control planes.
const COMPONENT_LABEL: &str = "component";
const COMPONENT_API_SERVER: &str = "kube-apiserver";

/// Label used by self-hosted control planes.
const K8S_APP_LABEL: &str = "k8s-app";
const K8S_APP_SELF_HOSTED_API_SERVER: &str = "self-hosted-kube-apiserver";

/// A pod as seen by the membership watcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    /// Pod IP; empty until the pod has been scheduled and networked.
    pub ip: String,
    /// Readiness of each container, in status order.
    pub containers_ready: Vec<bool>,
}

impl PodInfo {
    /// Whether the pod is a kube-apiserver, static or self-hosted.
    pub fn is_api_server(&self) -> bool {
        self.labels.get(COMPONENT_LABEL).map(String::as_str) == Some(COMPONENT_API_SERVER)
            || self.labels.get(K8S_APP_LABEL).map(String::as_str)
                == Some(K8S_APP_SELF_HOSTED_API_SERVER)
    }

    /// Whether every container reports ready.
    ///
    /// A pod without container statuses counts as ready.
    pub fn all_ready(&self) -> bool {
        self.containers_ready.iter().all(|&ready| ready)
    }

    /// Whether the pod can be dialed: it has an IP and all containers are ready.
    pub fn is_registrable(&self) -> bool {
        !self.ip.is_empty() && self.all_ready()
    }

    /// Stable identity across updates: the UID, or namespace/name before one is assigned.
    pub fn key(&self) -> String {
        if self.uid.is_empty() {
            format!("{}/{}", self.namespace, self.name)
        } else {
            self.uid.clone()
        }
    }
}

impl From<&Pod> for PodInfo {
    fn from(pod: &Pod) -> Self {
        let metadata = &pod.metadata;
        let status = pod.status.as_ref();

        Self {
            namespace: metadata.namespace.clone().unwrap_or_default(),
            name: metadata.name.clone().unwrap_or_default(),
            uid: metadata.uid.clone().unwrap_or_default(),
            labels: metadata.labels.clone().unwrap_or_default(),
            ip: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
            containers_ready: status
                .and_then(|s| s.container_statuses.as_ref())
                .map(|statuses| statuses.iter().map(|c| c.ready).collect())
                .unwrap_or_default(),
        }
    }
}

impl From<Pod> for PodInfo {
    fn from(pod: Pod) -> Self {
        Self::from(&pod)
    }
}
