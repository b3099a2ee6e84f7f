//! Least-connections backend table.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::EndpointLease;

/// A registered upstream and its live connection count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Address without port.
    pub address: String,
    /// Connections currently spliced to this endpoint.
    pub active_connections: u32,
}

/// The authoritative set of upstream endpoints.
///
/// Selection always picks the endpoint with the fewest active connections.
/// Ties go to the lexicographically smallest address, which falls out of the
/// `BTreeMap` iteration order.
#[derive(Debug, Default)]
pub struct BackendTable {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Active connection count per address.
    endpoints: BTreeMap<String, u32>,
    /// Cached selection; `None` iff `endpoints` is empty.
    current: Option<String>,
}

impl Inner {
    fn recompute(&mut self) {
        let mut least = u32::MAX;
        let mut selected = None;

        for (address, &conns) in &self.endpoints {
            if conns == 0 {
                // Nothing beats an idle endpoint.
                selected = Some(address);
                break;
            }
            if selected.is_none() || conns < least {
                least = conns;
                selected = Some(address);
            }
        }

        self.current = selected.cloned();
    }
}

impl BackendTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint with zero connections.
    ///
    /// Returns `false` if the address was already present, in which case its
    /// counter is left untouched.
    pub fn add(&self, address: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.endpoints.contains_key(address) {
            return false;
        }
        inner.endpoints.insert(address.to_string(), 0);
        inner.recompute();
        true
    }

    /// Deregister an endpoint. Returns `false` if it was not present.
    pub fn delete(&self, address: &str) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.endpoints.remove(address).is_some();
        if removed {
            inner.recompute();
        }
        removed
    }

    /// Take a connection slot on the least-loaded endpoint.
    ///
    /// Every address returned here must be handed back to [`release`](Self::release)
    /// exactly once. Prefer [`lease`](Self::lease), which does that on drop.
    pub fn acquire(&self) -> Option<String> {
        let mut inner = self.inner.lock();
        let address = inner.current.clone()?;
        if let Some(conns) = inner.endpoints.get_mut(&address) {
            *conns = conns.saturating_add(1);
        }
        inner.recompute();
        Some(address)
    }

    /// Return a connection slot taken by [`acquire`](Self::acquire).
    ///
    /// A no-op if the endpoint has since been deleted. Counters floor at zero.
    pub fn release(&self, address: &str) {
        let mut inner = self.inner.lock();
        let Some(conns) = inner.endpoints.get_mut(address) else {
            return;
        };
        *conns = conns.saturating_sub(1);
        inner.recompute();
    }

    /// Acquire a slot wrapped in a guard that releases it when dropped.
    pub fn lease(self: &Arc<Self>) -> Option<EndpointLease> {
        self.acquire()
            .map(|address| EndpointLease::new(Arc::clone(self), address))
    }

    /// The endpoint the next acquire would pick.
    pub fn current(&self) -> Option<String> {
        self.inner.lock().current.clone()
    }

    /// Connection count for an address, or `None` if it is not registered.
    pub fn connections(&self, address: &str) -> Option<u32> {
        self.inner.lock().endpoints.get(address).copied()
    }

    /// Whether an address is registered.
    pub fn contains(&self, address: &str) -> bool {
        self.inner.lock().endpoints.contains_key(address)
    }

    /// Registered addresses in selection tie-break order.
    pub fn addresses(&self) -> Vec<String> {
        self.inner.lock().endpoints.keys().cloned().collect()
    }

    /// Copy of every endpoint and its counter.
    pub fn snapshot(&self) -> Vec<Endpoint> {
        self.inner
            .lock()
            .endpoints
            .iter()
            .map(|(address, &active_connections)| Endpoint {
                address: address.clone(),
                active_connections,
            })
            .collect()
    }

    /// Number of registered endpoints.
    pub fn len(&self) -> usize {
        self.inner.lock().endpoints.len()
    }

    /// Whether no endpoints are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().endpoints.is_empty()
    }
}
