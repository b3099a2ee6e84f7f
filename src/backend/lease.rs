//! Connection slot guard.

use super::BackendTable;
use std::fmt;
use std::sync::Arc;

/// A connection slot held on one endpoint.
///
/// Holds the endpoint address by value so the endpoint may be deregistered
/// while the lease is alive. Dropping the lease releases the slot exactly once.
pub struct EndpointLease {
    table: Arc<BackendTable>,
    address: String,
}

impl EndpointLease {
    pub(super) fn new(table: Arc<BackendTable>, address: String) -> Self {
        Self { table, address }
    }

    /// The leased endpoint's address.
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for EndpointLease {
    fn drop(&mut self) {
        self.table.release(&self.address);
    }
}

impl fmt::Debug for EndpointLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointLease")
            .field("address", &self.address)
            .finish()
    }
}
