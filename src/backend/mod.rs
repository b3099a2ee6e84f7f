//! Upstream endpoint membership and least-connections selection.

mod lease;
mod table;

pub use lease::EndpointLease;
pub use table::{BackendTable, Endpoint};
