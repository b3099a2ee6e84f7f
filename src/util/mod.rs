//! Utility functions and helpers.

mod conn_id;
mod logging;
mod shutdown;

pub use conn_id::ConnectionId;
pub use logging::init_logging;
pub use shutdown::{wait_for_signal, ShutdownSignal};
