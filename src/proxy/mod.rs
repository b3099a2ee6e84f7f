//! Connection splicing between clients and API servers.

mod splicer;
mod tcp_proxy;

pub use splicer::{SpliceOutcome, Splicer};
pub use tcp_proxy::{
    connect_upstream, copy_half, proxy_bidirectional, tune_socket, upstream_authority,
    AsyncStream, BoxedStream, HalfResult, ProxyResult, SpliceError,
};
