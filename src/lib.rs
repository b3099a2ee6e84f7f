//! proxyd - a layer 4 proxy in front of a Kubernetes API server pool
//!
//! This crate provides:
//! - A least-connections backend table with RAII connection leases
//! - Discovery of ready kube-apiserver pods through the Kubernetes API
//! - Byte-level splicing with half-close, optionally terminating TLS
//! - Graceful drain on shutdown
//! - Prometheus metrics

pub mod backend;
pub mod config;
pub mod discovery;
pub mod frontend;
pub mod metrics;
pub mod proxy;
pub mod supervisor;
pub mod tls;
pub mod util;

pub use config::Config;
pub use supervisor::{Supervisor, SupervisorError};
