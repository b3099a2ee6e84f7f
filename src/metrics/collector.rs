//! Metrics collector using prometheus-client.
//!
//! Tracks endpoint membership, per-endpoint connection load, connection
//! outcomes, bytes spliced and accept errors.

use crate::proxy::SpliceOutcome;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;

/// Labels for per-endpoint metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: String,
}

/// Labels for connection outcome metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: Outcome,
}

/// Label value for a connection outcome.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Completed,
    NoBackend,
    DialFailed,
    HandshakeFailed,
    Cancelled,
}

/// Labels for membership change metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MembershipLabels {
    pub change: MembershipChange,
}

/// Kind of membership change.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum MembershipChange {
    Added,
    Removed,
}

/// Labels for bytes transferred metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BytesLabels {
    pub direction: Direction,
}

/// Direction of bytes transfer.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Direction {
    ToUpstream,
    ToClient,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Registered endpoints gauge.
    endpoints: Gauge,
    /// Active connections per endpoint.
    active_connections: Family<EndpointLabels, Gauge>,
    /// Client connections by outcome.
    connections_total: Family<OutcomeLabels, Counter>,
    /// Splice duration histogram (in seconds).
    splice_duration_seconds: Histogram,
    /// Bytes transferred counter.
    bytes_total: Family<BytesLabels, Counter>,
    /// Membership changes counter.
    membership_changes_total: Family<MembershipLabels, Counter>,
    /// Accept errors counter.
    accept_errors_total: Counter,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let endpoints = Gauge::default();
        let active_connections = Family::<EndpointLabels, Gauge>::default();
        let connections_total = Family::<OutcomeLabels, Counter>::default();
        // Buckets: 10ms up to roughly 11 hours; watches are long-lived.
        let splice_duration_seconds = Histogram::new(exponential_buckets(0.01, 4.0, 12));
        let bytes_total = Family::<BytesLabels, Counter>::default();
        let membership_changes_total = Family::<MembershipLabels, Counter>::default();
        let accept_errors_total = Counter::default();

        registry.register(
            "proxyd_endpoints",
            "Number of registered API server endpoints",
            endpoints.clone(),
        );
        registry.register(
            "proxyd_active_connections",
            "Number of connections currently spliced to each endpoint",
            active_connections.clone(),
        );
        registry.register(
            "proxyd_connections",
            "Total number of client connections by outcome",
            connections_total.clone(),
        );
        registry.register(
            "proxyd_splice_duration_seconds",
            "Duration of completed splices in seconds",
            splice_duration_seconds.clone(),
        );
        registry.register(
            "proxyd_bytes",
            "Total bytes spliced",
            bytes_total.clone(),
        );
        registry.register(
            "proxyd_membership_changes",
            "Total number of endpoint registrations and deregistrations",
            membership_changes_total.clone(),
        );
        registry.register(
            "proxyd_accept_errors",
            "Total number of failed accepts",
            accept_errors_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                endpoints,
                active_connections,
                connections_total,
                splice_duration_seconds,
                bytes_total,
                membership_changes_total,
                accept_errors_total,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Record an endpoint registration.
    pub fn endpoint_added(&self, endpoint_count: usize) {
        self.record_membership(MembershipChange::Added, endpoint_count);
    }

    /// Record an endpoint deregistration and drop its connection gauge.
    pub fn endpoint_removed(&self, endpoint: &str, endpoint_count: usize) {
        self.inner.active_connections.remove(&EndpointLabels {
            endpoint: endpoint.to_string(),
        });
        self.record_membership(MembershipChange::Removed, endpoint_count);
    }

    fn record_membership(&self, change: MembershipChange, endpoint_count: usize) {
        self.inner
            .membership_changes_total
            .get_or_create(&MembershipLabels { change })
            .inc();
        self.inner
            .endpoints
            .set(i64::try_from(endpoint_count).unwrap_or(i64::MAX));
    }

    /// Mirror the table's connection count for an endpoint.
    ///
    /// `None` means the endpoint is no longer registered, and its series is dropped.
    pub fn set_active_connections(&self, endpoint: &str, connections: Option<u32>) {
        let labels = EndpointLabels {
            endpoint: endpoint.to_string(),
        };
        match connections {
            Some(count) => {
                self.inner
                    .active_connections
                    .get_or_create(&labels)
                    .set(i64::from(count));
            }
            None => {
                self.inner.active_connections.remove(&labels);
            }
        }
    }

    /// Record how a client connection ended.
    pub fn record_outcome(&self, outcome: SpliceOutcome) {
        let outcome = match outcome {
            SpliceOutcome::Completed => Outcome::Completed,
            SpliceOutcome::NoBackend => Outcome::NoBackend,
            SpliceOutcome::DialFailed => Outcome::DialFailed,
            SpliceOutcome::HandshakeFailed => Outcome::HandshakeFailed,
            SpliceOutcome::Cancelled => Outcome::Cancelled,
        };
        self.inner
            .connections_total
            .get_or_create(&OutcomeLabels { outcome })
            .inc();
    }

    /// Record a finished splice.
    pub fn record_splice(&self, bytes_to_upstream: u64, bytes_to_client: u64, duration: Duration) {
        self.inner
            .splice_duration_seconds
            .observe(duration.as_secs_f64());

        self.inner
            .bytes_total
            .get_or_create(&BytesLabels {
                direction: Direction::ToUpstream,
            })
            .inc_by(bytes_to_upstream);
        self.inner
            .bytes_total
            .get_or_create(&BytesLabels {
                direction: Direction::ToClient,
            })
            .inc_by(bytes_to_client);
    }

    /// Record a failed accept.
    pub fn accept_error(&self) {
        self.inner.accept_errors_total.inc();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
