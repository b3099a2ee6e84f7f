//! Prometheus metrics HTTP server.
//!
//! Serves metrics, a liveness probe, and a plain-text dump of the backend
//! table on a configurable HTTP endpoint.

use crate::backend::BackendTable;
use crate::metrics::MetricsCollector;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::text::encode;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Prometheus metrics HTTP server.
pub struct MetricsServer {
    /// Address to bind.
    address: SocketAddr,
    /// Path for metrics endpoint.
    path: String,
    /// Metrics collector.
    collector: MetricsCollector,
    /// Table dumped on `/endpoints`.
    table: Arc<BackendTable>,
}

struct ServerState {
    path: String,
    collector: MetricsCollector,
    table: Arc<BackendTable>,
}

impl MetricsServer {
    /// Create a new metrics server.
    pub fn new(
        address: SocketAddr,
        path: String,
        collector: MetricsCollector,
        table: Arc<BackendTable>,
    ) -> Self {
        Self {
            address,
            path,
            collector,
            table,
        }
    }

    /// Run the metrics server until `shutdown` is cancelled.
    ///
    /// A bind failure is logged and ends the server without affecting the proxy.
    pub async fn run(self, shutdown: CancellationToken) {
        let listener = match TcpListener::bind(self.address).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, address = %self.address, "failed to bind metrics server");
                return;
            }
        };

        info!(address = %self.address, path = %self.path, "metrics server started");

        let state = Arc::new(ServerState {
            path: self.path,
            collector: self.collector,
            table: self.table,
        });

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let state = Arc::clone(&state);
                            let shutdown = shutdown.clone();

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let state = Arc::clone(&state);
                                    async move { handle_request(req, &state) }
                                });

                                tokio::select! {
                                    result = http1::Builder::new().serve_connection(io, service) => {
                                        if let Err(e) = result {
                                            debug!(error = %e, "metrics connection error");
                                        }
                                    }
                                    _ = shutdown.cancelled() => {}
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept metrics connection");
                        }
                    }
                }

                _ = shutdown.cancelled() => {
                    info!("metrics server shutting down");
                    break;
                }
            }
        }
    }
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Handle an incoming metrics request.
fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: &ServerState,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path();
    let method = req.method();

    debug!(path = %path, method = %method, "metrics request");

    if method != Method::GET {
        return Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed\n",
        ));
    }

    let response = if path == state.path {
        let mut buffer = String::new();
        match encode(&mut buffer, state.collector.registry()) {
            Ok(()) => {
                let mut response = text_response(StatusCode::OK, buffer);
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE));
                response
            }
            Err(e) => {
                error!(error = %e, "failed to encode metrics");
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to encode metrics\n",
                )
            }
        }
    } else if path == "/endpoints" {
        text_response(StatusCode::OK, render_endpoints(&state.table))
    } else if path == "/health" || path == "/healthz" {
        text_response(StatusCode::OK, "OK\n")
    } else if path == "/" {
        text_response(
            StatusCode::OK,
            format!(
                "proxyd metrics server\n\nEndpoints:\n  {} - Prometheus metrics\n  /endpoints - Registered API servers\n  /health - Health check\n",
                state.path
            ),
        )
    } else {
        text_response(StatusCode::NOT_FOUND, "Not found\n")
    };

    Ok(response)
}

/// One `address active_connections` line per endpoint, current selection marked.
fn render_endpoints(table: &BackendTable) -> String {
    let current = table.current();
    let mut body = String::new();
    for endpoint in table.snapshot() {
        let marker = if current.as_deref() == Some(endpoint.address.as_str()) {
            " *"
        } else {
            ""
        };
        let _ = writeln!(
            body,
            "{} {}{}",
            endpoint.address, endpoint.active_connections, marker
        );
    }
    body
}
