//! Configuration validation.

use crate::config::{Config, TlsMode};

/// Validate the configuration.
///
/// Checks for:
/// - A usable listen address and upstream port
/// - A non-zero dial timeout and resync interval
/// - Certificate and key paths when TLS is terminated
/// - A non-empty bootstrap endpoint, if one is set
/// - No collision between the listener and the metrics endpoint
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();
    let proxy = &config.proxy;

    if proxy.upstream_port == 0 {
        errors.push("upstream_port must be between 1 and 65535".to_string());
    }

    if proxy.connect_timeout.is_zero() {
        errors.push("connect_timeout must be greater than zero".to_string());
    }

    if proxy.idle_timeout.is_some_and(|d| d.is_zero()) {
        errors.push("idle_timeout must be greater than zero when set".to_string());
    }

    if let Some(ref endpoint) = proxy.bootstrap_endpoint {
        if endpoint.trim().is_empty() {
            errors.push("bootstrap_endpoint cannot be empty".to_string());
        } else if endpoint.parse::<std::net::SocketAddr>().is_ok() {
            // The upstream port is appended at dial time.
            errors.push(format!(
                "bootstrap_endpoint '{}' must not include a port",
                endpoint
            ));
        }
    }

    if config.tls.mode == TlsMode::Terminate {
        if config.tls.cert.is_none() {
            errors.push("tls.cert is required when tls.mode is terminate".to_string());
        }
        if config.tls.key.is_none() {
            errors.push("tls.key is required when tls.mode is terminate".to_string());
        }
    }

    if config.discovery.resync_interval.is_zero() {
        errors.push("discovery.resync_interval must be greater than zero".to_string());
    }

    if let Some(ref ns) = config.discovery.namespace {
        if ns.is_empty() {
            errors.push("discovery.namespace cannot be empty when set".to_string());
        }
    }

    let metrics = &config.global.metrics;
    if metrics.enabled {
        if metrics.address == proxy.listen {
            errors.push(format!(
                "metrics address {} collides with the listen address",
                metrics.address
            ));
        }
        if !metrics.path.starts_with('/') {
            errors.push(format!("metrics path '{}' must start with '/'", metrics.path));
        }
    }

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
