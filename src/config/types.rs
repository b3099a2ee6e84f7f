//! Configuration data types.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Listener and upstream settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// CA bundle and TLS termination settings
    #[serde(default)]
    pub tls: TlsConfig,

    /// API server discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
            metrics: MetricsConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether metrics endpoint is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind metrics server
    #[serde(default = "default_metrics_address")]
    pub address: SocketAddr,

    /// Path for metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

/// Listener and upstream configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Address and port to accept client connections on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Port appended to every endpoint address when dialing
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,

    /// Upstream dial timeout
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Close a splice after this long without reading anything (disabled when unset)
    #[serde(default, with = "option_humantime_serde")]
    pub idle_timeout: Option<Duration>,

    /// How long shutdown waits for in-flight connections before closing them
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Upstream used until the first API server is discovered
    #[serde(default)]
    pub bootstrap_endpoint: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            upstream_port: default_upstream_port(),
            connect_timeout: default_connect_timeout(),
            idle_timeout: None,
            shutdown_grace: default_shutdown_grace(),
            bootstrap_endpoint: None,
        }
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Whether connections are relayed as-is or terminated at the proxy
    #[serde(default)]
    pub mode: TlsMode,

    /// PEM bundle of the cluster CA
    #[serde(default = "default_ca_bundle")]
    pub ca_bundle: PathBuf,

    /// Serving certificate chain (terminate mode only)
    #[serde(default)]
    pub cert: Option<PathBuf>,

    /// Serving private key (terminate mode only)
    #[serde(default)]
    pub key: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            mode: TlsMode::Passthrough,
            ca_bundle: default_ca_bundle(),
            cert: None,
            key: None,
        }
    }
}

/// How client connections are handled at the TLS layer.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    #[default]
    Passthrough,
    Terminate,
}

/// API server discovery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    /// Kubeconfig used to authenticate to the cluster
    #[serde(default = "default_kubeconfig")]
    pub kubeconfig: PathBuf,

    /// Restrict the pod watch to a single namespace
    #[serde(default)]
    pub namespace: Option<String>,

    /// How often the pod list is re-read in full
    #[serde(default = "default_resync_interval", with = "humantime_serde")]
    pub resync_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            kubeconfig: default_kubeconfig(),
            namespace: None,
            resync_interval: default_resync_interval(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_true() -> bool {
    true
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 443))
}

fn default_upstream_port() -> u16 {
    6443
}

fn default_connect_timeout() -> Duration {
    Duration::from_millis(50)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

fn default_ca_bundle() -> PathBuf {
    PathBuf::from("/etc/kubernetes/pki/ca.crt")
}

fn default_kubeconfig() -> PathBuf {
    PathBuf::from("/etc/kubernetes/admin.conf")
}

fn default_resync_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Custom serde module for optional humantime durations.
mod option_humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => {
                let s = humantime::format_duration(*d).to_string();
                serializer.serialize_some(&s)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        opt.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
