//! proxyd - a layer 4 proxy for the Kubernetes API server
//!
//! Usage:
//!     proxyd [--config <path>]
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

use proxyd::config::{load_config, validate_config, Config};
use proxyd::discovery::KubeWatcher;
use proxyd::util::{init_logging, wait_for_signal};
use proxyd::Supervisor;

/// Least-connections TCP proxy in front of the cluster's API servers.
#[derive(Parser, Debug)]
#[command(name = "proxyd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file; defaults apply when omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Override the client listen address
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// API server address used until one is discovered
    #[arg(long, value_name = "ADDR")]
    bootstrap_endpoint: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(ref level) = self.log_level {
            config.global.log_level = level.clone();
        }
        if let Some(listen) = self.listen {
            config.proxy.listen = listen;
        }
        if let Some(ref endpoint) = self.bootstrap_endpoint {
            config.proxy.bootstrap_endpoint = Some(endpoint.clone());
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path).with_context(|| {
            format!("failed to load configuration from '{}'", path.display())
        })?,
        None => Config::default(),
    };

    // Flags can make a valid file invalid, so check again afterwards.
    cli.apply_overrides(&mut config);
    validate_config(&config)
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;

    init_logging(&config.global.log_level, &config.global.log_format)
        .context("failed to initialize logging")?;

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Listen: {}", config.proxy.listen);
        println!("  Upstream port: {}", config.proxy.upstream_port);
        println!("  TLS mode: {:?}", config.tls.mode);
        println!("  Kubeconfig: {}", config.discovery.kubeconfig.display());
        if let Some(ref endpoint) = config.proxy.bootstrap_endpoint {
            println!("  Bootstrap endpoint: {}", endpoint);
        }
        return Ok(());
    }

    info!(
        config_path = ?cli.config,
        listen = %config.proxy.listen,
        "proxyd starting"
    );

    run(config)
}

/// Build the runtime and serve until a termination signal arrives.
fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run_async(config))
}

async fn run_async(config: Config) -> Result<()> {
    let watcher = KubeWatcher::connect(&config.discovery)
        .await
        .with_context(|| {
            format!(
                "failed to set up discovery from '{}'",
                config.discovery.kubeconfig.display()
            )
        })?;

    let supervisor = Supervisor::start(config)
        .await
        .context("failed to start proxy")?;

    supervisor
        .run(watcher, wait_for_signal())
        .await
        .context("proxy stopped with an error")?;

    info!("proxyd shut down complete");
    Ok(())
}
