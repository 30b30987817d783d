//! kubelan daemon
//!
//! Maintains a VXLAN overlay whose peers are the endpoints of the configured
//! Kubernetes services.

use anyhow::Context;
use clap::Parser;
use kubelan::{http, init_logging, Config, EndpointSliceWatcher, Manager, DEFAULT_CONFIG_PATH};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kubelan")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level, overrides the configuration file
    #[arg(short = 'l', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load_or_default(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    init_logging(&config.log_level);
    info!(config = %args.config.display(), "kubelan starting");

    config.validate().context("Invalid configuration")?;
    config
        .resolve_source_ip()
        .context("Failed to determine local VXLAN address")?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let manager = Manager::new(config).context("Failed to create manager")?;

    let http_shutdown = CancellationToken::new();
    let http_server = {
        let config = manager.config();
        let status = manager.status();
        let token = http_shutdown.clone();
        tokio::spawn(async move {
            let address = config.http_address.clone();
            if let Err(e) = http::bind_and_serve(&address, status, config, token).await {
                error!(error = %e, "HTTP server failed");
            }
        })
    };

    let watch = EndpointSliceWatcher::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let result = manager.run(watch, shutdown).await;

    http_shutdown.cancel();
    if let Err(e) = http_server.await {
        warn!(error = %e, "HTTP server task failed");
    }

    result.context("kubelan manager failed")?;
    info!("kubelan exiting");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Received SIGINT");
                    }
                    shutdown.cancel();
                    return;
                }
            };

            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }

        #[cfg(not(unix))]
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT");
        }

        shutdown.cancel();
    });
}
