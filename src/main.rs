//! Stem Proxy - quota-aware front for a stem-separation service

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use stem_proxy::config::Config;
use stem_proxy::logging;
use stem_proxy::metrics::server::{MetricsServer, MetricsServerConfig};
use stem_proxy::server::{App, ProxyServer};
use stem_proxy::upstream::HttpSeparationClient;
use tracing::{info, warn};

/// Stem Proxy - daily-quota proxy for audio stem separation
#[derive(Parser, Debug)]
#[command(name = "stem-proxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    logging::init_subscriber(&config.logging)?;
    info!("Starting Stem Proxy v{}", stem_proxy::VERSION);
    info!("Loaded configuration from {:?}", args.config);

    let upstream = Arc::new(
        HttpSeparationClient::new(&config.upstream)
            .context("Failed to create separation service client")?
            .with_max_download(config.limits.max_file_size),
    );
    let app = Arc::new(App::new(&config, upstream));
    let sweepers = app.spawn_maintenance(&config);

    let mut metrics_server = if config.metrics.enabled {
        let mut server = MetricsServer::new(MetricsServerConfig::from(&config.metrics));
        let addr = server.start().await?;
        info!("Metrics server listening on {}", addr);
        Some(server)
    } else {
        None
    };

    let server = ProxyServer::bind(&config.server.address, app).await?;
    info!(
        mode = ?config.server.mode,
        daily_limit = config.limits.daily_limit,
        "Proxy listening on {}",
        server.local_addr()
    );

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    for sweeper in sweepers {
        sweeper.abort();
    }
    if let Some(server) = metrics_server.as_mut() {
        server.shutdown().await;
    }

    info!("Shutdown complete");
    Ok(())
}
