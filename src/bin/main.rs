//! upstream-discovery binary entry point.

use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use upstream_discovery::{telemetry, Config, UpstreamService};

/// Keeps upstream clusters in sync with a discovery API and DNS.
#[derive(Parser, Debug)]
#[command(name = "upstream-discovery")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "upstream-discovery.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()))
        .add_source(
            config::Environment::with_prefix("UPSTREAM_DISCOVERY")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        cds_server = config.cds.as_ref().map(|c| c.server.as_str()).unwrap_or("<disabled>"),
        logical_dns_clusters = config.logical_dns_clusters.len(),
        static_clusters = config.static_clusters.len(),
        "Starting upstream-discovery"
    );

    // Setup graceful shutdown
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            shutdown.cancel();
        }
    });

    let service = UpstreamService::new(config);
    let result = service.run(shutdown).await;

    if let Err(e) = result {
        error!("upstream-discovery error: {}", e);
        return Err(e.into());
    }

    info!("upstream-discovery shutdown complete");
    Ok(())
}
