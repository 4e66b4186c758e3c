//! Intercepting reverse proxy.
//!
//! ```text
//!  client ──▶ http::server ──▶ upload route? ──▶ upload (rewrite) ──┐
//!                  │                                               ▼
//!                  └──────────────▶ http::upstream ─────────▶ upstream app
//!                                        │
//!  client ◀── imageresizer ◀── X-Send-Data: send-scaled-img:...
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use intercept_proxy::config::{load_config, ProxyConfig};
use intercept_proxy::lifecycle::{spawn_signal_handler, Shutdown};
use intercept_proxy::observability::{logging, metrics};
use intercept_proxy::HttpServer;

#[derive(Debug, Parser)]
#[command(name = "intercept-proxy", version, about = "Intercepting reverse proxy")]
struct Cli {
    /// Path to a TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "intercept-proxy starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstream = %config.upstream.address,
        request_timeout_secs = config.timeouts.request_secs,
        resizer_enabled = config.image_resizer.enabled,
        upload_routes = config.uploads.routes.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    spawn_signal_handler(&shutdown);

    let server = HttpServer::new(config)?;
    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
