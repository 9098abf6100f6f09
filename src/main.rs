//! Gatekeeper load balancer
//!
//! ```text
//!     Client ──▶ request id / trace / timeout
//!                   │
//!                   ▼
//!              admission (token bucket per client, Redis or memory store)
//!                   │            ▲
//!                   │            └── refill scheduler (one worker, min-heap)
//!                   ▼
//!              balancer (least connections, one attempt per backend)
//!                   │            ▲
//!                   │            └── health monitor (GET /health every interval)
//!                   ▼
//!               backends
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use gatekeeper::config::{load_config, ObservabilityConfig};
use gatekeeper::lifecycle::{connect_store, wait_for_signal, Shutdown, StartupError};
use gatekeeper::observability::init_logging;
use gatekeeper::HttpServer;

#[derive(Parser)]
#[command(name = "gatekeeper", version, about = "Rate-limited least-connections load balancer")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config/config.toml")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            init_logging(&ObservabilityConfig::default());
            tracing::error!(path = %args.config.display(), error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };
    init_logging(&config.observability);

    if args.check {
        tracing::info!(path = %args.config.display(), "Configuration is valid");
        return Ok(());
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.listener.bind_address,
        backends = config.backends.len(),
        "gatekeeper starting"
    );

    let store = connect_store(&config.rate_limit).await?;
    let server = HttpServer::new(config.clone(), store)?;

    let listener = TcpListener::bind(&config.listener.bind_address)
        .await
        .map_err(|source| StartupError::Bind {
            address: config.listener.bind_address.clone(),
            source,
        })?;

    let shutdown = Shutdown::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    server.run(listener, &shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
