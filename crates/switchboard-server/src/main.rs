//! # Switchboard Server
//!
//! Multi-tenant realtime messaging server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! switchboard
//!
//! # Run with a specific config file
//! SWITCHBOARD_CONFIG=/path/to/switchboard.toml switchboard
//!
//! # Override settings from the environment
//! SWITCHBOARD__PORT=8080 SWITCHBOARD__HOST=0.0.0.0 switchboard
//! ```

mod admin;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchboard=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Switchboard on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
