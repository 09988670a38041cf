//! # Roomcast Server
//!
//! Realtime room fanout server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! roomcast
//!
//! # Run with a specific config file
//! ROOMCAST_CONFIG=/path/to/roomcast.toml roomcast
//!
//! # Run with environment variables
//! ROOMCAST_PORT=8080 ROOMCAST_HOST=0.0.0.0 roomcast
//! ```
//!
//! ## Routes
//!
//! - `POST /rooms`, `GET /rooms`, `GET /rooms/:id`, `DELETE /rooms/:id`
//! - `GET /rooms/:id/ws` - WebSocket upgrade into the room
//! - `GET /health`

mod config;
mod handlers;
mod metrics;
mod rooms;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=debug,roomcast_core=info,roomcast_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Roomcast server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
