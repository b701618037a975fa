//! Shitcord backend server
//!
//! REST API plus a WebSocket hub that fans chat, presence, typing, and
//! signaling events out to connected clients. Message content is end-to-end
//! encrypted by clients; the server only routes opaque blobs.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use shitcord_server::config::{Config, Environment};
use shitcord_server::routes::build_router;
use shitcord_server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    info!("starting shitcord-server v{}", env!("CARGO_PKG_VERSION"));
    if config.environment == Environment::Development {
        info!("running in development mode");
    }
    info!("database: {}", config.db_path);

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(config).await?);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {addr}");

    axum::serve(listener, app).await?;
    Ok(())
}
