//! # duo-server
//!
//! Anonymous one-to-one chat server.
//!
//! This binary provides:
//! - **WebSocket endpoint** (`/ws`) carrying JSON events for matchmaking,
//!   messaging, read receipts, and friend requests
//! - **Matchmaking** that pairs strangers into two-person rooms
//! - **Presence** tracking of every connection a user has open
//! - **File uploads** stored on local disk and served back by URL
//! - **Per-IP rate limiting** on HTTP and per-connection throttling of events

mod api;
mod config;
mod error;
mod friends;
mod hub;
mod matchmaking;
mod presence;
mod rate_limit;
mod relay;
mod rooms;
mod session;
mod upload_store;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use duo_shared::constants::APP_NAME;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::hub::Hub;
use crate::rate_limit::RateLimiter;
use crate::upload_store::UploadStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,duo_server=debug")),
        )
        .init();

    info!("Starting {} server v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let uploads = Arc::new(UploadStore::new(config.upload_path.clone(), config.max_upload_size).await?);
    info!(
        path = %uploads.base_path().display(),
        max_size = uploads.max_size(),
        "Serving uploads"
    );

    let rate_limiter = RateLimiter::new(config.http_rate_per_sec, config.http_rate_burst);

    let app_state = AppState {
        hub: Arc::new(Hub::new()),
        uploads,
        rate_limiter: rate_limiter.clone(),
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Every 5 minutes, evict buckets idle for more than 10
    let rl = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server until it fails or Ctrl+C
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
