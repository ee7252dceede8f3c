//! Kinship Server
//!
//! Presence and real-time messaging over WebSockets, backed by Aurora.

use std::sync::Arc;

use anyhow::{Context, Result};
use kinship_server::config::{ServerConfig, StoreMode};
use kinship_server::store::{AuroraStore, MemoryStore};
use kinship_server::{db, routes, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::from_env()?;
    init_tracing(config.json_logs);

    let state = match &config.store {
        StoreMode::Aurora { path } => {
            let db = db::init_database(path).context("initialize database")?;
            tracing::info!(path = %path, "using aurora store");
            AppState::new(config.clone(), Arc::new(AuroraStore::new(db)))
        }
        StoreMode::Memory => {
            tracing::warn!("using in-memory store, nothing will be persisted");
            AppState::new(config.clone(), Arc::new(MemoryStore::new()))
        }
    };

    let app = routes::build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    tracing::info!("Starting server on {}", config.bind_addr);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kinship_server=debug,tower_http=debug".into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
