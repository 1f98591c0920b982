//! Courtside Server binary.

use std::sync::Arc;

use courtside_server::backend::{MemoryBackend, PgBackend};
use courtside_server::config::{Config, StoreKind};
use courtside_server::error::AppError;
use courtside_server::schema::STORE_TABLES;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courtside_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Courtside Server on {}:{}", config.host, config.port);

    let addr = format!("{}:{}", config.host, config.port);
    let state = match config.store {
        StoreKind::Postgres => {
            let url = config
                .database_url
                .clone()
                .ok_or_else(|| AppError::Internal("DATABASE_URL is not set".to_string()))?;
            let store = PgBackend::connect(&url, STORE_TABLES).await?;

            tracing::info!("Running database migrations...");
            store.run_migrations().await?;

            courtside_server::start(Arc::new(store), config).await?
        }
        StoreKind::Memory => {
            tracing::warn!("Using the in-memory store; nothing is persisted");
            courtside_server::start(Arc::new(MemoryBackend::new(STORE_TABLES)), config).await?
        }
    };

    let app = courtside_server::app(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
