//! Courtside Server - live court board over optimistic writes.
//!
//! This server follows the `matches` and `messages` collections of a backing
//! store through its change feed, applies writes optimistically and pushes
//! every visible change to the board pages over WebSocket.

pub mod backend;
pub mod backoff;
pub mod config;
pub mod error;
pub mod feed;
pub mod handlers;
pub mod routes;
pub mod schema;
pub mod service;
pub mod views;
pub mod websocket;

use std::sync::Arc;

use axum::Router;
use courtside_engine::{RecordFilter, RecordOrder};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::backend::BackingStore;
use crate::config::Config;
use crate::error::Result;
use crate::service::{ServiceOptions, SyncHandle, SyncService};
use crate::views::TeamDirectory;
use crate::websocket::{spawn_fanout, ConnectionManager};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub sync: SyncHandle,
    pub config: Arc<Config>,
    pub conn_manager: Arc<ConnectionManager>,
    pub teams: Arc<TeamDirectory>,
}

/// Load the team directory and start the sync service over `store`.
pub async fn start<S: BackingStore>(store: Arc<S>, config: Config) -> Result<AppState> {
    let teams = store
        .fetch_all(schema::TEAMS, &RecordFilter::new(), &RecordOrder::by("id"))
        .await?;
    let teams = TeamDirectory::from_records(&teams);
    tracing::info!(teams = teams.len(), "Loaded team directory");

    let sync = SyncService::start(
        store,
        schema::live_schema(),
        ServiceOptions::from_config(&config),
    );

    let conn_manager = ConnectionManager::new_shared();
    spawn_fanout(&sync, conn_manager.clone());

    Ok(AppState {
        sync,
        config: Arc::new(config),
        conn_manager,
        teams: Arc::new(teams),
    })
}

/// Build the router with every route and layer.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
