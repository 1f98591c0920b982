//! HTTP route definitions.

mod collections;
mod health;
mod views;
mod ws;

pub use collections::{parse_list_query, MutationResponse};

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(collections::routes())
        .merge(views::routes())
        .merge(ws::routes())
}
