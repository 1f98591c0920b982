//! WebSocket upgrade endpoint.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::handlers::handle_websocket_connection;
use crate::AppState;

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default = "default_page")]
    page: String,
}

fn default_page() -> String {
    "courts".to_string()
}

/// Create WebSocket routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(upgrade))
}

/// GET /ws?page=courts - Follow view events live.
async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| {
        handle_websocket_connection(socket, state.sync, state.conn_manager, query.page)
    })
}
