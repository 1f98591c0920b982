//! Read models of the board pages.

use axum::{extract::State, routing::get, Json, Router};
use courtside_engine::{RecordFilter, RecordOrder, SortDirection};

use crate::error::Result;
use crate::schema::{MATCHES, MESSAGES};
use crate::views::{admin_board, court_board, message_feed, CourtQueue, CourtSlot, MessageItem};
use crate::AppState;

/// Create view routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/views/courts", get(courts))
        .route("/views/admin", get(admin))
        .route("/views/messages", get(messages))
}

fn newest_first() -> RecordOrder {
    RecordOrder::by("created_at").descending()
}

/// GET /views/courts - The match currently on each court.
async fn courts(State(state): State<AppState>) -> Result<Json<Vec<CourtSlot>>> {
    let matches = state
        .sync
        .list(MATCHES, RecordFilter::new(), newest_first())
        .await?;
    Ok(Json(court_board(&matches, &state.config.courts, &state.teams)))
}

/// GET /views/admin - Unfinished matches queued on each court.
async fn admin(State(state): State<AppState>) -> Result<Json<Vec<CourtQueue>>> {
    let order = RecordOrder::by("court").then("created_at", SortDirection::Ascending);
    let matches = state.sync.list(MATCHES, RecordFilter::new(), order).await?;
    Ok(Json(admin_board(&matches, &state.config.courts, &state.teams)))
}

/// GET /views/messages - Announcements, newest first.
async fn messages(State(state): State<AppState>) -> Result<Json<Vec<MessageItem>>> {
    let messages = state
        .sync
        .list(MESSAGES, RecordFilter::new(), newest_first())
        .await?;
    Ok(Json(message_feed(&messages)))
}
