//! WebSocket handler for live viewers.
//!
//! Handles WebSocket connections: registers the viewer for view events and
//! answers the viewer's own requests.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use courtside_engine::{RecordFilter, RecordOrder};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::service::SyncHandle;
use crate::websocket::{ClientMessage, ConnectionManager, ServerMessage};

/// Handle an established WebSocket connection.
///
/// This function:
/// 1. Registers the connection with the manager
/// 2. Spawns a task to forward outgoing messages
/// 3. Processes incoming messages in a loop
/// 4. Cleans up on disconnect
pub async fn handle_websocket_connection(
    socket: WebSocket,
    sync: SyncHandle,
    conn_manager: Arc<ConnectionManager>,
    page: String,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let conn_id = conn_manager.register(page.clone(), tx);

    tracing::info!(
        conn_id = %conn_id,
        page = %page,
        "WebSocket viewer connected"
    );

    // Spawn task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                for reply in process_message(&text, &sync, &conn_manager, &conn_id).await {
                    conn_manager.send_to(&conn_id, reply);
                }
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!("Binary messages not supported");
            }
            Ok(Message::Ping(data)) => {
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("Received pong");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    conn_manager.unregister(&conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        page = %page,
        active_connections = conn_manager.connection_count(),
        "WebSocket viewer disconnected"
    );
}

/// Process a client message and return the replies, in order.
async fn process_message(
    text: &str,
    sync: &SyncHandle,
    conn_manager: &ConnectionManager,
    conn_id: &str,
) -> Vec<ServerMessage> {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return vec![ServerMessage::error(
                format!("Invalid message format: {}", e),
                None,
            )];
        }
    };

    match client_msg {
        ClientMessage::Watch {
            collections,
            request_id,
        } => {
            conn_manager.watch(conn_id, collections.clone());

            // Changes already flow to the viewer, so a snapshot taken now
            // can only be followed by newer events
            let mut replies = vec![ServerMessage::Watching {
                collections: collections.clone(),
                request_id: request_id.clone(),
            }];
            for collection in collections {
                replies.push(snapshot(sync, collection, RecordOrder::new(), request_id.clone()).await);
            }
            replies
        }

        ClientMessage::List {
            collection,
            order,
            request_id,
        } => {
            let order = match order.as_deref().unwrap_or("").parse() {
                Ok(order) => order,
                Err(e) => return vec![ServerMessage::error(format!("{}", e), request_id)],
            };
            vec![snapshot(sync, collection, order, request_id).await]
        }

        ClientMessage::Ping => vec![ServerMessage::Pong],
    }
}

async fn snapshot(
    sync: &SyncHandle,
    collection: String,
    order: RecordOrder,
    request_id: Option<String>,
) -> ServerMessage {
    match sync.list(&collection, RecordFilter::new(), order).await {
        Ok(records) => ServerMessage::Snapshot {
            collection,
            records,
            request_id,
        },
        Err(e) => ServerMessage::error(e.to_string(), request_id),
    }
}
