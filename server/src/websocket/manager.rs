//! WebSocket connection manager.
//!
//! Tracks connected viewers and fans [`ViewEvent`]s out to the ones
//! watching the affected collection.

use std::sync::Arc;

use courtside_engine::CollectionName;
use dashmap::DashMap;
use tokio::sync::{broadcast::error::RecvError, mpsc};

use super::ServerMessage;
use crate::service::{SyncHandle, ViewEvent};

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Page the viewer is on
    pub page: String,
    /// Collections the viewer wants changes of; empty means all
    pub watching: Vec<CollectionName>,
    /// Channel to send messages to this connection
    pub sender: MessageSender,
}

impl Connection {
    fn watches(&self, collection: &str) -> bool {
        self.watching.is_empty() || self.watching.iter().any(|c| c == collection)
    }
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
}

impl ConnectionManager {
    /// Create a new connection manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection watching every collection.
    ///
    /// Returns the connection ID.
    pub fn register(&self, page: String, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        tracing::info!(conn_id = %conn_id, page = %page, "WebSocket connection registered");

        let connection = Connection {
            page,
            watching: Vec::new(),
            sender,
        };
        self.connections.insert(conn_id.clone(), connection);

        conn_id
    }

    /// Unregister a connection.
    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            tracing::info!(conn_id = %conn_id, page = %conn.page, "WebSocket connection unregistered");
        }
    }

    /// Restrict a connection to the given collections.
    pub fn watch(&self, conn_id: &str, collections: Vec<CollectionName>) -> bool {
        match self.connections.get_mut(conn_id) {
            Some(mut conn) => {
                conn.watching = collections;
                true
            }
            None => false,
        }
    }

    /// Send an event to every connection watching its collection.
    ///
    /// Returns the number of connections that received the message.
    pub fn broadcast_event(&self, event: &ViewEvent) -> usize {
        let collection = event.collection();
        let mut sent_count = 0;

        for entry in self.connections.iter() {
            let conn = entry.value();
            if conn.watches(collection)
                && conn
                    .sender
                    .send(ServerMessage::Change {
                        event: event.clone(),
                    })
                    .is_ok()
            {
                sent_count += 1;
            }
        }

        tracing::trace!(
            collection = %collection,
            recipients = sent_count,
            "Broadcast view event"
        );

        sent_count
    }

    /// Send a message to a specific connection.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) -> bool {
        if let Some(conn) = self.connections.get(conn_id) {
            conn.sender.send(message).is_ok()
        } else {
            false
        }
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// Forward every view event of the service to the connected viewers.
pub fn spawn_fanout(sync: &SyncHandle, manager: Arc<ConnectionManager>) {
    let mut events = sync.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    manager.broadcast_event(&event);
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Viewers missed view events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use courtside_engine::RecordId;

    fn removed(collection: &str) -> ViewEvent {
        ViewEvent::RecordsRemoved {
            collection: collection.into(),
            ids: vec![RecordId::persistent("1")],
        }
    }

    #[test]
    fn test_register_unregister() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let board = manager.register("courts".to_string(), tx.clone());
        let ticker = manager.register("courts".to_string(), tx);
        assert_ne!(board, ticker);
        assert_eq!(manager.connection_count(), 2);

        manager.unregister(&board);
        assert_eq!(manager.connection_count(), 1);
        assert!(!manager.send_to(&board, ServerMessage::Pong));
        assert!(manager.send_to(&ticker, ServerMessage::Pong));

        // Unregistering twice is harmless
        manager.unregister(&board);
        assert_eq!(manager.connection_count(), 1);
    }

    #[test]
    fn test_broadcast_respects_watch() {
        let manager = ConnectionManager::new();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        let conn1 = manager.register("messages".to_string(), tx1);
        let _conn2 = manager.register("courts".to_string(), tx2);
        assert!(manager.watch(&conn1, vec!["messages".into()]));

        let sent = manager.broadcast_event(&removed("matches"));
        assert_eq!(sent, 1);

        // conn1 only watches messages
        assert!(rx1.try_recv().is_err());

        let msg = rx2.try_recv().unwrap();
        assert!(matches!(msg, ServerMessage::Change { event } if event.collection() == "matches"));

        assert_eq!(manager.broadcast_event(&removed("messages")), 2);
    }

    #[test]
    fn test_send_to_unknown_connection() {
        let manager = ConnectionManager::new();
        assert!(!manager.send_to("missing", ServerMessage::Pong));
        assert!(!manager.watch("missing", Vec::new()));
    }
}
