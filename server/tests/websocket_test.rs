//! Tests for the WebSocket protocol and view-event fan-out.

use std::sync::Arc;
use std::time::Duration;

use courtside_engine::{Record, RecordId};
use courtside_server::backend::MemoryBackend;
use courtside_server::feed::{LeaseState, Liveness};
use courtside_server::schema::{live_schema, MATCHES, MESSAGES, STORE_TABLES};
use courtside_server::service::{ServiceOptions, SyncService, ViewEvent};
use courtside_server::websocket::{spawn_fanout, ClientMessage, ConnectionManager, ServerMessage};
use serde_json::{json, Value};
use tokio::sync::mpsc;

mod websocket_protocol_tests {
    use super::*;

    #[test]
    fn test_watch_message() {
        let json = r#"{
            "type": "watch",
            "collections": ["matches", "messages"],
            "request_id": "req-001"
        }"#;

        match serde_json::from_str::<ClientMessage>(json).unwrap() {
            ClientMessage::Watch {
                collections,
                request_id,
            } => {
                assert_eq!(collections, vec!["matches", "messages"]);
                assert_eq!(request_id, Some("req-001".to_string()));
            }
            other => panic!("Expected Watch message, got {:?}", other),
        }
    }

    #[test]
    fn test_change_wire_format() {
        let message = ServerMessage::Change {
            event: ViewEvent::Superseded {
                collection: MATCHES.to_string(),
                provisional: RecordId::Provisional(3),
                confirmed: RecordId::persistent("42"),
            },
        };

        let value: Value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "change",
                "event": {
                    "type": "superseded",
                    "collection": "matches",
                    "provisional": "tmp-3",
                    "confirmed": "42"
                }
            })
        );
    }

    #[test]
    fn test_records_are_flat() {
        let record = Record::from_value(json!({"id": 7, "message_body": "Court 2 is open"})).unwrap();
        let message = ServerMessage::Change {
            event: ViewEvent::RecordsChanged {
                collection: MESSAGES.to_string(),
                records: vec![record],
            },
        };

        let value: Value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["event"]["type"], "records_changed");
        assert_eq!(value["event"]["records"][0]["id"], "7");
        assert_eq!(value["event"]["records"][0]["message_body"], "Court 2 is open");
    }

    #[test]
    fn test_liveness_wire_format() {
        let message = ServerMessage::Change {
            event: ViewEvent::LivenessChanged {
                collection: MATCHES.to_string(),
                liveness: Liveness {
                    state: LeaseState::Connecting,
                    consecutive_failures: 4,
                    stale: true,
                },
            },
        };

        let value: Value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value["event"]["liveness"],
            json!({"state": "connecting", "consecutive_failures": 4, "stale": true})
        );
    }
}

#[tokio::test]
async fn test_fanout_reaches_watching_viewers() {
    let store = Arc::new(MemoryBackend::new(STORE_TABLES));
    let sync = SyncService::start(store, live_schema(), ServiceOptions::default());

    let manager = ConnectionManager::new_shared();
    spawn_fanout(&sync, Arc::clone(&manager));

    let (board_tx, mut board_rx) = mpsc::unbounded_channel();
    let (ticker_tx, mut ticker_rx) = mpsc::unbounded_channel();
    let board = manager.register("courts".to_string(), board_tx);
    let ticker = manager.register("messages".to_string(), ticker_tx);
    manager.watch(&board, vec![MATCHES.to_string()]);
    manager.watch(&ticker, vec![MESSAGES.to_string()]);

    let payload = json!({"message_body": "Lunch break"})
        .as_object()
        .cloned()
        .unwrap();
    sync.create_optimistic(MESSAGES, payload).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match ticker_rx.recv().await {
                Some(ServerMessage::Change {
                    event: ViewEvent::RecordsChanged { records, .. },
                }) => return records,
                Some(_) => continue,
                None => panic!("viewer channel closed"),
            }
        }
    })
    .await
    .expect("expected the optimistic message");
    assert_eq!(received.len(), 1);
    assert!(received[0].is_provisional());

    // The board only sees matches
    while let Ok(message) = board_rx.try_recv() {
        if let ServerMessage::Change { event } = message {
            assert_eq!(event.collection(), MATCHES);
        }
    }
}
