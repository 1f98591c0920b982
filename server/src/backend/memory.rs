//! In-process backing store.
//!
//! Behaves like the PostgreSQL store as far as the sync service can tell:
//! numeric ids, a `created_at` default, and a change channel per
//! collection. Faults can be injected to exercise the failure paths.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use courtside_engine::{
    error::Result, Error, Payload, RawChange, RawOperation, Record, RecordFilter, RecordId,
    RecordOrder,
};
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast::{self, error::RecvError};

use super::{unknown_collection, BackingStore, ChangeStream};

const FEED_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Faults {
    write_failures: VecDeque<Error>,
    write_delay: Duration,
    fetch_failures: u32,
    subscribe_failures: u32,
}

#[derive(Debug)]
struct Inner {
    tables: DashMap<String, BTreeMap<u64, Payload>>,
    feeds: DashMap<String, broadcast::Sender<RawChange>>,
    next_id: AtomicU64,
    faults: Mutex<Faults>,
}

/// In-memory store with a broadcast change feed.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    /// Create a store holding the given (empty) collections.
    pub fn new<I, S>(collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tables = DashMap::new();
        let feeds = DashMap::new();
        for name in collections {
            let name = name.into();
            tables.insert(name.clone(), BTreeMap::new());
            feeds.insert(name, broadcast::channel(FEED_CAPACITY).0);
        }
        Self {
            inner: Arc::new(Inner {
                tables,
                feeds,
                next_id: AtomicU64::new(1),
                faults: Mutex::new(Faults::default()),
            }),
        }
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.inner
            .faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next write fail with `error` instead of being applied.
    pub fn fail_next_write(&self, error: Error) {
        self.faults().write_failures.push_back(error);
    }

    /// Hold every write for `delay` before applying it. A caller that stops
    /// waiting does not stop the write.
    pub fn set_write_delay(&self, delay: Duration) {
        self.faults().write_delay = delay;
    }

    /// Make the next `count` fetches fail with a transport error.
    pub fn fail_next_fetches(&self, count: u32) {
        self.faults().fetch_failures = count;
    }

    /// Make the next `count` subscribe attempts fail with a transport error.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.faults().subscribe_failures = count;
    }

    /// Drop every open change channel, as a lost connection would.
    pub fn disconnect_feeds(&self) {
        for mut feed in self.inner.feeds.iter_mut() {
            *feed.value_mut() = broadcast::channel(FEED_CAPACITY).0;
        }
    }

    /// Number of open change channels of a collection.
    pub fn subscriber_count(&self, collection: &str) -> usize {
        self.inner
            .feeds
            .get(collection)
            .map(|feed| feed.receiver_count())
            .unwrap_or(0)
    }

    /// Current rows of a collection, by id.
    pub fn rows(&self, collection: &str) -> Vec<Record> {
        self.inner
            .tables
            .get(collection)
            .map(|table| table.iter().map(|(id, row)| to_record(*id, row)).collect())
            .unwrap_or_default()
    }

    /// Run a write after the configured delay, unless a failure is queued.
    async fn write<T, F>(&self, apply: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
    {
        let (failure, delay) = {
            let mut faults = self.faults();
            (faults.write_failures.pop_front(), faults.write_delay)
        };
        if let Some(error) = failure {
            return Err(error);
        }
        if delay.is_zero() {
            return apply(self.inner.as_ref());
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            apply(inner.as_ref())
        })
        .await
        .map_err(|e| Error::Transport(e.to_string()))?
    }
}

impl Inner {
    fn publish(&self, collection: &str, change: RawChange) {
        if let Some(feed) = self.feeds.get(collection) {
            // No subscribers is fine
            let _ = feed.send(change);
        }
    }
}

fn to_record(id: u64, row: &Payload) -> Record {
    Record::new(RecordId::persistent(id.to_string()), row.clone())
}

fn parse_id(id: &str) -> Result<u64> {
    id.parse()
        .map_err(|_| Error::WriteRejected(format!("invalid id '{}'", id)))
}

impl BackingStore for MemoryBackend {
    async fn fetch_all(
        &self,
        collection: &str,
        filter: &RecordFilter,
        order: &RecordOrder,
    ) -> Result<Vec<Record>> {
        {
            let mut faults = self.faults();
            if faults.fetch_failures > 0 {
                faults.fetch_failures -= 1;
                return Err(Error::Transport("fetch failed".into()));
            }
        }

        let table = self
            .inner
            .tables
            .get(collection)
            .ok_or_else(|| unknown_collection(collection))?;
        let mut records: Vec<Record> = table
            .iter()
            .map(|(id, row)| to_record(*id, row))
            .filter(|record| filter.matches(record))
            .collect();
        records.sort_by(|a, b| order.compare(a, b));
        Ok(records)
    }

    async fn create(&self, collection: &str, payload: Payload) -> Result<Record> {
        let collection = collection.to_string();
        self.write(move |inner| {
            let mut table = inner
                .tables
                .get_mut(&collection)
                .ok_or_else(|| unknown_collection(&collection))?;

            let mut row = payload;
            row.remove("id");
            row.entry("created_at")
                .or_insert_with(|| chrono::Utc::now().to_rfc3339().into());

            let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
            table.insert(id, row.clone());
            drop(table);

            let record = to_record(id, &row);
            inner.publish(
                &collection,
                RawChange {
                    operation: RawOperation::Insert,
                    old_record: None,
                    new_record: Some(record.to_value()),
                },
            );
            Ok(record)
        })
        .await
    }

    async fn update(&self, collection: &str, id: &str, patch: Payload) -> Result<()> {
        let collection = collection.to_string();
        let id = parse_id(id)?;
        self.write(move |inner| {
            let mut table = inner
                .tables
                .get_mut(&collection)
                .ok_or_else(|| unknown_collection(&collection))?;
            let row = table
                .get_mut(&id)
                .ok_or_else(|| Error::RecordNotFound(RecordId::persistent(id.to_string())))?;

            let old = to_record(id, row);
            let mut updated = old.clone();
            updated.merge(&patch);
            *row = updated.fields.clone();
            drop(table);

            inner.publish(
                &collection,
                RawChange {
                    operation: RawOperation::Update,
                    old_record: Some(old.to_value()),
                    new_record: Some(updated.to_value()),
                },
            );
            Ok(())
        })
        .await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let collection = collection.to_string();
        let id = parse_id(id)?;
        self.write(move |inner| {
            let removed = inner
                .tables
                .get_mut(&collection)
                .ok_or_else(|| unknown_collection(&collection))?
                .remove(&id);

            if let Some(row) = removed {
                inner.publish(
                    &collection,
                    RawChange {
                        operation: RawOperation::Delete,
                        old_record: Some(to_record(id, &row).to_value()),
                        new_record: None,
                    },
                );
            }
            Ok(())
        })
        .await
    }

    async fn subscribe_changes(&self, collection: &str) -> Result<ChangeStream> {
        {
            let mut faults = self.faults();
            if faults.subscribe_failures > 0 {
                faults.subscribe_failures -= 1;
                return Err(Error::Transport("subscribe failed".into()));
            }
        }

        let receiver = self
            .inner
            .feeds
            .get(collection)
            .ok_or_else(|| unknown_collection(collection))?
            .subscribe();

        let stream = futures::stream::unfold(Some(receiver), |receiver| async move {
            let mut receiver = receiver?;
            match receiver.recv().await {
                Ok(change) => Some((Ok(change), Some(receiver))),
                Err(RecvError::Lagged(missed)) => Some((
                    Err(Error::Transport(format!("change feed lagged by {}", missed))),
                    None,
                )),
                Err(RecvError::Closed) => {
                    Some((Err(Error::Transport("change feed closed".into())), None))
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courtside_engine::ChangeKind;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_create_assigns_ids_and_publishes() {
        let store = MemoryBackend::new(["messages"]);
        let mut changes = store.subscribe_changes("messages").await.unwrap();

        let record = store
            .create("messages", payload(json!({"message_body": "hi"})))
            .await
            .unwrap();
        assert_eq!(record.id, RecordId::persistent("1"));
        assert!(record.field("created_at").is_some());

        let event = changes.next().await.unwrap().unwrap().normalize().unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.record, record);
    }

    #[tokio::test]
    async fn test_update_merges_and_delete_is_idempotent() {
        let store = MemoryBackend::new(["matches"]);
        let record = store
            .create("matches", payload(json!({"court": 1, "team1_score": 0})))
            .await
            .unwrap();
        let id = record.id.to_string();

        store
            .update("matches", &id, payload(json!({"team1_score": 2})))
            .await
            .unwrap();
        let rows = store.rows("matches");
        assert_eq!(rows[0].field("team1_score"), Some(&json!(2)));
        assert_eq!(rows[0].field("court"), Some(&json!(1)));

        store.delete("matches", &id).await.unwrap();
        store.delete("matches", &id).await.unwrap();
        assert!(store.rows("matches").is_empty());

        let missing = store
            .update("matches", &id, payload(json!({"court": 2})))
            .await;
        assert!(matches!(missing, Err(Error::RecordNotFound(_))));
    }

    #[tokio::test]
    async fn test_fetch_filters_and_orders() {
        let store = MemoryBackend::new(["matches"]);
        for (court, finished) in [(3, false), (1, false), (2, true)] {
            store
                .create(
                    "matches",
                    payload(json!({"court": court, "is_finished": finished})),
                )
                .await
                .unwrap();
        }
        let filter = RecordFilter::new().field_eq("is_finished", false);
        let records = store
            .fetch_all("matches", &filter, &RecordOrder::by("court"))
            .await
            .unwrap();
        let courts: Vec<_> = records.iter().map(|r| r.field("court").cloned()).collect();
        assert_eq!(courts, vec![Some(json!(1)), Some(json!(3))]);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = MemoryBackend::new(["matches"]);
        store.fail_next_write(Error::WriteRejected("check violation".into()));
        let rejected = store.create("matches", payload(json!({"court": 1}))).await;
        assert!(matches!(rejected, Err(Error::WriteRejected(_))));
        assert!(store.rows("matches").is_empty());

        store.fail_next_fetches(1);
        let order = RecordOrder::new();
        assert!(store
            .fetch_all("matches", &RecordFilter::new(), &order)
            .await
            .is_err());
        assert!(store
            .fetch_all("matches", &RecordFilter::new(), &order)
            .await
            .is_ok());

        let unknown = store.create("teams", payload(json!({}))).await;
        assert!(matches!(unknown, Err(Error::CollectionNotFound(_))));
    }

    #[tokio::test]
    async fn test_disconnect_ends_streams() {
        let store = MemoryBackend::new(["matches"]);
        let mut changes = store.subscribe_changes("matches").await.unwrap();
        assert_eq!(store.subscriber_count("matches"), 1);

        store.disconnect_feeds();
        assert!(matches!(changes.next().await, Some(Err(Error::Transport(_)))));
        assert!(changes.next().await.is_none());
    }

    #[tokio::test]
    async fn test_delayed_write_completes_without_caller() {
        let store = MemoryBackend::new(["matches"]);
        store.set_write_delay(Duration::from_millis(50));
        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            store.create("matches", payload(json!({"court": 1}))),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.rows("matches").len(), 1);
    }
}
