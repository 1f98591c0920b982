//! Change-feed subscriptions.
//!
//! Each [`Lease`] owns one task that keeps a collection's change channel
//! open. A session is: open the channel, fetch the full collection, deliver
//! that as a snapshot, then deliver live changes in the order the store
//! published them. Opening the channel first means nothing committed after
//! the fetch can be missed. When the channel is lost the task backs off and
//! starts a new session; the fresh snapshot heals whatever was missed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use courtside_engine::{
    error::Result, CollectionName, Error, FeedBatch, RecordFilter, RecordOrder,
};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;

use crate::backend::BackingStore;
use crate::backoff::Backoff;

/// Identifier of a lease, unique per subscriber.
pub type LeaseId = u64;

/// Lifecycle of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Connecting,
    Active,
    Closed,
}

/// Whether a collection's data is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Liveness {
    pub state: LeaseState,
    pub consecutive_failures: u32,
    /// Set once reconnecting has failed often enough to warn viewers
    pub stale: bool,
}

impl Liveness {
    fn connecting() -> Self {
        Self {
            state: LeaseState::Connecting,
            consecutive_failures: 0,
            stale: false,
        }
    }
}

/// Something a lease's task reports.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Batch {
        lease: LeaseId,
        collection: CollectionName,
        batch: FeedBatch,
    },
    Liveness {
        lease: LeaseId,
        collection: CollectionName,
        liveness: Liveness,
    },
}

/// Handle to one subscription. Dropping it closes the subscription.
#[derive(Debug)]
pub struct Lease {
    id: LeaseId,
    collection: CollectionName,
    liveness: Arc<watch::Sender<Liveness>>,
    shutdown: watch::Sender<bool>,
}

impl Lease {
    pub fn id(&self) -> LeaseId {
        self.id
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Watch the lease's liveness.
    pub fn liveness(&self) -> watch::Receiver<Liveness> {
        self.liveness.subscribe()
    }

    /// Current liveness.
    pub fn current(&self) -> Liveness {
        *self.liveness.borrow()
    }

    /// Stop delivering events and release the channel. Already delivered
    /// events stay applied.
    pub fn close(&self) {
        self.liveness.send_if_modified(|liveness| {
            let changed = liveness.state != LeaseState::Closed;
            liveness.state = LeaseState::Closed;
            changed
        });
        self.shutdown.send_replace(true);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens change-feed subscriptions against a backing store.
#[derive(Debug)]
pub struct ChangeFeedSubscriber<S> {
    store: Arc<S>,
    backoff: Backoff,
    stale_after: u32,
    next_lease: AtomicU64,
}

impl<S: BackingStore> ChangeFeedSubscriber<S> {
    /// Create a subscriber. A lease turns stale after `stale_after`
    /// consecutive failed attempts.
    pub fn new(store: Arc<S>, backoff: Backoff, stale_after: u32) -> Self {
        Self {
            store,
            backoff,
            stale_after: stale_after.max(1),
            next_lease: AtomicU64::new(1),
        }
    }

    /// Subscribe to a collection. `sink` receives every event of the lease
    /// and returns `false` once it no longer wants any.
    pub fn subscribe<F>(&self, collection: &str, sink: F) -> Lease
    where
        F: FnMut(FeedEvent) -> bool + Send + 'static,
    {
        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let liveness = Arc::new(watch::channel(Liveness::connecting()).0);
        let (shutdown, closed) = watch::channel(false);

        let task = LeaseTask {
            lease: id,
            collection: collection.to_string(),
            store: Arc::clone(&self.store),
            backoff: self.backoff,
            stale_after: self.stale_after,
            liveness: Arc::clone(&liveness),
            sink,
            failures: 0,
        };
        tokio::spawn(task.run(closed));

        Lease {
            id,
            collection: collection.to_string(),
            liveness,
            shutdown,
        }
    }
}

async fn until_closed(closed: &mut watch::Receiver<bool>) {
    // A dropped sender means the lease is gone, which also closes
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Why a session ended without an error.
enum SessionEnd {
    SinkGone,
}

struct LeaseTask<S, F> {
    lease: LeaseId,
    collection: CollectionName,
    store: Arc<S>,
    backoff: Backoff,
    stale_after: u32,
    liveness: Arc<watch::Sender<Liveness>>,
    sink: F,
    failures: u32,
}

impl<S, F> LeaseTask<S, F>
where
    S: BackingStore,
    F: FnMut(FeedEvent) -> bool + Send + 'static,
{
    async fn run(mut self, mut closed: watch::Receiver<bool>) {
        loop {
            let outcome = tokio::select! {
                _ = until_closed(&mut closed) => break,
                outcome = self.session() => outcome,
            };

            let error = match outcome {
                Ok(SessionEnd::SinkGone) => break,
                Err(error) => error,
            };

            self.failures = self.failures.saturating_add(1);
            let stale = self.failures >= self.stale_after;
            if stale {
                tracing::warn!(
                    collection = %self.collection,
                    failures = self.failures,
                    "Change feed unavailable, data is stale: {}",
                    error
                );
            } else {
                tracing::debug!(
                    collection = %self.collection,
                    failures = self.failures,
                    "Change feed lost: {}",
                    error
                );
            }
            if !self.set_liveness(Liveness {
                state: LeaseState::Connecting,
                consecutive_failures: self.failures,
                stale,
            }) {
                break;
            }

            let delay = self.backoff.delay(self.failures - 1);
            tokio::select! {
                _ = until_closed(&mut closed) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.liveness.send_if_modified(|liveness| {
            let changed = liveness.state != LeaseState::Closed;
            liveness.state = LeaseState::Closed;
            changed
        });
        tracing::debug!(collection = %self.collection, lease = self.lease, "Lease closed");
    }

    async fn session(&mut self) -> Result<SessionEnd> {
        tracing::debug!(collection = %self.collection, lease = self.lease, "Opening change feed");
        let mut changes = self.store.subscribe_changes(&self.collection).await?;
        let records = self
            .store
            .fetch_all(&self.collection, &RecordFilter::new(), &RecordOrder::new())
            .await?;

        let count = records.len();
        if !self.deliver(FeedBatch::Snapshot(records)) {
            return Ok(SessionEnd::SinkGone);
        }
        self.failures = 0;
        if !self.set_liveness(Liveness {
            state: LeaseState::Active,
            consecutive_failures: 0,
            stale: false,
        }) {
            return Ok(SessionEnd::SinkGone);
        }
        tracing::info!(collection = %self.collection, records = count, "Change feed active");

        while let Some(change) = changes.next().await {
            let change = change?;
            match change.normalize() {
                Ok(event) => {
                    if !self.deliver(FeedBatch::Live(event)) {
                        return Ok(SessionEnd::SinkGone);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        collection = %self.collection,
                        "Dropping malformed change: {}",
                        e
                    );
                }
            }
        }
        Err(Error::Transport("change feed ended".into()))
    }

    fn deliver(&mut self, batch: FeedBatch) -> bool {
        (self.sink)(FeedEvent::Batch {
            lease: self.lease,
            collection: self.collection.clone(),
            batch,
        })
    }

    /// Publish a liveness change. Returns `false` if the sink is gone.
    fn set_liveness(&mut self, next: Liveness) -> bool {
        let changed = self.liveness.send_if_modified(|liveness| {
            if liveness.state == LeaseState::Closed || *liveness == next {
                return false;
            }
            *liveness = next;
            true
        });
        if !changed {
            return true;
        }
        (self.sink)(FeedEvent::Liveness {
            lease: self.lease,
            collection: self.collection.clone(),
            liveness: next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use courtside_engine::{ChangeKind, Payload};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn subscriber(store: &MemoryBackend, stale_after: u32) -> ChangeFeedSubscriber<MemoryBackend> {
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(5));
        ChangeFeedSubscriber::new(Arc::new(store.clone()), backoff, stale_after)
    }

    fn channel_sink() -> (
        impl FnMut(FeedEvent) -> bool + Send + 'static,
        mpsc::UnboundedReceiver<FeedEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (move |event| tx.send(event).is_ok(), rx)
    }

    async fn next_batch(events: &mut mpsc::UnboundedReceiver<FeedEvent>) -> FeedBatch {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("timed out waiting for a batch")
                .expect("feed ended");
            if let FeedEvent::Batch { batch, .. } = event {
                return batch;
            }
        }
    }

    async fn wait_for_state(lease: &Lease, state: LeaseState) -> Liveness {
        let mut liveness = lease.liveness();
        let seen = tokio::time::timeout(
            Duration::from_secs(2),
            liveness.wait_for(|l| l.state == state),
        )
        .await
        .expect("timed out waiting for state")
        .expect("liveness sender dropped");
        *seen
    }

    #[tokio::test]
    async fn test_snapshot_precedes_live_events() {
        let store = MemoryBackend::new(["matches"]);
        store
            .create("matches", payload(json!({"court": 1})))
            .await
            .unwrap();

        let (sink, mut events) = channel_sink();
        let lease = subscriber(&store, 3).subscribe("matches", sink);

        match next_batch(&mut events).await {
            FeedBatch::Snapshot(records) => assert_eq!(records.len(), 1),
            other => panic!("expected snapshot, got {:?}", other),
        }
        wait_for_state(&lease, LeaseState::Active).await;

        store
            .create("matches", payload(json!({"court": 2})))
            .await
            .unwrap();
        match next_batch(&mut events).await {
            FeedBatch::Live(event) => {
                assert_eq!(event.kind, ChangeKind::Insert);
                assert_eq!(event.record.field("court"), Some(&json!(2)));
            }
            other => panic!("expected live event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reconnects_with_fresh_snapshot() {
        let store = MemoryBackend::new(["matches"]);
        let (sink, mut events) = channel_sink();
        let lease = subscriber(&store, 3).subscribe("matches", sink);
        assert!(matches!(next_batch(&mut events).await, FeedBatch::Snapshot(r) if r.is_empty()));
        wait_for_state(&lease, LeaseState::Active).await;

        store.disconnect_feeds();
        // Written while nobody listens
        store
            .create("matches", payload(json!({"court": 3})))
            .await
            .unwrap();

        match next_batch(&mut events).await {
            FeedBatch::Snapshot(records) => assert_eq!(records.len(), 1),
            other => panic!("expected snapshot after reconnect, got {:?}", other),
        }
        let liveness = wait_for_state(&lease, LeaseState::Active).await;
        assert_eq!(liveness.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_failures_turn_stale_then_recover() {
        let store = MemoryBackend::new(["matches"]);
        store.fail_next_subscribes(2);
        store.fail_next_fetches(1);

        let (sink, mut events) = channel_sink();
        let lease = subscriber(&store, 2).subscribe("matches", sink);

        let mut saw_stale = false;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                FeedEvent::Liveness { liveness, .. } if liveness.stale => {
                    assert!(liveness.consecutive_failures >= 2);
                    saw_stale = true;
                }
                FeedEvent::Batch { .. } => break,
                _ => {}
            }
        }
        assert!(saw_stale);

        let liveness = wait_for_state(&lease, LeaseState::Active).await;
        assert!(!liveness.stale);
    }

    #[tokio::test]
    async fn test_close_stops_delivery() {
        let store = MemoryBackend::new(["matches"]);
        let (sink, mut events) = channel_sink();
        let lease = subscriber(&store, 3).subscribe("matches", sink);
        next_batch(&mut events).await;
        wait_for_state(&lease, LeaseState::Active).await;

        lease.close();
        assert_eq!(lease.current().state, LeaseState::Closed);

        // The task releases its channel
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.subscriber_count("matches") > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        store
            .create("matches", payload(json!({"court": 1})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, FeedEvent::Batch { .. }), "delivered after close");
        }
    }
}
