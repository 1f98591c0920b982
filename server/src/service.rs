//! The sync service: one task that owns the replica.
//!
//! Every read, optimistic write, feed delivery and backing-store answer is a
//! [`Command`] on one queue, handled to completion before the next. Nothing
//! inside a command awaits; backing-store calls run as spawned tasks and
//! come back through the queue as [`Command::Resolved`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use courtside_engine::{
    error::Result, CollectionName, Error, FeedBatch, Mutation, OperationId, Payload,
    ReconcileResult, Record, RecordFilter, RecordId, RecordOrder, Replica, Schema, Settled,
    StoreCall, StoreResponse,
};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::backend::{self, BackingStore};
use crate::backoff::Backoff;
use crate::config::Config;
use crate::feed::{ChangeFeedSubscriber, FeedEvent, Lease, LeaseId, LeaseState, Liveness};

const EVENT_CAPACITY: usize = 1024;

/// Field stamped with the local time on creates, when a collection has one.
const CREATED_AT: &str = "created_at";

/// Settings of a sync service.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Prefix of every operation id; must be unique per process
    pub session: String,
    pub correlation_field: Option<String>,
    pub write_timeout: Duration,
    pub feed_backoff: Backoff,
    pub stale_after_failures: u32,
}

impl ServiceOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            session: uuid::Uuid::new_v4().to_string(),
            correlation_field: config.correlation_field.clone(),
            write_timeout: config.write_timeout,
            feed_backoff: config.feed_backoff,
            stale_after_failures: config.stale_after_failures,
        }
    }
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            session: uuid::Uuid::new_v4().to_string(),
            correlation_field: Some("client_op_id".to_string()),
            write_timeout: Duration::from_secs(5),
            feed_backoff: Backoff::default(),
            stale_after_failures: 3,
        }
    }
}

/// A change viewers should see.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewEvent {
    /// Records inserted or changed, with their current values
    RecordsChanged {
        collection: CollectionName,
        records: Vec<Record>,
    },
    RecordsRemoved {
        collection: CollectionName,
        ids: Vec<RecordId>,
    },
    /// A provisional record now lives under its confirmed id
    Superseded {
        collection: CollectionName,
        provisional: RecordId,
        confirmed: RecordId,
    },
    LivenessChanged {
        collection: CollectionName,
        liveness: Liveness,
    },
    /// A write was rolled back
    WriteFailed {
        collection: CollectionName,
        op_id: OperationId,
        id: RecordId,
        error: String,
    },
}

impl ViewEvent {
    /// The collection the event is about.
    pub fn collection(&self) -> &str {
        match self {
            ViewEvent::RecordsChanged { collection, .. }
            | ViewEvent::RecordsRemoved { collection, .. }
            | ViewEvent::Superseded { collection, .. }
            | ViewEvent::LivenessChanged { collection, .. }
            | ViewEvent::WriteFailed { collection, .. } => collection,
        }
    }
}

/// An optimistic mutation that has been applied locally.
#[derive(Debug)]
pub struct Submitted {
    pub op_id: OperationId,
    /// The record's id; provisional for creates
    pub id: RecordId,
    /// The record as it is now visible, `None` after a delete
    pub record: Option<Record>,
    outcome: oneshot::Receiver<Result<()>>,
}

impl Submitted {
    /// Wait until the backing store has accepted or refused the write.
    pub async fn outcome(self) -> Result<()> {
        self.outcome.await.map_err(|_| Error::QueueClosed)?
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

/// Work for the service loop.
#[derive(Debug)]
pub enum Command {
    List {
        collection: CollectionName,
        filter: RecordFilter,
        order: RecordOrder,
        reply: Reply<Vec<Record>>,
    },
    Get {
        collection: CollectionName,
        id: RecordId,
        reply: Reply<Option<Record>>,
    },
    Create {
        collection: CollectionName,
        payload: Payload,
        reply: Reply<Submitted>,
    },
    Update {
        collection: CollectionName,
        id: RecordId,
        patch: Payload,
        reply: Reply<Submitted>,
    },
    Delete {
        collection: CollectionName,
        id: RecordId,
        reply: Reply<Submitted>,
    },
    Liveness {
        collection: CollectionName,
        reply: Reply<Liveness>,
    },
    PendingCount {
        reply: Reply<usize>,
    },
    Feed(FeedEvent),
    Resolved {
        op_id: OperationId,
        outcome: Result<StoreResponse>,
    },
}

/// Cloneable handle to a running [`SyncService`].
#[derive(Debug, Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ViewEvent>,
}

impl SyncHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| Error::QueueClosed)?;
        response.await.map_err(|_| Error::QueueClosed)?
    }

    /// Visible records of a collection, in `order`.
    pub async fn list(
        &self,
        collection: &str,
        filter: RecordFilter,
        order: RecordOrder,
    ) -> Result<Vec<Record>> {
        let collection = collection.to_string();
        self.request(|reply| Command::List {
            collection,
            filter,
            order,
            reply,
        })
        .await
    }

    /// A visible record. Stale provisional ids find the confirmed record.
    pub async fn get(&self, collection: &str, id: RecordId) -> Result<Option<Record>> {
        let collection = collection.to_string();
        self.request(|reply| Command::Get {
            collection,
            id,
            reply,
        })
        .await
    }

    pub async fn create_optimistic(&self, collection: &str, payload: Payload) -> Result<Submitted> {
        let collection = collection.to_string();
        self.request(|reply| Command::Create {
            collection,
            payload,
            reply,
        })
        .await
    }

    pub async fn update_optimistic(
        &self,
        collection: &str,
        id: RecordId,
        patch: Payload,
    ) -> Result<Submitted> {
        let collection = collection.to_string();
        self.request(|reply| Command::Update {
            collection,
            id,
            patch,
            reply,
        })
        .await
    }

    pub async fn delete_optimistic(&self, collection: &str, id: RecordId) -> Result<Submitted> {
        let collection = collection.to_string();
        self.request(|reply| Command::Delete {
            collection,
            id,
            reply,
        })
        .await
    }

    /// Liveness of a collection's change feed.
    pub async fn liveness(&self, collection: &str) -> Result<Liveness> {
        let collection = collection.to_string();
        self.request(|reply| Command::Liveness { collection, reply })
            .await
    }

    /// Number of writes awaiting the backing store.
    pub async fn pending_count(&self) -> Result<usize> {
        self.request(|reply| Command::PendingCount { reply }).await
    }

    /// Receive every [`ViewEvent`] published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ViewEvent> {
        self.events.subscribe()
    }
}

struct Waiter {
    target: RecordId,
    reply: oneshot::Sender<Result<()>>,
}

/// Owner of the replica and of every change-feed lease.
pub struct SyncService<S> {
    replica: Replica,
    store: Arc<S>,
    subscriber: ChangeFeedSubscriber<S>,
    leases: HashMap<CollectionName, Lease>,
    liveness: HashMap<CollectionName, Liveness>,
    waiters: HashMap<OperationId, Waiter>,
    commands: mpsc::UnboundedReceiver<Command>,
    requeue: mpsc::WeakUnboundedSender<Command>,
    events: broadcast::Sender<ViewEvent>,
    write_timeout: Duration,
}

impl<S: BackingStore> SyncService<S> {
    /// Start the service on the current runtime, subscribed to every
    /// collection of `schema`.
    ///
    /// The service stops once every handle is dropped.
    pub fn start(store: Arc<S>, schema: Schema, options: ServiceOptions) -> SyncHandle {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let mut replica = Replica::new(schema, options.session.clone());
        if let Some(field) = &options.correlation_field {
            replica = replica.with_correlation_field(field.clone());
        }

        let mut service = Self {
            replica,
            subscriber: ChangeFeedSubscriber::new(
                Arc::clone(&store),
                options.feed_backoff,
                options.stale_after_failures,
            ),
            store,
            leases: HashMap::new(),
            liveness: HashMap::new(),
            waiters: HashMap::new(),
            commands,
            requeue: commands_tx.downgrade(),
            events: events.clone(),
            write_timeout: options.write_timeout,
        };

        let mut collections: Vec<CollectionName> =
            service.replica.schema().collections.keys().cloned().collect();
        collections.sort();
        for collection in collections {
            service.subscribe(collection);
        }

        tracing::info!(session = %options.session, "Sync service started");
        tokio::spawn(service.run());

        SyncHandle {
            commands: commands_tx,
            events,
        }
    }

    fn subscribe(&mut self, collection: CollectionName) {
        let requeue = self.requeue.clone();
        let lease = self.subscriber.subscribe(&collection, move |event| {
            requeue
                .upgrade()
                .is_some_and(|commands| commands.send(Command::Feed(event)).is_ok())
        });
        self.liveness.insert(collection.clone(), lease.current());
        self.leases.insert(collection, lease);
    }

    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            self.handle(command);
        }
        for lease in self.leases.values() {
            lease.close();
        }
        tracing::info!("Sync service stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::List {
                collection,
                filter,
                order,
                reply,
            } => {
                let listing = self.replica.list(&collection, &order).map(|listing| {
                    listing
                        .filter(|record| filter.matches(record))
                        .cloned()
                        .collect()
                });
                let _ = reply.send(listing);
            }
            Command::Get {
                collection,
                id,
                reply,
            } => {
                let record = self
                    .replica
                    .collection(&collection)
                    .map(|_| self.replica.get(&collection, &id).cloned());
                let _ = reply.send(record);
            }
            Command::Create {
                collection,
                mut payload,
                reply,
            } => {
                self.stamp_created_at(&collection, &mut payload);
                let mutation = self.replica.create_optimistic(&collection, payload);
                let _ = reply.send(mutation.map(|m| self.submitted(&collection, m)));
            }
            Command::Update {
                collection,
                id,
                patch,
                reply,
            } => {
                let mutation = self.replica.update_optimistic(&collection, &id, patch);
                let _ = reply.send(mutation.map(|m| self.submitted(&collection, m)));
            }
            Command::Delete {
                collection,
                id,
                reply,
            } => {
                let mutation = self.replica.delete_optimistic(&collection, &id);
                let _ = reply.send(mutation.map(|m| self.submitted(&collection, m)));
                self.sweep_waiters();
            }
            Command::Liveness { collection, reply } => {
                let liveness = self
                    .liveness
                    .get(&collection)
                    .copied()
                    .ok_or(Error::CollectionNotFound(collection));
                let _ = reply.send(liveness);
            }
            Command::PendingCount { reply } => {
                let _ = reply.send(Ok(self.replica.pending().len()));
            }
            Command::Feed(event) => self.feed(event),
            Command::Resolved { op_id, outcome } => self.resolved(op_id, outcome),
        }
    }

    fn stamp_created_at(&self, collection: &str, payload: &mut Payload) {
        let declared = self
            .replica
            .schema()
            .get_collection(collection)
            .is_ok_and(|schema| schema.fields.iter().any(|f| f.name == CREATED_AT));
        if declared && !payload.contains_key(CREATED_AT) {
            payload.insert(
                CREATED_AT.to_string(),
                chrono::Utc::now().to_rfc3339().into(),
            );
        }
    }

    fn submitted(&mut self, collection: &str, mutation: Mutation) -> Submitted {
        let Mutation {
            op_id,
            id,
            call,
            result,
        } = mutation;
        tracing::debug!(
            collection = %collection,
            op_id = %op_id,
            id = %id,
            dispatched = call.is_some(),
            "Optimistic mutation applied"
        );
        self.publish(collection, &result);
        if let Some(call) = call {
            self.dispatch(call);
        }

        let (reply, outcome) = oneshot::channel();
        if self.replica.pending().get(&op_id).is_some() {
            self.waiters.insert(
                op_id.clone(),
                Waiter {
                    target: id.clone(),
                    reply,
                },
            );
        } else {
            // Nothing to wait for, e.g. deleting a record that was never stored
            let _ = reply.send(Ok(()));
        }

        Submitted {
            record: self.replica.get(collection, &id).cloned(),
            op_id,
            id,
            outcome,
        }
    }

    fn dispatch(&self, call: StoreCall) {
        let store = Arc::clone(&self.store);
        let requeue = self.requeue.clone();
        let timeout = self.write_timeout;
        tracing::debug!(
            collection = %call.collection,
            op_id = %call.op_id,
            "Dispatching backing-store call"
        );

        tokio::spawn(async move {
            let op_id = call.op_id.clone();
            let outcome =
                match tokio::time::timeout(timeout, backend::dispatch(store.as_ref(), call)).await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::WriteTimedOut {
                        op_id: op_id.clone(),
                        after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    }),
                };
            if let Some(commands) = requeue.upgrade() {
                let _ = commands.send(Command::Resolved { op_id, outcome });
            }
        });
    }

    fn feed(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Batch {
                lease,
                collection,
                batch,
            } => {
                if !self.is_current(&collection, lease) {
                    tracing::debug!(
                        collection = %collection,
                        lease,
                        "Dropping delivery from closed lease"
                    );
                    return;
                }
                let snapshot = matches!(batch, FeedBatch::Snapshot(_));
                let size = batch.len();
                match self.replica.apply_feed(&collection, batch) {
                    Ok(outcome) => {
                        if snapshot {
                            tracing::debug!(
                                collection = %collection,
                                records = size,
                                changed = outcome.result.upserted.len() + outcome.result.removed.len(),
                                "Applied snapshot"
                            );
                        }
                        for conflict in &outcome.result.conflicts {
                            tracing::warn!(
                                collection = %collection,
                                id = %conflict.id,
                                "Conflicting confirmations, keeping the latest"
                            );
                        }
                        for orphan in &outcome.result.orphaned {
                            tracing::info!(
                                collection = %collection,
                                op_id = %orphan.op_id,
                                id = %orphan.id,
                                "Cancelled create landed, deleting it again"
                            );
                        }
                        self.publish(&collection, &outcome.result);
                        for call in outcome.calls {
                            self.dispatch(call);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(collection = %collection, "Rejected feed delivery: {}", e);
                    }
                }
            }
            FeedEvent::Liveness {
                lease,
                collection,
                liveness,
            } => {
                if !self.is_current(&collection, lease) {
                    return;
                }
                if liveness.state == LeaseState::Active {
                    tracing::debug!(collection = %collection, "Collection is live");
                }
                self.liveness.insert(collection.clone(), liveness);
                let _ = self.events.send(ViewEvent::LivenessChanged {
                    collection,
                    liveness,
                });
            }
        }
    }

    fn is_current(&self, collection: &str, lease: LeaseId) -> bool {
        self.leases.get(collection).is_some_and(|current| {
            current.id() == lease && current.current().state != LeaseState::Closed
        })
    }

    fn resolved(&mut self, op_id: OperationId, outcome: Result<StoreResponse>) {
        let collection = match self.replica.pending().get(&op_id) {
            Some(write) => write.collection.clone(),
            None => {
                tracing::warn!(op_id = %op_id, "Answer for an unknown write");
                return;
            }
        };

        match self.replica.resolve(&op_id, outcome) {
            Ok(resolution) => {
                self.publish(&collection, &resolution.result);
                for call in resolution.calls {
                    self.dispatch(call);
                }
                for settled in resolution.settled {
                    self.settle(settled);
                }
            }
            Err(e) => {
                tracing::warn!(op_id = %op_id, "Could not resolve write: {}", e);
            }
        }
        self.sweep_waiters();
    }

    fn settle(&mut self, settled: Settled) {
        if let Err(error) = &settled.outcome {
            tracing::warn!(
                collection = %settled.collection,
                op_id = %settled.op_id,
                id = %settled.target,
                status = ?settled.status,
                "Write failed and was rolled back: {}",
                error
            );
            let _ = self.events.send(ViewEvent::WriteFailed {
                collection: settled.collection.clone(),
                op_id: settled.op_id.clone(),
                id: settled.target.clone(),
                error: error.to_string(),
            });
        }
        if let Some(waiter) = self.waiters.remove(&settled.op_id) {
            let _ = waiter.reply.send(settled.outcome);
        }
    }

    /// Fail waiters whose write was dropped without running, which happens
    /// when the record it targets was deleted before it was stored.
    fn sweep_waiters(&mut self) {
        let pending = self.replica.pending();
        let dropped: Vec<OperationId> = self
            .waiters
            .keys()
            .filter(|op_id| pending.get(op_id).is_none())
            .cloned()
            .collect();
        for op_id in dropped {
            if let Some(waiter) = self.waiters.remove(&op_id) {
                let _ = waiter.reply.send(Err(Error::RecordNotFound(waiter.target)));
            }
        }
    }

    fn publish(&self, collection: &str, result: &ReconcileResult) {
        for supersession in &result.superseded {
            let _ = self.events.send(ViewEvent::Superseded {
                collection: collection.to_string(),
                provisional: supersession.provisional.clone(),
                confirmed: supersession.confirmed.clone(),
            });
        }
        if !result.upserted.is_empty() {
            let records = result
                .upserted
                .iter()
                .filter_map(|id| self.replica.get(collection, id).cloned())
                .collect();
            let _ = self.events.send(ViewEvent::RecordsChanged {
                collection: collection.to_string(),
                records,
            });
        }
        if !result.removed.is_empty() {
            let _ = self.events.send(ViewEvent::RecordsRemoved {
                collection: collection.to_string(),
                ids: result.removed.clone(),
            });
        }
    }
}
