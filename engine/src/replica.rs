//! The replica - schema, reconciler and coordinator behind one owner.
//!
//! A [`Replica`] is what an event loop owns. Every method takes `&mut self`
//! or `&self`, so serializing access to the replica serializes every change
//! to every managed collection.

use crate::{
    error::Result, FeedBatch, Listing, ManagedCollection, MergeInput, Mutation,
    MutationCoordinator, Payload, PendingWrites, ReconcileResult, Reconciler, Record,
    RecordId, RecordOrder, Resolution, Schema, StoreCall, StoreResponse,
};

/// What applying a feed delivery changed, and the calls it made necessary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedOutcome {
    pub result: ReconcileResult,
    /// Compensating deletes for confirmed records nobody wants
    pub calls: Vec<StoreCall>,
}

/// Locally held copy of a set of server-owned collections.
#[derive(Debug, Clone)]
pub struct Replica {
    schema: Schema,
    reconciler: Reconciler,
    coordinator: MutationCoordinator,
}

impl Replica {
    /// Create a replica managing every collection in `schema`.
    pub fn new(schema: Schema, session: impl Into<String>) -> Self {
        let mut reconciler = Reconciler::new();
        for name in schema.collections.keys() {
            reconciler.register(name.clone());
        }
        Self {
            schema,
            reconciler,
            coordinator: MutationCoordinator::new(session),
        }
    }

    /// Correlate creates with their confirmations through a payload field.
    ///
    /// The backing store must persist this field unchanged.
    pub fn with_correlation_field(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.reconciler = self.reconciler.with_correlation_field(field.clone());
        self.coordinator = self.coordinator.with_correlation_field(field);
        self
    }

    /// Get the schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The session operation ids are issued under.
    pub fn session(&self) -> &str {
        self.coordinator.session()
    }

    /// A managed collection.
    pub fn collection(&self, name: &str) -> Result<&ManagedCollection> {
        self.reconciler.collection(name)
    }

    /// List a collection's records in the requested order.
    pub fn list<'a>(&'a self, collection: &str, order: &'a RecordOrder) -> Result<Listing<'a>> {
        Ok(self.collection(collection)?.list(order))
    }

    /// Get a visible record. A provisional id that has since been confirmed
    /// finds the confirmed record.
    pub fn get(&self, collection: &str, id: &RecordId) -> Option<&Record> {
        let id = self.coordinator.resolve_id(collection, id);
        self.reconciler.get(collection, &id)
    }

    /// Writes awaiting the backing store.
    pub fn pending(&self) -> &PendingWrites {
        self.coordinator.pending()
    }

    /// Validate and show a new record; see
    /// [`MutationCoordinator::create_optimistic`].
    pub fn create_optimistic(&mut self, collection: &str, payload: Payload) -> Result<Mutation> {
        self.schema.validate_create(collection, &payload)?;
        self.coordinator
            .create_optimistic(&mut self.reconciler, collection, payload)
    }

    /// Validate and apply a patch; see
    /// [`MutationCoordinator::update_optimistic`].
    pub fn update_optimistic(
        &mut self,
        collection: &str,
        id: &RecordId,
        patch: Payload,
    ) -> Result<Mutation> {
        self.schema.validate_patch(collection, &patch)?;
        self.coordinator
            .update_optimistic(&mut self.reconciler, collection, id, patch)
    }

    /// Hide a record; see [`MutationCoordinator::delete_optimistic`].
    pub fn delete_optimistic(&mut self, collection: &str, id: &RecordId) -> Result<Mutation> {
        self.schema.get_collection(collection)?;
        self.coordinator
            .delete_optimistic(&mut self.reconciler, collection, id)
    }

    /// Apply a change-feed delivery.
    pub fn apply_feed(&mut self, collection: &str, batch: FeedBatch) -> Result<FeedOutcome> {
        let input = match batch {
            FeedBatch::Snapshot(records) => MergeInput::Snapshot(records),
            FeedBatch::Live(event) => MergeInput::Feed(event),
        };
        let result = self
            .reconciler
            .merge(collection, input, self.coordinator.pending())?;
        let calls = self.coordinator.observe(&result);
        Ok(FeedOutcome { result, calls })
    }

    /// Record the backing store's answer to a dispatched call.
    pub fn resolve(
        &mut self,
        op_id: &str,
        outcome: Result<StoreResponse>,
    ) -> Result<Resolution> {
        self.coordinator
            .resolve(&mut self.reconciler, op_id, outcome)
    }
}
