//! # Courtside Engine
//!
//! A deterministic synchronization core for live, server-owned collections.
//!
//! This crate keeps a locally held view of a set of collections correct
//! while two independent sources change it: a change feed that pushes
//! confirmed inserts, updates and deletes in no guaranteed order, and a UI
//! that applies optimistic mutations before the backing store confirms them.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches the network; backing-store calls
//!   are described as [`StoreCall`] values for the caller to execute
//! - **Single writer**: every change to a [`ManagedCollection`] goes through
//!   [`Reconciler::merge`]
//! - **Idempotent**: duplicate feed deliveries are no-ops
//! - **Correlated by identity**: a confirmed record replaces the provisional
//!   one of the operation that created it, never one with equal content
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] is a JSON object with an `id`. Ids are either persistent
//! (assigned by the backing store) or provisional (`tmp-<n>`, assigned
//! locally while a create is in flight), see [`RecordId`].
//!
//! ### Pending writes
//!
//! Each optimistic mutation becomes a [`PendingWrite`]. Writes to the same
//! record are serialized: a second update waits until the first resolves.
//!
//! ### Reconciliation
//!
//! The [`Reconciler`] keeps the last confirmed value of every record next
//! to the visible one. A failed write restores the confirmed value, so a
//! confirmation that arrived in the meantime is never lost.
//!
//! ## Quick Start
//!
//! ```rust
//! use courtside_engine::{
//!     ChangeEvent, CollectionSchema, FeedBatch, FieldDef, FieldType, Record, RecordId,
//!     RecordOrder, Replica, Schema, StoreResponse,
//! };
//! use serde_json::json;
//!
//! // 1. Define a schema
//! let schema = Schema::new().with_collection(CollectionSchema::new(
//!     "matches",
//!     vec![FieldDef::required("court", FieldType::Int)],
//! ));
//!
//! // 2. Create a replica
//! let mut replica = Replica::new(schema, "session-1").with_correlation_field("client_op_id");
//!
//! // 3. Show a create before the backing store confirms it
//! let payload = json!({"court": 1}).as_object().cloned().unwrap();
//! let mutation = replica.create_optimistic("matches", payload).unwrap();
//! assert_eq!(mutation.id, RecordId::Provisional(1));
//! assert!(mutation.call.is_some());
//!
//! // 4. The change feed confirms it under a persistent id
//! let confirmed = Record::from_value(json!({
//!     "id": 42,
//!     "court": 1,
//!     "client_op_id": mutation.op_id,
//! }))
//! .unwrap();
//! replica
//!     .apply_feed("matches", FeedBatch::Live(ChangeEvent::insert(confirmed.clone())))
//!     .unwrap();
//! replica
//!     .resolve(&mutation.op_id, Ok(StoreResponse::Created(confirmed)))
//!     .unwrap();
//!
//! // 5. Exactly one record, under its real id
//! let order = RecordOrder::by("court");
//! let ids: Vec<String> = replica
//!     .list("matches", &order)
//!     .unwrap()
//!     .map(|r| r.id.to_string())
//!     .collect();
//! assert_eq!(ids, vec!["42"]);
//! ```

pub mod collection;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod order;
pub mod pending;
pub mod reconcile;
pub mod record;
pub mod replica;
pub mod schema;

// Re-export main types at crate root
pub use collection::{Listing, ManagedCollection};
pub use coordinator::{
    Mutation, MutationCoordinator, Resolution, Settled, StoreCall, StoreRequest, StoreResponse,
};
pub use error::Error;
pub use event::{ChangeEvent, ChangeKind, FeedBatch, RawChange, RawOperation};
pub use order::{RecordFilter, RecordOrder, SortDirection, SortKey};
pub use pending::{OperationId, PendingWrite, PendingWrites, WriteKind, WriteStatus};
pub use reconcile::{Conflict, MergeInput, Orphan, ReconcileResult, Reconciler, Supersession};
pub use record::{Payload, Record, RecordId, PROVISIONAL_PREFIX};
pub use replica::{FeedOutcome, Replica};
pub use schema::{CollectionSchema, FieldDef, FieldType, Schema};

/// Type aliases for clarity
pub type CollectionName = String;
