//! Backing stores: where records are persisted and where their changes
//! are published.
//!
//! The sync service only ever talks to a store through [`BackingStore`].
//! Errors follow the engine's taxonomy: a store that refused a write
//! returns [`Error::WriteRejected`], everything network-shaped returns
//! [`Error::Transport`].

mod memory;
mod postgres;

pub use memory::MemoryBackend;
pub use postgres::PgBackend;

use std::future::Future;

use courtside_engine::{
    error::Result, Error, Payload, RawChange, Record, RecordFilter, RecordOrder, StoreCall,
    StoreRequest, StoreResponse,
};
use futures::stream::BoxStream;

/// Live changes of one collection, in the order the store committed them.
///
/// The stream ends, or yields an error, when the channel is lost; changes
/// made after that point are only recovered by fetching again.
pub type ChangeStream = BoxStream<'static, Result<RawChange>>;

/// A store that owns the collections and assigns persistent ids.
pub trait BackingStore: Send + Sync + 'static {
    /// Fetch a collection's current rows.
    fn fetch_all(
        &self,
        collection: &str,
        filter: &RecordFilter,
        order: &RecordOrder,
    ) -> impl Future<Output = Result<Vec<Record>>> + Send;

    /// Insert a row; the returned record carries the assigned id.
    fn create(
        &self,
        collection: &str,
        payload: Payload,
    ) -> impl Future<Output = Result<Record>> + Send;

    /// Merge a patch into an existing row.
    fn update(
        &self,
        collection: &str,
        id: &str,
        patch: Payload,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete a row. Deleting a missing row succeeds.
    fn delete(&self, collection: &str, id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Open the change channel of a collection.
    fn subscribe_changes(&self, collection: &str)
        -> impl Future<Output = Result<ChangeStream>> + Send;
}

/// Execute a call described by the mutation coordinator.
pub async fn dispatch<S: BackingStore>(store: &S, call: StoreCall) -> Result<StoreResponse> {
    match call.request {
        StoreRequest::Create { payload } => store
            .create(&call.collection, payload)
            .await
            .map(StoreResponse::Created),
        StoreRequest::Update { id, patch } => store
            .update(&call.collection, &id, patch)
            .await
            .map(|()| StoreResponse::Updated),
        StoreRequest::Delete { id } => store
            .delete(&call.collection, &id)
            .await
            .map(|()| StoreResponse::Deleted),
    }
}

/// Check that a name can be spliced into SQL as an identifier.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && name.len() <= 63
}

pub(crate) fn unknown_collection(collection: &str) -> Error {
    Error::CollectionNotFound(collection.to_string())
}
