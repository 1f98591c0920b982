//! Managed collections - the in-memory state a UI renders from.
//!
//! A [`ManagedCollection`] holds exactly one record per id. Mutation is
//! crate-private: only the [`crate::Reconciler`] writes to a collection,
//! which keeps every change on a single serialized path.

use crate::{CollectionName, Record, RecordId, RecordOrder};
use std::collections::HashMap;

/// Keyed store of records for one logical collection.
#[derive(Debug, Clone, Default)]
pub struct ManagedCollection {
    name: CollectionName,
    records: HashMap<RecordId, Record>,
}

impl ManagedCollection {
    /// Create an empty collection.
    pub fn new(name: impl Into<CollectionName>) -> Self {
        Self {
            name: name.into(),
            records: HashMap::new(),
        }
    }

    /// The collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a record by id.
    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.records.get(id)
    }

    /// Check if a record exists.
    pub fn contains(&self, id: &RecordId) -> bool {
        self.records.contains_key(id)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All ids currently held, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = &RecordId> {
        self.records.keys()
    }

    /// List records in the requested order.
    ///
    /// The listing is lazy: ordering is derived from the current contents
    /// when the first record is pulled, never from a cached snapshot.
    pub fn list<'a>(&'a self, order: &'a RecordOrder) -> Listing<'a> {
        Listing {
            collection: self,
            order,
            sorted: None,
        }
    }

    /// Insert or replace a record by id. Returns whether anything changed.
    pub(crate) fn upsert(&mut self, record: Record) -> bool {
        if self.records.get(&record.id) == Some(&record) {
            return false;
        }
        self.records.insert(record.id.clone(), record);
        true
    }

    /// Get a mutable record by id.
    pub(crate) fn get_mut(&mut self, id: &RecordId) -> Option<&mut Record> {
        self.records.get_mut(id)
    }

    /// Remove a record by id.
    pub(crate) fn remove(&mut self, id: &RecordId) -> Option<Record> {
        self.records.remove(id)
    }
}

/// Ordered, finite view over a collection. See [`ManagedCollection::list`].
#[derive(Debug, Clone)]
pub struct Listing<'a> {
    collection: &'a ManagedCollection,
    order: &'a RecordOrder,
    sorted: Option<std::vec::IntoIter<&'a Record>>,
}

impl<'a> Listing<'a> {
    /// Start over from the first record, re-deriving the order.
    pub fn restart(&mut self) {
        self.sorted = None;
    }
}

impl<'a> Iterator for Listing<'a> {
    type Item = &'a Record;

    fn next(&mut self) -> Option<&'a Record> {
        let collection = self.collection;
        let order = self.order;
        self.sorted
            .get_or_insert_with(|| {
                let mut records: Vec<&'a Record> = collection.records.values().collect();
                records.sort_by(|a, b| order.compare(a, b));
                records.into_iter()
            })
            .next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.sorted {
            Some(sorted) => sorted.size_hint(),
            None => (self.collection.len(), Some(self.collection.len())),
        }
    }
}
