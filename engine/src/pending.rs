//! Pending writes - optimistic mutations awaiting the backing store.
//!
//! Writes to the same record are serialized: each record id has a FIFO
//! queue and only its head is ever in flight.

use crate::{CollectionName, Payload, Record, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Unique identifier for an optimistic operation, `<session>:<seq>`.
pub type OperationId = String;

/// What a pending write asks the backing store to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WriteKind {
    Create { payload: Payload },
    Update { patch: Payload },
    Delete,
}

/// Lifecycle of a pending write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteStatus {
    /// Waiting behind an earlier write to the same record
    Queued,
    /// Backing-store call issued, no answer yet
    InFlight,
    /// A confirmed record has superseded the optimistic one
    Confirmed,
    /// The backing store refused the write or the call timed out
    Failed,
    /// The provisional record was deleted locally before the create resolved
    Cancelled,
}

/// A mutation whose optimistic effect is visible but not yet confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWrite {
    pub op_id: OperationId,
    pub collection: CollectionName,
    /// Provisional id for creates, the record's id otherwise
    pub target: RecordId,
    pub kind: WriteKind,
    /// Visible value before the optimistic effect was applied
    pub before: Option<Record>,
    pub status: WriteStatus,
    /// Persistent id a create was confirmed under
    pub confirmed_id: Option<RecordId>,
    /// Issued to remove a record nobody locally wants any more; has no
    /// visible effect of its own
    pub compensating: bool,
}

impl PendingWrite {
    pub fn new(
        op_id: impl Into<OperationId>,
        collection: impl Into<CollectionName>,
        target: RecordId,
        kind: WriteKind,
        before: Option<Record>,
    ) -> Self {
        Self {
            op_id: op_id.into(),
            collection: collection.into(),
            target,
            kind,
            before,
            status: WriteStatus::Queued,
            confirmed_id: None,
            compensating: false,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self.kind, WriteKind::Create { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, WriteKind::Delete)
    }

    /// The id this write is currently queued under.
    fn queue_id(&self) -> &RecordId {
        self.confirmed_id.as_ref().unwrap_or(&self.target)
    }
}

type QueueKey = (CollectionName, RecordId);

/// Registry of pending writes with per-record serialization.
#[derive(Debug, Clone, Default)]
pub struct PendingWrites {
    writes: HashMap<OperationId, PendingWrite>,
    queues: HashMap<QueueKey, VecDeque<OperationId>>,
    /// Cancelled creates whose call failed; their row may still land
    cancelled: HashMap<OperationId, CollectionName>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Get a pending write by operation id.
    pub fn get(&self, op_id: &str) -> Option<&PendingWrite> {
        self.writes.get(op_id)
    }

    /// Iterate over all pending writes in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingWrite> {
        self.writes.values()
    }

    /// Pending writes to a record, oldest first.
    pub fn writes_for<'a>(
        &'a self,
        collection: &str,
        id: &RecordId,
    ) -> impl Iterator<Item = &'a PendingWrite> + 'a {
        self.queues
            .get(&(collection.to_string(), id.clone()))
            .into_iter()
            .flatten()
            .filter_map(|op_id| self.writes.get(op_id))
    }

    /// The create that introduced a provisional id, if still pending.
    pub fn create_for(&self, collection: &str, provisional: &RecordId) -> Option<&PendingWrite> {
        self.writes.values().find(|w| {
            w.is_create() && w.collection == collection && &w.target == provisional
        })
    }

    /// Collection of a cancelled create that resolved with an error.
    pub fn cancelled_create(&self, op_id: &str) -> Option<&str> {
        self.cancelled.get(op_id).map(String::as_str)
    }

    /// Check if a delete of this record is waiting for the backing store.
    pub fn has_delete(&self, collection: &str, id: &RecordId) -> bool {
        self.writes_for(collection, id)
            .any(|w| w.is_delete() && !w.compensating)
    }

    /// Register a write at the back of its record's queue.
    ///
    /// Returns `true` if the write is at the head and should be dispatched
    /// now; otherwise it stays [`WriteStatus::Queued`].
    pub(crate) fn enqueue(&mut self, mut write: PendingWrite) -> bool {
        let key = (write.collection.clone(), write.queue_id().clone());
        let queue = self.queues.entry(key).or_default();
        let dispatch = queue.is_empty();
        write.status = if dispatch {
            WriteStatus::InFlight
        } else {
            WriteStatus::Queued
        };
        queue.push_back(write.op_id.clone());
        self.writes.insert(write.op_id.clone(), write);
        dispatch
    }

    pub(crate) fn get_mut(&mut self, op_id: &str) -> Option<&mut PendingWrite> {
        self.writes.get_mut(op_id)
    }

    /// Move a provisional record's queue to the persistent id it was
    /// confirmed under. Queued writes are re-targeted; the create keeps its
    /// provisional target and records the confirmed id.
    pub(crate) fn retarget(&mut self, collection: &str, provisional: &RecordId, confirmed: &RecordId) {
        let from = (collection.to_string(), provisional.clone());
        let Some(moved) = self.queues.remove(&from) else {
            return;
        };

        for op_id in &moved {
            if let Some(write) = self.writes.get_mut(op_id) {
                if write.is_create() {
                    write.confirmed_id = Some(confirmed.clone());
                } else {
                    write.target = confirmed.clone();
                }
            }
        }

        self.queues
            .entry((collection.to_string(), confirmed.clone()))
            .or_default()
            .extend(moved);
    }

    /// Remove a resolved write.
    ///
    /// Returns the write and, if its queue has a successor waiting, the
    /// successor's id; the successor is marked in flight.
    pub(crate) fn finish(&mut self, op_id: &str) -> Option<(PendingWrite, Option<OperationId>)> {
        let write = self.writes.remove(op_id)?;
        let key = (write.collection.clone(), write.queue_id().clone());

        let mut next = None;
        if let Some(queue) = self.queues.get_mut(&key) {
            queue.retain(|id| id != op_id);
            if let Some(head) = queue.front() {
                if let Some(successor) = self.writes.get_mut(head) {
                    if successor.status == WriteStatus::Queued {
                        successor.status = WriteStatus::InFlight;
                        next = Some(head.clone());
                    }
                }
            } else {
                self.queues.remove(&key);
            }
        }

        Some((write, next))
    }

    /// Remember a cancelled create after its call failed, so a row that
    /// lands later is still recognised as unwanted.
    pub(crate) fn keep_cancelled(&mut self, write: &PendingWrite) {
        if write.is_create() && write.status == WriteStatus::Cancelled {
            self.cancelled
                .insert(write.op_id.clone(), write.collection.clone());
        }
    }

    /// Drop a cancelled create once its landed row is being removed.
    pub(crate) fn forget_cancelled(&mut self, op_id: &str) -> Option<CollectionName> {
        self.cancelled.remove(op_id)
    }

    /// Remove every write still queued behind `op_id` on the same record.
    pub(crate) fn drain_behind(&mut self, op_id: &str) -> Vec<PendingWrite> {
        let Some(write) = self.writes.get(op_id) else {
            return Vec::new();
        };
        let key = (write.collection.clone(), write.queue_id().clone());
        let Some(queue) = self.queues.get_mut(&key) else {
            return Vec::new();
        };

        let behind: Vec<OperationId> = queue
            .iter()
            .skip_while(|id| id.as_str() != op_id)
            .skip(1)
            .cloned()
            .collect();
        queue.retain(|id| !behind.contains(id));

        behind
            .iter()
            .filter_map(|id| self.writes.remove(id))
            .collect()
    }
}
