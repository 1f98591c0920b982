//! Reconciliation of confirmed and optimistic changes.
//!
//! The [`Reconciler`] is the only writer of managed collections. Feed
//! events, snapshots, optimistic effects and backing-store outcomes all
//! funnel through [`Reconciler::merge`], one input at a time.
//!
//! # Algorithm
//!
//! Per collection the reconciler keeps three things:
//!
//! 1. the visible [`ManagedCollection`] a UI renders from
//! 2. a confirmed shadow: the last value the feed or the backing store
//!    confirmed for each persistent id
//! 3. a suppression set of confirmed ids nobody locally wants (creates
//!    that were cancelled while in flight)
//!
//! Confirmed inserts supersede the provisional record of the pending create
//! they are correlated with, by operation id and never by content. Rollback
//! restores the shadow and re-applies the patches of writes still pending
//! on the same id. Every apply is idempotent: re-applying identical content
//! or removing an absent id changes nothing.

use crate::{
    error::Result, ChangeEvent, ChangeKind, CollectionName, Error, ManagedCollection, OperationId,
    PendingWrite, PendingWrites, Record, RecordId, WriteKind, WriteStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One input to [`Reconciler::merge`].
#[derive(Debug, Clone, PartialEq)]
pub enum MergeInput {
    /// A live event from the change feed
    Feed(ChangeEvent),
    /// Full contents of the collection, fetched on (re)subscribe
    Snapshot(Vec<Record>),
    /// A local effect applied before the backing store confirms it
    Optimistic(ChangeEvent),
    /// The backing-store call for a write succeeded. Creates carry the
    /// record the store returned.
    Acknowledged {
        write: PendingWrite,
        record: Option<Record>,
    },
    /// The backing-store call for a write failed or timed out
    Reverted { write: PendingWrite },
}

/// A provisional record retired in favour of its confirmed counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Supersession {
    pub op_id: OperationId,
    pub provisional: RecordId,
    pub confirmed: RecordId,
}

/// A confirmed record created by a write that was cancelled locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Orphan {
    pub op_id: OperationId,
    pub id: RecordId,
}

/// Two confirmed versions of the same id with different content.
///
/// Always resolved in favour of the incoming version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: RecordId,
    pub previous: Record,
    pub incoming: Record,
}

/// What a single merge changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResult {
    /// Ids inserted or changed in the visible collection
    pub upserted: Vec<RecordId>,
    /// Ids removed from the visible collection
    pub removed: Vec<RecordId>,
    pub superseded: Vec<Supersession>,
    pub orphaned: Vec<Orphan>,
    pub conflicts: Vec<Conflict>,
    /// Number of feed records that changed nothing
    pub ignored: usize,
}

impl ReconcileResult {
    /// Check if the visible collection is unchanged.
    pub fn is_noop(&self) -> bool {
        self.upserted.is_empty() && self.removed.is_empty()
    }

    /// Fold a later result into this one.
    pub fn absorb(&mut self, later: ReconcileResult) {
        for id in later.upserted {
            self.note_upsert(id);
        }
        for id in later.removed {
            self.note_remove(id);
        }
        self.superseded.extend(later.superseded);
        self.orphaned.extend(later.orphaned);
        self.conflicts.extend(later.conflicts);
        self.ignored += later.ignored;
    }

    fn note_upsert(&mut self, id: RecordId) {
        self.removed.retain(|r| r != &id);
        if !self.upserted.contains(&id) {
            self.upserted.push(id);
        }
    }

    fn note_remove(&mut self, id: RecordId) {
        self.upserted.retain(|r| r != &id);
        if !self.removed.contains(&id) {
            self.removed.push(id);
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CollectionState {
    visible: ManagedCollection,
    confirmed: HashMap<RecordId, Record>,
    suppressed: HashSet<RecordId>,
}

/// The single writer of every managed collection.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    correlation_field: Option<String>,
    collections: HashMap<CollectionName, CollectionState>,
}

impl Reconciler {
    /// Create a reconciler without correlation tokens.
    pub fn new() -> Self {
        Self::default()
    }

    /// Correlate confirmed inserts with pending creates through this field.
    pub fn with_correlation_field(mut self, field: impl Into<String>) -> Self {
        self.correlation_field = Some(field.into());
        self
    }

    /// The correlation field, if one is configured.
    pub fn correlation_field(&self) -> Option<&str> {
        self.correlation_field.as_deref()
    }

    /// Start managing a collection. Registering twice is a no-op.
    pub fn register(&mut self, name: impl Into<CollectionName>) {
        let name = name.into();
        self.collections
            .entry(name.clone())
            .or_insert_with(|| CollectionState {
                visible: ManagedCollection::new(name),
                ..Default::default()
            });
    }

    /// Names of managed collections.
    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    /// The visible collection.
    pub fn collection(&self, name: &str) -> Result<&ManagedCollection> {
        self.collections
            .get(name)
            .map(|state| &state.visible)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    /// Get a visible record.
    pub fn get(&self, collection: &str, id: &RecordId) -> Option<&Record> {
        self.collections.get(collection)?.visible.get(id)
    }

    /// Get the last confirmed value of a record.
    pub fn confirmed(&self, collection: &str, id: &RecordId) -> Option<&Record> {
        self.collections.get(collection)?.confirmed.get(id)
    }

    /// Apply one input to a collection.
    ///
    /// `pending` is consulted for correlation and rollback but never
    /// modified.
    pub fn merge(
        &mut self,
        collection: &str,
        input: MergeInput,
        pending: &PendingWrites,
    ) -> Result<ReconcileResult> {
        let state = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;

        let mut pass = MergePass {
            collection,
            state,
            pending,
            correlation: self.correlation_field.as_deref(),
            result: ReconcileResult::default(),
            touched: 0,
        };

        match input {
            MergeInput::Feed(event) => pass.counted(|pass| pass.feed(event)),
            MergeInput::Snapshot(records) => pass.snapshot(records),
            MergeInput::Optimistic(event) => pass.optimistic(event)?,
            MergeInput::Acknowledged { write, record } => pass.acknowledged(&write, record),
            MergeInput::Reverted { write } => pass.reverted(&write),
        }

        Ok(pass.result)
    }
}

/// State for one call to [`Reconciler::merge`].
struct MergePass<'a> {
    collection: &'a str,
    state: &'a mut CollectionState,
    pending: &'a PendingWrites,
    correlation: Option<&'a str>,
    result: ReconcileResult,
    touched: usize,
}

impl<'a> MergePass<'a> {
    fn upsert(&mut self, record: Record) {
        let id = record.id.clone();
        if self.state.visible.upsert(record) {
            self.touched += 1;
            self.result.note_upsert(id);
        }
    }

    fn remove(&mut self, id: &RecordId) {
        if self.state.visible.remove(id).is_some() {
            self.touched += 1;
            self.result.note_remove(id.clone());
        }
    }

    /// Run `apply`, counting it as ignored if nothing observable happened.
    fn counted(&mut self, apply: impl FnOnce(&mut Self)) {
        let touched = self.touched;
        let reported = self.result.superseded.len() + self.result.orphaned.len();
        apply(self);
        if self.touched == touched
            && self.result.superseded.len() + self.result.orphaned.len() == reported
        {
            self.result.ignored += 1;
        }
    }

    fn has_pending_delete(&self, id: &RecordId) -> bool {
        self.pending.has_delete(self.collection, id)
    }

    fn token<'r>(&self, record: &'r Record) -> Option<&'r str> {
        record.field(self.correlation?)?.as_str()
    }

    /// The pending create a confirmed record carries the token of.
    fn correlated_create(&self, record: &Record) -> Option<&'a PendingWrite> {
        let pending: &'a PendingWrites = self.pending;
        pending
            .get(self.token(record)?)
            .filter(|w| w.is_create() && w.collection == self.collection)
    }

    /// Token of a cancelled create whose call already failed.
    fn cancelled_token(&self, record: &Record) -> Option<OperationId> {
        let token = self.token(record)?;
        (self.pending.cancelled_create(token) == Some(self.collection)).then(|| token.to_string())
    }

    /// Lay the patches of updates queued under `queue` over a confirmed
    /// record that replaces a provisional one.
    fn with_queued_patches(&self, queue: &RecordId, mut record: Record) -> Record {
        for write in self.pending.writes_for(self.collection, queue) {
            if let WriteKind::Update { patch } = &write.kind {
                record.merge(patch);
            }
        }
        record
    }

    fn orphan(&mut self, op_id: &str, id: RecordId) {
        self.state.suppressed.insert(id.clone());
        self.state.confirmed.remove(&id);
        self.remove(&id);
        self.result.orphaned.push(Orphan {
            op_id: op_id.to_string(),
            id,
        });
    }

    fn feed(&mut self, event: ChangeEvent) {
        match event.kind {
            ChangeKind::Insert => self.confirmed_insert(event.record, true),
            ChangeKind::Update => self.confirmed_update(event.record),
            ChangeKind::Delete => self.confirmed_delete(&event.record.id),
        }
    }

    fn confirmed_insert(&mut self, record: Record, detect_conflict: bool) {
        let id = record.id.clone();
        if self.state.suppressed.contains(&id) {
            return;
        }

        if let Some(op_id) = self.cancelled_token(&record) {
            self.orphan(&op_id, id);
            return;
        }

        let mut superseded = None;
        if let Some(write) = self.correlated_create(&record) {
            match write.status {
                WriteStatus::Cancelled => {
                    self.orphan(&write.op_id, id);
                    return;
                }
                WriteStatus::Confirmed => {}
                _ => {
                    // Provisional out, confirmed in, within this one merge
                    self.remove(&write.target);
                    self.result.superseded.push(Supersession {
                        op_id: write.op_id.clone(),
                        provisional: write.target.clone(),
                        confirmed: id.clone(),
                    });
                    superseded = Some(write.target.clone());
                }
            }
        }

        let previous = self.state.confirmed.insert(id.clone(), record.clone());
        if detect_conflict {
            if let Some(previous) = previous.as_ref().filter(|p| *p != &record) {
                self.result.conflicts.push(Conflict {
                    id: id.clone(),
                    previous: previous.clone(),
                    incoming: record.clone(),
                });
            }
        }

        if self.has_pending_delete(&id) {
            return;
        }
        // A redelivered value leaves optimistic state over it alone
        let unchanged = previous.as_ref() == Some(&record);
        if unchanged && superseded.is_none() && self.state.visible.contains(&id) {
            return;
        }
        let record = match superseded {
            Some(provisional) => self.with_queued_patches(&provisional, record),
            None => record,
        };
        self.upsert(record);
    }

    fn confirmed_update(&mut self, record: Record) {
        let id = record.id.clone();
        if self.state.suppressed.contains(&id) {
            return;
        }
        if !self.state.confirmed.contains_key(&id) && !self.state.visible.contains(&id) {
            // Never seen: the insert went missing
            self.confirmed_insert(record, false);
            return;
        }

        match self.state.confirmed.get_mut(&id) {
            Some(shadow) => {
                // Nothing new was confirmed; keep optimistic state
                if !shadow.merge(&record.fields) && self.state.visible.contains(&id) {
                    return;
                }
            }
            None => {
                self.state.confirmed.insert(id.clone(), record.clone());
            }
        }

        if self.has_pending_delete(&id) {
            return;
        }

        let changed = match self.state.visible.get_mut(&id) {
            Some(current) => current.merge(&record.fields),
            None => {
                if let Some(shadow) = self.state.confirmed.get(&id).cloned() {
                    self.upsert(shadow);
                }
                return;
            }
        };
        if changed {
            self.touched += 1;
            self.result.note_upsert(id);
        }
    }

    fn confirmed_delete(&mut self, id: &RecordId) {
        self.state.confirmed.remove(id);
        self.state.suppressed.remove(id);
        self.remove(id);
    }

    fn snapshot(&mut self, records: Vec<Record>) {
        let incoming: HashSet<RecordId> = records.iter().map(|r| r.id.clone()).collect();

        let stale: Vec<RecordId> = self
            .state
            .visible
            .ids()
            .filter(|id| !id.is_provisional() && !incoming.contains(*id))
            .cloned()
            .collect();
        for id in &stale {
            self.remove(id);
        }

        let previous = std::mem::take(&mut self.state.confirmed);
        self.state.suppressed.retain(|id| incoming.contains(id));

        for record in records {
            let id = record.id.clone();
            let shown = self.state.visible.contains(&id) || self.has_pending_delete(&id);
            if shown && previous.get(&id) == Some(&record) {
                // Unchanged while we were away
                self.state.confirmed.insert(id, record);
                self.result.ignored += 1;
                continue;
            }
            self.counted(|pass| pass.confirmed_insert(record, false));
        }
    }

    fn optimistic(&mut self, event: ChangeEvent) -> Result<()> {
        match event.kind {
            ChangeKind::Insert => self.upsert(event.record),
            ChangeKind::Update => {
                let id = event.record.id;
                let current = self
                    .state
                    .visible
                    .get_mut(&id)
                    .ok_or_else(|| Error::RecordNotFound(id.clone()))?;
                if current.merge(&event.record.fields) {
                    self.touched += 1;
                    self.result.note_upsert(id);
                }
            }
            ChangeKind::Delete => self.remove(&event.record.id),
        }
        Ok(())
    }

    fn acknowledged(&mut self, write: &PendingWrite, record: Option<Record>) {
        match &write.kind {
            WriteKind::Create { .. } => {
                let Some(record) = record else {
                    return;
                };
                let id = record.id.clone();
                if self.state.suppressed.contains(&id) {
                    return;
                }
                if write.status == WriteStatus::Cancelled {
                    self.orphan(&write.op_id, id);
                    return;
                }

                // Updates queued on the new record are still keyed by the
                // provisional id unless the feed confirmed it first
                let queue = if write.status == WriteStatus::Confirmed {
                    if self.state.visible.contains(&id) {
                        return;
                    }
                    id.clone()
                } else {
                    self.remove(&write.target);
                    self.result.superseded.push(Supersession {
                        op_id: write.op_id.clone(),
                        provisional: write.target.clone(),
                        confirmed: id.clone(),
                    });
                    write.target.clone()
                };

                // A feed version that arrived first is at least as fresh
                let confirmed = self
                    .state
                    .confirmed
                    .entry(id.clone())
                    .or_insert(record)
                    .clone();
                if !self.has_pending_delete(&id) {
                    let confirmed = self.with_queued_patches(&queue, confirmed);
                    self.upsert(confirmed);
                }
            }
            WriteKind::Update { patch } => {
                let target = &write.target;
                if let Some(shadow) = self.state.confirmed.get_mut(target) {
                    shadow.merge(patch);
                }
                if self.has_pending_delete(target) {
                    return;
                }
                let Some(mut current) = self.state.visible.get(target).cloned() else {
                    return;
                };
                // The accepted patch shows unless a later pending write
                // covers the same fields
                current.merge(patch);
                let pending: &'a PendingWrites = self.pending;
                for later in pending
                    .writes_for(self.collection, target)
                    .skip_while(|w| w.op_id != write.op_id)
                    .skip(1)
                {
                    if let WriteKind::Update { patch } = &later.kind {
                        current.merge(patch);
                    }
                }
                self.upsert(current);
            }
            WriteKind::Delete => {
                self.state.confirmed.remove(&write.target);
                self.remove(&write.target);
            }
        }
    }

    fn reverted(&mut self, write: &PendingWrite) {
        match &write.kind {
            WriteKind::Create { .. } => {
                // A create already confirmed through the feed did land
                if write.status != WriteStatus::Confirmed {
                    self.remove(&write.target);
                }
            }
            WriteKind::Update { .. } | WriteKind::Delete => {
                if !write.compensating {
                    self.restore(write);
                }
            }
        }
    }

    /// Put a record back to its confirmed value plus the effects of every
    /// other write still pending on it.
    fn restore(&mut self, write: &PendingWrite) {
        let target = &write.target;
        let base = if target.is_provisional() {
            write.before.clone()
        } else {
            self.state.confirmed.get(target).cloned()
        };

        // Deleted by someone else in the meantime
        let Some(mut base) = base else {
            self.remove(target);
            return;
        };

        let pending: &'a PendingWrites = self.pending;
        let mut deleted = false;
        for other in pending
            .writes_for(self.collection, target)
            .filter(|w| w.op_id != write.op_id)
        {
            match &other.kind {
                WriteKind::Update { patch } => {
                    base.merge(patch);
                }
                WriteKind::Delete if !other.compensating => deleted = true,
                _ => {}
            }
        }

        if deleted {
            self.remove(target);
        } else {
            self.upsert(base);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Payload;
    use serde_json::{json, Value};

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn record(id: &str, fields: Value) -> Record {
        Record::new(id, payload(fields))
    }

    fn reconciler() -> Reconciler {
        let mut reconciler = Reconciler::new().with_correlation_field("client_op_id");
        reconciler.register("matches");
        reconciler
    }

    fn feed(reconciler: &mut Reconciler, event: ChangeEvent, pending: &PendingWrites) -> ReconcileResult {
        reconciler
            .merge("matches", MergeInput::Feed(event), pending)
            .unwrap()
    }

    fn visible(reconciler: &Reconciler) -> Vec<Record> {
        let order = crate::RecordOrder::new();
        reconciler
            .collection("matches")
            .unwrap()
            .list(&order)
            .cloned()
            .collect()
    }

    fn create_write(op_id: &str, seq: u64, fields: Value) -> PendingWrite {
        PendingWrite::new(
            op_id,
            "matches",
            RecordId::Provisional(seq),
            WriteKind::Create {
                payload: payload(fields),
            },
            None,
        )
    }

    #[test]
    fn unknown_collection() {
        let mut reconciler = Reconciler::new();
        let result = reconciler.merge(
            "posts",
            MergeInput::Snapshot(Vec::new()),
            &PendingWrites::new(),
        );
        assert!(matches!(result, Err(Error::CollectionNotFound(c)) if c == "posts"));
    }

    #[test]
    fn foreign_insert_is_shown() {
        let mut reconciler = reconciler();
        let pending = PendingWrites::new();
        let result = feed(
            &mut reconciler,
            ChangeEvent::insert(record("7", json!({"court": 1}))),
            &pending,
        );
        assert_eq!(result.upserted, vec![RecordId::persistent("7")]);
        assert_eq!(visible(&reconciler).len(), 1);
    }

    #[test]
    fn duplicate_insert_is_ignored() {
        let mut reconciler = reconciler();
        let pending = PendingWrites::new();
        let event = ChangeEvent::insert(record("7", json!({"court": 1})));
        feed(&mut reconciler, event.clone(), &pending);
        let result = feed(&mut reconciler, event, &pending);
        assert!(result.is_noop());
        assert_eq!(result.ignored, 1);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn differing_insert_is_a_conflict_resolved_for_incoming() {
        let mut reconciler = reconciler();
        let pending = PendingWrites::new();
        feed(
            &mut reconciler,
            ChangeEvent::insert(record("7", json!({"court": 1}))),
            &pending,
        );
        let result = feed(
            &mut reconciler,
            ChangeEvent::insert(record("7", json!({"court": 2}))),
            &pending,
        );
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(
            reconciler
                .get("matches", &RecordId::persistent("7"))
                .unwrap()
                .field("court"),
            Some(&json!(2))
        );
    }

    #[test]
    fn update_is_partial() {
        let mut reconciler = reconciler();
        let pending = PendingWrites::new();
        feed(
            &mut reconciler,
            ChangeEvent::insert(record("7", json!({"team1_score": 0, "team2_score": 0}))),
            &pending,
        );
        feed(
            &mut reconciler,
            ChangeEvent::update(record("7", json!({"team1_score": 3}))),
            &pending,
        );
        let current = reconciler.get("matches", &RecordId::persistent("7")).unwrap();
        assert_eq!(current.field("team1_score"), Some(&json!(3)));
        assert_eq!(current.field("team2_score"), Some(&json!(0)));
    }

    #[test]
    fn update_for_unseen_id_inserts() {
        let mut reconciler = reconciler();
        let pending = PendingWrites::new();
        let result = feed(
            &mut reconciler,
            ChangeEvent::update(record("9", json!({"court": 4}))),
            &pending,
        );
        assert_eq!(result.upserted, vec![RecordId::persistent("9")]);
    }

    #[test]
    fn delete_twice_is_noop() {
        let mut reconciler = reconciler();
        let pending = PendingWrites::new();
        feed(
            &mut reconciler,
            ChangeEvent::insert(record("42", json!({}))),
            &pending,
        );
        let first = feed(&mut reconciler, ChangeEvent::delete(record("42", json!({}))), &pending);
        let second = feed(&mut reconciler, ChangeEvent::delete(record("42", json!({}))), &pending);
        assert_eq!(first.removed, vec![RecordId::persistent("42")]);
        assert!(second.is_noop());
        assert_eq!(second.ignored, 1);
        assert!(visible(&reconciler).is_empty());
    }

    #[test]
    fn correlated_insert_supersedes_provisional() {
        let mut reconciler = reconciler();
        let mut pending = PendingWrites::new();
        pending.enqueue(create_write("s:1", 1, json!({"court": 1, "client_op_id": "s:1"})));

        reconciler
            .merge(
                "matches",
                MergeInput::Optimistic(ChangeEvent::insert(Record::new(
                    RecordId::Provisional(1),
                    payload(json!({"court": 1, "client_op_id": "s:1"})),
                ))),
                &pending,
            )
            .unwrap();

        let result = feed(
            &mut reconciler,
            ChangeEvent::insert(record("42", json!({"court": 1, "client_op_id": "s:1"}))),
            &pending,
        );

        assert_eq!(result.removed, vec![RecordId::Provisional(1)]);
        assert_eq!(result.upserted, vec![RecordId::persistent("42")]);
        assert_eq!(
            result.superseded,
            vec![Supersession {
                op_id: "s:1".into(),
                provisional: RecordId::Provisional(1),
                confirmed: RecordId::persistent("42"),
            }]
        );
        let records = visible(&reconciler);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, RecordId::persistent("42"));
    }

    #[test]
    fn identical_content_is_never_matched() {
        let mut reconciler = reconciler();
        let mut pending = PendingWrites::new();
        pending.enqueue(create_write("s:1", 1, json!({"message_body": "hi"})));
        reconciler
            .merge(
                "matches",
                MergeInput::Optimistic(ChangeEvent::insert(Record::new(
                    RecordId::Provisional(1),
                    payload(json!({"message_body": "hi"})),
                ))),
                &pending,
            )
            .unwrap();

        // Same text from another client, no token
        let result = feed(
            &mut reconciler,
            ChangeEvent::insert(record("5", json!({"message_body": "hi"}))),
            &pending,
        );
        assert!(result.superseded.is_empty());
        assert_eq!(visible(&reconciler).len(), 2);
    }

    #[test]
    fn cancelled_create_confirmation_is_orphaned() {
        let mut reconciler = reconciler();
        let mut pending = PendingWrites::new();
        pending.enqueue(create_write("s:1", 1, json!({"client_op_id": "s:1"})));
        pending.get_mut("s:1").unwrap().status = WriteStatus::Cancelled;

        let event = ChangeEvent::insert(record("42", json!({"client_op_id": "s:1"})));
        let result = feed(&mut reconciler, event.clone(), &pending);
        assert_eq!(
            result.orphaned,
            vec![Orphan {
                op_id: "s:1".into(),
                id: RecordId::persistent("42"),
            }]
        );
        assert!(visible(&reconciler).is_empty());

        // Redelivery stays hidden and is not reported twice
        let again = feed(&mut reconciler, event, &pending);
        assert!(again.orphaned.is_empty());
        assert!(visible(&reconciler).is_empty());

        // The store's delete lifts the suppression
        feed(&mut reconciler, ChangeEvent::delete(record("42", json!({}))), &pending);
        feed(
            &mut reconciler,
            ChangeEvent::insert(record("42", json!({"court": 3}))),
            &pending,
        );
        assert_eq!(visible(&reconciler).len(), 1);
    }

    #[test]
    fn confirmation_during_pending_delete_stays_hidden() {
        let mut reconciler = reconciler();
        let mut pending = PendingWrites::new();
        let target = RecordId::persistent("42");
        feed(
            &mut reconciler,
            ChangeEvent::insert(record("42", json!({"court": 1}))),
            &pending,
        );

        pending.enqueue(PendingWrite::new(
            "s:1",
            "matches",
            target.clone(),
            WriteKind::Delete,
            reconciler.get("matches", &target).cloned(),
        ));
        reconciler
            .merge(
                "matches",
                MergeInput::Optimistic(ChangeEvent::delete(record("42", json!({})))),
                &pending,
            )
            .unwrap();

        let result = feed(
            &mut reconciler,
            ChangeEvent::update(record("42", json!({"court": 2}))),
            &pending,
        );
        assert!(result.is_noop());
        assert!(visible(&reconciler).is_empty());
        assert_eq!(
            reconciler.confirmed("matches", &target).unwrap().field("court"),
            Some(&json!(2))
        );
    }

    #[test]
    fn failed_delete_restores_latest_confirmed() {
        let mut reconciler = reconciler();
        let mut pending = PendingWrites::new();
        let target = RecordId::persistent("42");
        feed(
            &mut reconciler,
            ChangeEvent::insert(record("42", json!({"court": 1}))),
            &pending,
        );

        let delete = PendingWrite::new("s:1", "matches", target.clone(), WriteKind::Delete, None);
        pending.enqueue(delete.clone());
        reconciler
            .merge(
                "matches",
                MergeInput::Optimistic(ChangeEvent::delete(record("42", json!({})))),
                &pending,
            )
            .unwrap();
        feed(
            &mut reconciler,
            ChangeEvent::update(record("42", json!({"court": 5}))),
            &pending,
        );

        reconciler
            .merge("matches", MergeInput::Reverted { write: delete }, &pending)
            .unwrap();
        assert_eq!(
            reconciler.get("matches", &target).unwrap().field("court"),
            Some(&json!(5))
        );
    }

    #[test]
    fn rollback_reapplies_other_pending_patches() {
        let mut reconciler = reconciler();
        let mut pending = PendingWrites::new();
        let target = RecordId::persistent("42");
        feed(
            &mut reconciler,
            ChangeEvent::insert(record("42", json!({"team1_score": 0, "team2_score": 0}))),
            &pending,
        );

        let first = PendingWrite::new(
            "s:1",
            "matches",
            target.clone(),
            WriteKind::Update {
                patch: payload(json!({"team1_score": 1})),
            },
            None,
        );
        let second = PendingWrite::new(
            "s:2",
            "matches",
            target.clone(),
            WriteKind::Update {
                patch: payload(json!({"team2_score": 1})),
            },
            None,
        );
        for write in [&first, &second] {
            pending.enqueue(write.clone());
            let WriteKind::Update { patch } = &write.kind else {
                unreachable!()
            };
            reconciler
                .merge(
                    "matches",
                    MergeInput::Optimistic(ChangeEvent::update(Record::new(
                        target.clone(),
                        patch.clone(),
                    ))),
                    &pending,
                )
                .unwrap();
        }

        reconciler
            .merge("matches", MergeInput::Reverted { write: first }, &pending)
            .unwrap();
        let current = reconciler.get("matches", &target).unwrap();
        assert_eq!(current.field("team1_score"), Some(&json!(0)));
        assert_eq!(current.field("team2_score"), Some(&json!(1)));
    }

    #[test]
    fn snapshot_prunes_and_keeps_provisional() {
        let mut reconciler = reconciler();
        let pending = PendingWrites::new();
        for id in ["1", "2"] {
            feed(
                &mut reconciler,
                ChangeEvent::insert(record(id, json!({"court": 1}))),
                &pending,
            );
        }
        reconciler
            .merge(
                "matches",
                MergeInput::Optimistic(ChangeEvent::insert(Record::new(
                    RecordId::Provisional(1),
                    payload(json!({"court": 9})),
                ))),
                &pending,
            )
            .unwrap();

        let result = reconciler
            .merge(
                "matches",
                MergeInput::Snapshot(vec![
                    record("2", json!({"court": 1})),
                    record("3", json!({"court": 2})),
                ]),
                &pending,
            )
            .unwrap();

        assert_eq!(result.removed, vec![RecordId::persistent("1")]);
        assert_eq!(result.upserted, vec![RecordId::persistent("3")]);
        assert_eq!(result.ignored, 1);
        let ids: Vec<String> = visible(&reconciler).iter().map(|r| r.id.to_string()).collect();
        assert_eq!(ids, vec!["2", "3", "tmp-1"]);
    }

    #[test]
    fn optimistic_update_of_missing_record_fails() {
        let mut reconciler = reconciler();
        let result = reconciler.merge(
            "matches",
            MergeInput::Optimistic(ChangeEvent::update(record("42", json!({"court": 1})))),
            &PendingWrites::new(),
        );
        assert!(matches!(result, Err(Error::RecordNotFound(_))));
    }

    #[test]
    fn absorb_keeps_final_state() {
        let mut first = ReconcileResult::default();
        first.note_upsert(RecordId::persistent("1"));
        let mut later = ReconcileResult::default();
        later.note_remove(RecordId::persistent("1"));
        later.ignored = 2;

        first.absorb(later);
        assert!(first.upserted.is_empty());
        assert_eq!(first.removed, vec![RecordId::persistent("1")]);
        assert_eq!(first.ignored, 2);
    }

    // Property-based tests using proptest
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Step {
            FeedInsert(u8, i64),
            FeedUpdate(u8, i64),
            FeedDelete(u8),
        }

        fn arb_step() -> impl Strategy<Value = Step> {
            prop_oneof![
                (0u8..5, 0i64..10).prop_map(|(id, v)| Step::FeedInsert(id, v)),
                (0u8..5, 0i64..10).prop_map(|(id, v)| Step::FeedUpdate(id, v)),
                (0u8..5).prop_map(Step::FeedDelete),
            ]
        }

        fn event(step: &Step) -> ChangeEvent {
            match step {
                Step::FeedInsert(id, v) => {
                    ChangeEvent::insert(record(&id.to_string(), json!({"score": v})))
                }
                Step::FeedUpdate(id, v) => {
                    ChangeEvent::update(record(&id.to_string(), json!({"score": v})))
                }
                Step::FeedDelete(id) => ChangeEvent::delete(record(&id.to_string(), json!({}))),
            }
        }

        proptest! {
            #[test]
            fn prop_confirmed_events_are_idempotent(
                steps in prop::collection::vec(arb_step(), 0..30),
                repeat in 0usize..30,
            ) {
                let pending = PendingWrites::new();
                let mut once = reconciler();
                let mut twice = reconciler();

                for (i, step) in steps.iter().enumerate() {
                    feed(&mut once, event(step), &pending);
                    feed(&mut twice, event(step), &pending);
                    if i == repeat {
                        let result = feed(&mut twice, event(step), &pending);
                        prop_assert!(result.is_noop());
                    }
                }

                prop_assert_eq!(visible(&once), visible(&twice));
            }

            #[test]
            fn prop_last_confirmed_event_wins(
                values in prop::collection::vec((any::<bool>(), 0i64..100), 1..20),
                confirmed in 100i64..200,
            ) {
                let mut reconciler = reconciler();
                let mut pending = PendingWrites::new();
                let target = RecordId::persistent("42");
                feed(&mut reconciler, ChangeEvent::insert(record("42", json!({"score": 0}))), &pending);

                for (i, (optimistic, value)) in values.iter().enumerate() {
                    let fields = payload(json!({"score": value}));
                    if *optimistic {
                        pending.enqueue(PendingWrite::new(
                            format!("s:{}", i),
                            "matches",
                            target.clone(),
                            WriteKind::Update { patch: fields.clone() },
                            None,
                        ));
                        reconciler.merge(
                            "matches",
                            MergeInput::Optimistic(ChangeEvent::update(Record::new(target.clone(), fields))),
                            &pending,
                        ).unwrap();
                    } else {
                        feed(&mut reconciler, ChangeEvent::update(Record::new(target.clone(), fields)), &pending);
                    }
                }

                // A newly confirmed value, never a redelivery
                feed(&mut reconciler, ChangeEvent::update(record("42", json!({"score": confirmed}))), &pending);
                let current = reconciler.get("matches", &target).unwrap();
                prop_assert_eq!(current.field("score"), Some(&json!(confirmed)));
            }

            #[test]
            fn prop_redelivery_keeps_pending_updates(
                steps in prop::collection::vec((any::<bool>(), 0i64..10), 1..20),
                as_snapshot in any::<bool>(),
            ) {
                let mut reconciler = reconciler();
                let mut pending = PendingWrites::new();
                let target = RecordId::persistent("42");
                let seeded = record("42", json!({"score": 0}));
                feed(&mut reconciler, ChangeEvent::insert(seeded.clone()), &pending);

                for (i, (optimistic, value)) in steps.iter().enumerate() {
                    if *optimistic {
                        let fields = payload(json!({"score": value}));
                        pending.enqueue(PendingWrite::new(
                            format!("s:{}", i),
                            "matches",
                            target.clone(),
                            WriteKind::Update { patch: fields.clone() },
                            None,
                        ));
                        reconciler.merge(
                            "matches",
                            MergeInput::Optimistic(ChangeEvent::update(Record::new(target.clone(), fields))),
                            &pending,
                        ).unwrap();
                    } else {
                        let before = visible(&reconciler);
                        let input = if as_snapshot {
                            MergeInput::Snapshot(vec![seeded.clone()])
                        } else {
                            MergeInput::Feed(ChangeEvent::insert(seeded.clone()))
                        };
                        let result = reconciler.merge("matches", input, &pending).unwrap();
                        prop_assert!(result.is_noop());
                        prop_assert_eq!(visible(&reconciler), before);
                    }
                }

                // The store accepts every write in order
                let writes: Vec<PendingWrite> = pending.writes_for("matches", &target).cloned().collect();
                for write in writes {
                    reconciler.merge(
                        "matches",
                        MergeInput::Acknowledged { write: write.clone(), record: None },
                        &pending,
                    ).unwrap();
                    pending.finish(&write.op_id);
                }

                let expected = steps
                    .iter()
                    .rev()
                    .find(|(optimistic, _)| *optimistic)
                    .map_or(0, |(_, value)| *value);
                let current = reconciler.get("matches", &target).unwrap();
                prop_assert_eq!(current.field("score"), Some(&json!(expected)));
            }

            #[test]
            fn prop_rollback_restores_confirmed_value(
                initial in 0i64..100,
                optimistic in 0i64..100,
                interim in prop::option::of(0i64..100),
            ) {
                let mut reconciler = reconciler();
                let mut pending = PendingWrites::new();
                let target = RecordId::persistent("42");
                feed(&mut reconciler, ChangeEvent::insert(record("42", json!({"score": initial}))), &pending);

                let patch = payload(json!({"score": optimistic}));
                let write = PendingWrite::new(
                    "s:1",
                    "matches",
                    target.clone(),
                    WriteKind::Update { patch: patch.clone() },
                    reconciler.get("matches", &target).cloned(),
                );
                pending.enqueue(write.clone());
                reconciler.merge(
                    "matches",
                    MergeInput::Optimistic(ChangeEvent::update(Record::new(target.clone(), patch))),
                    &pending,
                ).unwrap();

                if let Some(value) = interim {
                    feed(&mut reconciler, ChangeEvent::update(record("42", json!({"score": value}))), &pending);
                }

                reconciler.merge("matches", MergeInput::Reverted { write }, &pending).unwrap();
                let expected = interim.unwrap_or(initial);
                let current = reconciler.get("matches", &target).unwrap();
                prop_assert_eq!(current.field("score"), Some(&json!(expected)));
            }

            #[test]
            fn prop_snapshot_heals_any_gap(
                before in prop::collection::vec(arb_step(), 0..30),
                fresh in prop::collection::btree_map(0u8..8, 0i64..10, 0..8),
            ) {
                let pending = PendingWrites::new();
                let mut healed = reconciler();
                for step in &before {
                    feed(&mut healed, event(step), &pending);
                }

                let snapshot: Vec<Record> = fresh
                    .iter()
                    .map(|(id, v)| record(&id.to_string(), json!({"score": v})))
                    .collect();
                healed.merge("matches", MergeInput::Snapshot(snapshot.clone()), &pending).unwrap();

                let mut from_scratch = reconciler();
                from_scratch.merge("matches", MergeInput::Snapshot(snapshot), &pending).unwrap();

                prop_assert_eq!(visible(&healed), visible(&from_scratch));
            }
        }
    }
}
