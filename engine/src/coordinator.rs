//! Optimistic mutation coordination.
//!
//! The [`MutationCoordinator`] applies a mutation's local effect through the
//! [`Reconciler`] at once and describes the backing-store call that should
//! follow as a [`StoreCall`]. It never performs IO: the caller executes the
//! call and reports the outcome back through [`MutationCoordinator::resolve`].

use crate::{
    error::Result, ChangeEvent, CollectionName, Error, MergeInput, OperationId, Payload,
    PendingWrite, PendingWrites, ReconcileResult, Reconciler, Record, RecordId, WriteKind,
    WriteStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A request to the backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreRequest {
    /// Create a record; the store assigns its id
    Create { payload: Payload },
    /// Merge a patch into a record
    Update { id: String, patch: Payload },
    /// Delete a record
    Delete { id: String },
}

/// A backing-store call the caller should dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreCall {
    pub op_id: OperationId,
    pub collection: CollectionName,
    pub request: StoreRequest,
}

/// Successful answer from the backing store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreResponse {
    /// The created record, carrying its persistent id
    Created(Record),
    Updated,
    Deleted,
}

/// Outcome of an optimistic mutation's local step.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub op_id: OperationId,
    /// The record's id; provisional for creates
    pub id: RecordId,
    /// Call to dispatch now, if any
    pub call: Option<StoreCall>,
    pub result: ReconcileResult,
}

/// A write that reached a final state.
#[derive(Debug, Clone, PartialEq)]
pub struct Settled {
    pub op_id: OperationId,
    pub collection: CollectionName,
    pub target: RecordId,
    /// `Confirmed`, `Failed`, or `Cancelled` for a create deleted locally
    pub status: WriteStatus,
    pub outcome: Result<()>,
}

/// Everything that follows from one backing-store answer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Resolution {
    /// Calls that became ready, in dispatch order
    pub calls: Vec<StoreCall>,
    /// Writes that finished, including ones dropped because they depended
    /// on a failed create
    pub settled: Vec<Settled>,
    pub result: ReconcileResult,
}

impl Resolution {
    /// The first settled write that failed.
    pub fn failure(&self) -> Option<&Settled> {
        self.settled.iter().find(|s| s.outcome.is_err())
    }
}

/// Pending-write bookkeeping and the provisional id sequence.
#[derive(Debug, Clone)]
pub struct MutationCoordinator {
    session: String,
    next_op: u64,
    next_provisional: u64,
    correlation_field: Option<String>,
    pending: PendingWrites,
    /// Provisional ids already replaced by a confirmed one
    aliases: HashMap<(CollectionName, RecordId), RecordId>,
}

impl MutationCoordinator {
    /// Create a coordinator for one session. Operation ids are
    /// `<session>:<seq>`, so the session must be unique per process.
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            next_op: 1,
            next_provisional: 1,
            correlation_field: None,
            pending: PendingWrites::new(),
            aliases: HashMap::new(),
        }
    }

    /// Write each create's operation id into this payload field.
    pub fn with_correlation_field(mut self, field: impl Into<String>) -> Self {
        self.correlation_field = Some(field.into());
        self
    }

    /// The session id.
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Writes awaiting the backing store.
    pub fn pending(&self) -> &PendingWrites {
        &self.pending
    }

    /// Map a stale provisional id to the persistent id that replaced it.
    pub fn resolve_id(&self, collection: &str, id: &RecordId) -> RecordId {
        if !id.is_provisional() {
            return id.clone();
        }
        self.aliases
            .get(&(collection.to_string(), id.clone()))
            .cloned()
            .unwrap_or_else(|| id.clone())
    }

    fn next_op_id(&mut self) -> OperationId {
        let op_id = format!("{}:{}", self.session, self.next_op);
        self.next_op += 1;
        op_id
    }

    /// Show a new record under a provisional id and describe its create call.
    pub fn create_optimistic(
        &mut self,
        reconciler: &mut Reconciler,
        collection: &str,
        mut payload: Payload,
    ) -> Result<Mutation> {
        reconciler.collection(collection)?;

        let op_id = self.next_op_id();
        let id = RecordId::Provisional(self.next_provisional);
        self.next_provisional += 1;

        if let Some(field) = &self.correlation_field {
            payload.insert(field.clone(), serde_json::Value::String(op_id.clone()));
        }

        let record = Record::new(id.clone(), payload.clone());
        let result = reconciler.merge(
            collection,
            MergeInput::Optimistic(ChangeEvent::insert(record)),
            &self.pending,
        )?;

        let write = PendingWrite::new(
            op_id.clone(),
            collection,
            id.clone(),
            WriteKind::Create { payload },
            None,
        );
        let call = self.enqueue(write);

        Ok(Mutation {
            op_id,
            id,
            call,
            result,
        })
    }

    /// Merge a patch into a visible record and describe its update call.
    ///
    /// The call is withheld while an earlier write to the same record is
    /// unresolved; it is released by [`Self::resolve`].
    pub fn update_optimistic(
        &mut self,
        reconciler: &mut Reconciler,
        collection: &str,
        id: &RecordId,
        patch: Payload,
    ) -> Result<Mutation> {
        let id = self.resolve_id(collection, id);
        let before = reconciler
            .get(collection, &id)
            .cloned()
            .ok_or_else(|| Error::RecordNotFound(id.clone()))?;

        let op_id = self.next_op_id();
        let result = reconciler.merge(
            collection,
            MergeInput::Optimistic(ChangeEvent::update(Record::new(id.clone(), patch.clone()))),
            &self.pending,
        )?;

        let write = PendingWrite::new(
            op_id.clone(),
            collection,
            id.clone(),
            WriteKind::Update { patch },
            Some(before),
        );
        let call = self.enqueue(write);

        Ok(Mutation {
            op_id,
            id,
            call,
            result,
        })
    }

    /// Hide a visible record and describe its delete call.
    ///
    /// Deleting a provisional record cancels its create instead: nothing is
    /// sent, and should the create land anyway the record is removed from
    /// the store again.
    pub fn delete_optimistic(
        &mut self,
        reconciler: &mut Reconciler,
        collection: &str,
        id: &RecordId,
    ) -> Result<Mutation> {
        let id = self.resolve_id(collection, id);
        let before = reconciler
            .get(collection, &id)
            .cloned()
            .ok_or_else(|| Error::RecordNotFound(id.clone()))?;

        let op_id = self.next_op_id();
        let result = reconciler.merge(
            collection,
            MergeInput::Optimistic(ChangeEvent::delete(before.clone())),
            &self.pending,
        )?;

        if id.is_provisional() {
            let create = self
                .pending
                .create_for(collection, &id)
                .map(|w| w.op_id.clone());
            if let Some(create) = create {
                // Nothing queued behind the create can run any more
                self.pending.drain_behind(&create);
                if let Some(write) = self.pending.get_mut(&create) {
                    write.status = WriteStatus::Cancelled;
                }
            }
            return Ok(Mutation {
                op_id,
                id,
                call: None,
                result,
            });
        }

        let write = PendingWrite::new(
            op_id.clone(),
            collection,
            id.clone(),
            WriteKind::Delete,
            Some(before),
        );
        let call = self.enqueue(write);

        Ok(Mutation {
            op_id,
            id,
            call,
            result,
        })
    }

    /// Record the backing store's answer to a dispatched call.
    ///
    /// Success confirms the write; failure rolls its effect back. Either way
    /// the record's queue advances and any released call is returned.
    pub fn resolve(
        &mut self,
        reconciler: &mut Reconciler,
        op_id: &str,
        outcome: Result<StoreResponse>,
    ) -> Result<Resolution> {
        let write = self
            .pending
            .get(op_id)
            .cloned()
            .ok_or_else(|| Error::UnknownOperation(op_id.to_string()))?;

        let mut resolution = Resolution::default();
        match outcome {
            // The feed confirmed this create before the call gave up
            Err(_) if write.status == WriteStatus::Confirmed => {
                resolution.settled.push(settled(&write, Ok(())));
            }
            Ok(response) => {
                let record = match response {
                    StoreResponse::Created(record) => Some(record),
                    StoreResponse::Updated | StoreResponse::Deleted => None,
                };
                let result = reconciler.merge(
                    &write.collection,
                    MergeInput::Acknowledged {
                        write: write.clone(),
                        record,
                    },
                    &self.pending,
                )?;
                resolution.calls.extend(self.observe(&result));
                resolution.result = result;
                resolution.settled.push(settled(&write, Ok(())));
            }
            Err(error) => {
                let mut write = write;
                if write.status != WriteStatus::Cancelled {
                    write.status = WriteStatus::Failed;
                    if let Some(stored) = self.pending.get_mut(op_id) {
                        stored.status = WriteStatus::Failed;
                    }
                }
                resolution.settled.push(settled(&write, Err(error.clone())));
                if write.is_create() {
                    for mut dropped in self.pending.drain_behind(op_id) {
                        dropped.status = WriteStatus::Failed;
                        resolution.settled.push(settled(&dropped, Err(error.clone())));
                    }
                }
                let collection = write.collection.clone();
                resolution.result = reconciler.merge(
                    &collection,
                    MergeInput::Reverted { write },
                    &self.pending,
                )?;
            }
        }

        if let Some((write, next)) = self.pending.finish(op_id) {
            if resolution.failure().is_some() {
                self.pending.keep_cancelled(&write);
            }
            if let Some(call) = next.and_then(|next| self.pending.get(&next).and_then(to_call)) {
                resolution.calls.push(call);
            }
        }

        Ok(resolution)
    }

    /// Act on what a merge reported: bind superseded provisional ids to
    /// their confirmed ids, and queue a compensating delete for orphans.
    pub fn observe(&mut self, result: &ReconcileResult) -> Vec<StoreCall> {
        for supersession in &result.superseded {
            let Some(write) = self.pending.get_mut(&supersession.op_id) else {
                continue;
            };
            write.status = WriteStatus::Confirmed;
            let collection = write.collection.clone();
            self.aliases.insert(
                (collection.clone(), supersession.provisional.clone()),
                supersession.confirmed.clone(),
            );
            self.pending
                .retarget(&collection, &supersession.provisional, &supersession.confirmed);
        }

        let mut calls = Vec::new();
        for orphan in &result.orphaned {
            let collection = match self.pending.get(&orphan.op_id) {
                Some(write) => write.collection.clone(),
                None => match self.pending.forget_cancelled(&orphan.op_id) {
                    Some(collection) => collection,
                    None => continue,
                },
            };
            let op_id = self.next_op_id();
            let mut write = PendingWrite::new(op_id, collection, orphan.id.clone(), WriteKind::Delete, None);
            write.compensating = true;
            calls.extend(self.enqueue(write));
        }
        calls
    }

    fn enqueue(&mut self, write: PendingWrite) -> Option<StoreCall> {
        let op_id = write.op_id.clone();
        if self.pending.enqueue(write) {
            self.pending.get(&op_id).and_then(to_call)
        } else {
            None
        }
    }
}

fn settled(write: &PendingWrite, outcome: Result<()>) -> Settled {
    let status = match (&outcome, write.status) {
        (_, WriteStatus::Cancelled) => WriteStatus::Cancelled,
        (Ok(()), _) => WriteStatus::Confirmed,
        (Err(_), _) => WriteStatus::Failed,
    };
    Settled {
        op_id: write.op_id.clone(),
        collection: write.collection.clone(),
        target: write.target.clone(),
        status,
        outcome,
    }
}

/// The call for a write, or `None` if its target has no persistent id yet.
fn to_call(write: &PendingWrite) -> Option<StoreCall> {
    let request = match &write.kind {
        WriteKind::Create { payload } => StoreRequest::Create {
            payload: payload.clone(),
        },
        WriteKind::Update { patch } => StoreRequest::Update {
            id: write.target.as_persistent()?.to_string(),
            patch: patch.clone(),
        },
        WriteKind::Delete => StoreRequest::Delete {
            id: write.target.as_persistent()?.to_string(),
        },
    };
    Some(StoreCall {
        op_id: write.op_id.clone(),
        collection: write.collection.clone(),
        request,
    })
}
