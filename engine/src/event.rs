//! Change events delivered by a collection's change feed.

use crate::{error::Result, Error, Record};
use serde::{Deserialize, Serialize};

/// Kind of change a feed event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A normalized change: what happened, and the record it happened to.
///
/// For deletes only the record's id is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub record: Record,
}

impl ChangeEvent {
    pub fn insert(record: Record) -> Self {
        Self {
            kind: ChangeKind::Insert,
            record,
        }
    }

    pub fn update(record: Record) -> Self {
        Self {
            kind: ChangeKind::Update,
            record,
        }
    }

    pub fn delete(record: Record) -> Self {
        Self {
            kind: ChangeKind::Delete,
            record,
        }
    }
}

/// Operation name as published by the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RawOperation {
    #[serde(alias = "insert")]
    Insert,
    #[serde(alias = "update")]
    Update,
    #[serde(alias = "delete")]
    Delete,
}

/// A change as the backing store's push channel delivers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChange {
    pub operation: RawOperation,
    #[serde(default, alias = "old", skip_serializing_if = "Option::is_none")]
    pub old_record: Option<serde_json::Value>,
    #[serde(default, alias = "new", skip_serializing_if = "Option::is_none")]
    pub new_record: Option<serde_json::Value>,
}

impl RawChange {
    /// Normalize into a uniform `{kind, record}` event.
    ///
    /// Inserts and updates read the new row; deletes read the old row and
    /// fall back to the new one when the store only reports that.
    pub fn normalize(self) -> Result<ChangeEvent> {
        let (kind, row) = match self.operation {
            RawOperation::Insert => (ChangeKind::Insert, self.new_record),
            RawOperation::Update => (ChangeKind::Update, self.new_record),
            RawOperation::Delete => (ChangeKind::Delete, self.old_record.or(self.new_record)),
        };

        let row = row.filter(|r| !r.is_null()).ok_or_else(|| {
            Error::InvalidPayload(format!("{:?} change carries no record", kind))
        })?;
        let record = Record::from_value(row)?;
        if record.is_provisional() {
            return Err(Error::InvalidPayload(format!(
                "change feed delivered provisional id {}",
                record.id
            )));
        }

        Ok(ChangeEvent { kind, record })
    }
}

/// One delivery from a change-feed subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedBatch {
    /// Full contents of the collection, fetched on (re)subscribe
    Snapshot(Vec<Record>),
    /// A single live event
    Live(ChangeEvent),
}

impl FeedBatch {
    /// Number of records carried.
    pub fn len(&self) -> usize {
        match self {
            FeedBatch::Snapshot(records) => records.len(),
            FeedBatch::Live(_) => 1,
        }
    }

    /// Check if the batch carries no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
