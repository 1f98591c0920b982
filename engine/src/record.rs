//! Record types for locally held copies of server-owned rows.

use crate::{error::Result, Error};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Prefix that marks locally assigned ids.
pub const PROVISIONAL_PREFIX: &str = "tmp-";

/// Field name to value mapping carried by a record.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Identifier of a record.
///
/// Persistent ids are assigned by the backing store. Provisional ids are
/// assigned locally while a create is in flight and render as `tmp-<n>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordId {
    /// Id assigned by the backing store
    Persistent(String),
    /// Id assigned locally, never sent to the backing store
    Provisional(u64),
}

impl RecordId {
    /// Create a persistent id.
    pub fn persistent(id: impl Into<String>) -> Self {
        RecordId::Persistent(id.into())
    }

    /// Check if this id was assigned locally.
    pub fn is_provisional(&self) -> bool {
        matches!(self, RecordId::Provisional(_))
    }

    /// The backing-store key, if this id has one.
    pub fn as_persistent(&self) -> Option<&str> {
        match self {
            RecordId::Persistent(id) => Some(id),
            RecordId::Provisional(_) => None,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Persistent(id) => f.write_str(id),
            RecordId::Provisional(seq) => write!(f, "{}{}", PROVISIONAL_PREFIX, seq),
        }
    }
}

impl FromStr for RecordId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let provisional = s
            .strip_prefix(PROVISIONAL_PREFIX)
            .filter(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|rest| rest.parse().ok());

        Ok(match provisional {
            Some(seq) => RecordId::Provisional(seq),
            None => RecordId::Persistent(s.to_string()),
        })
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(id) => id,
            Err(never) => match never {},
        }
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        RecordId::from(s.as_str())
    }
}

impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct IdVisitor;

        impl Visitor<'_> for IdVisitor {
            type Value = RecordId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string or integer record id")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<RecordId, E> {
                Ok(RecordId::from(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<RecordId, E> {
                Ok(RecordId::Persistent(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<RecordId, E> {
                Ok(RecordId::Persistent(v.to_string()))
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

/// A record held in a managed collection.
///
/// Serializes flat: `{"id": "42", "court": 1, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique identifier for this record
    pub id: RecordId,
    /// Every other field of the row
    #[serde(flatten)]
    pub fields: Payload,
}

impl Record {
    /// Create a new record.
    pub fn new(id: impl Into<RecordId>, fields: Payload) -> Self {
        let mut fields = fields;
        fields.remove("id");
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Parse a record from a JSON row. The row must be an object carrying
    /// an `id`.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        match &value {
            serde_json::Value::Object(map) if map.get("id").is_some_and(|id| !id.is_null()) => {}
            serde_json::Value::Object(_) => {
                return Err(Error::InvalidPayload("record has no id".into()));
            }
            other => {
                return Err(Error::InvalidPayload(format!(
                    "record must be an object, got {}",
                    other
                )));
            }
        }
        serde_json::from_value(value).map_err(|e| Error::InvalidPayload(e.to_string()))
    }

    /// Convert back into a JSON row.
    pub fn to_value(&self) -> serde_json::Value {
        let mut row = Payload::with_capacity(self.fields.len() + 1);
        row.insert("id".into(), serde_json::Value::String(self.id.to_string()));
        row.extend(self.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        serde_json::Value::Object(row)
    }

    /// Get a field by name.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    /// Check if this record carries a provisional id.
    pub fn is_provisional(&self) -> bool {
        self.id.is_provisional()
    }

    /// Merge a partial payload into this record.
    ///
    /// Fields absent from the patch are left untouched. Returns whether
    /// anything changed.
    pub fn merge(&mut self, patch: &Payload) -> bool {
        let mut changed = false;
        for (name, value) in patch {
            if name == "id" {
                continue;
            }
            if self.fields.get(name) != Some(value) {
                self.fields.insert(name.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }

    /// Check if every field of the patch already holds the patched value.
    pub fn covers(&self, patch: &Payload) -> bool {
        patch
            .iter()
            .filter(|(name, _)| name.as_str() != "id")
            .all(|(name, value)| self.fields.get(name) == Some(value))
    }
}
