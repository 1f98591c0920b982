//! Presentation ordering and filtering of records.
//!
//! Orders are total: after the configured keys, records tie-break on id so
//! that two listings of the same contents are always identical.

use crate::{error::Result, Error, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Direction of a sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// One field to sort by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

/// A total order over records, used only for presentation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOrder {
    keys: Vec<SortKey>,
}

impl RecordOrder {
    /// Order by id only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Order ascending by a field.
    pub fn by(field: impl Into<String>) -> Self {
        Self::new().then(field, SortDirection::Ascending)
    }

    /// Add a further sort key.
    pub fn then(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.keys.push(SortKey {
            field: field.into(),
            direction,
        });
        self
    }

    /// Flip the most recently added key to descending.
    pub fn descending(mut self) -> Self {
        if let Some(key) = self.keys.last_mut() {
            key.direction = SortDirection::Descending;
        }
        self
    }

    /// The configured sort keys.
    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    /// Compare two records under this order.
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for key in &self.keys {
            let ord = compare_values(a.field(&key.field), b.field(&key.field));
            let ord = match key.direction {
                SortDirection::Ascending => ord,
                SortDirection::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.id.cmp(&b.id)
    }
}

impl FromStr for RecordOrder {
    type Err = Error;

    /// Parse `created_at.desc,court.asc`. A key without a suffix is ascending.
    fn from_str(s: &str) -> Result<Self> {
        let mut order = RecordOrder::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (field, direction) = match part.rsplit_once('.') {
                Some((field, "asc")) => (field, SortDirection::Ascending),
                Some((field, "desc")) => (field, SortDirection::Descending),
                _ => (part, SortDirection::Ascending),
            };
            if field.is_empty() {
                return Err(Error::InvalidPayload(format!("invalid order key: {}", part)));
            }
            order = order.then(field, direction);
        }
        Ok(order)
    }
}

impl fmt::Display for RecordOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, key) in self.keys.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            let suffix = match key.direction {
                SortDirection::Ascending => "asc",
                SortDirection::Descending => "desc",
            };
            write!(f, "{}.{}", key.field, suffix)?;
        }
        Ok(())
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Compare two JSON values for sorting. A missing field sorts like null.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.unwrap_or(&Value::Null);
    let b = b.unwrap_or(&Value::Null);

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (x, y) in x.iter().zip(y.iter()) {
                let ord = compare_values(Some(x), Some(y));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Conjunction of field equality terms.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    terms: Vec<(String, Value)>,
}

impl RecordFilter {
    /// A filter that matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field == value`.
    pub fn field_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.terms.push((field.into(), value.into()));
        self
    }

    /// The equality terms.
    pub fn terms(&self) -> &[(String, Value)] {
        &self.terms
    }

    /// Check if the filter has no terms.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Check if a record satisfies every term.
    pub fn matches(&self, record: &Record) -> bool {
        self.terms
            .iter()
            .all(|(field, value)| record.field(field).unwrap_or(&Value::Null) == value)
    }
}
