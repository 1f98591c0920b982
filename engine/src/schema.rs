//! Schema definition and validation.
//!
//! Schemas describe the collections a replica manages and let mutations be
//! validated before their optimistic effect becomes visible.

use crate::{error::Result, CollectionName, Error, Payload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Type of a field's JSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// Epoch milliseconds or an RFC 3339 string
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl FieldType {
    fn name(self) -> &'static str {
        match self {
            FieldType::String => "String",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::Bool => "Bool",
            FieldType::Timestamp => "Timestamp",
            FieldType::Json => "Json",
        }
    }

    /// Whether a non-null value has this type. Integers pass as floats.
    pub fn accepts(self, value: &Value) -> bool {
        let integer = value.is_i64() || value.is_u64();
        match self {
            FieldType::String => value.is_string(),
            FieldType::Int => integer,
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => integer || value.is_string(),
            FieldType::Json => true,
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed field of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    /// Must be present and non-null on create, and may never be cleared
    pub required: bool,
}

impl FieldDef {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Check the value a payload holds for this field, `None` if absent.
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        let value = match value {
            Some(Value::Null) | None if self.required => {
                return Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(Value::Null) | None => return Ok(()),
            Some(value) => value,
        };

        if self.field_type.accepts(value) {
            return Ok(());
        }
        Err(Error::TypeMismatch {
            field: self.name.clone(),
            expected: self.field_type.to_string(),
            got: kind_of(value).to_string(),
        })
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_f64() => "Float",
        Value::Number(_) => "Int",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// Schema for a collection.
///
/// Fields not listed are accepted unchecked; the backing store owns the
/// full row shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    pub name: CollectionName,
    pub fields: Vec<FieldDef>,
}

impl CollectionSchema {
    /// Create a new collection schema.
    pub fn new(name: impl Into<CollectionName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// A collection that accepts any payload.
    pub fn untyped(name: impl Into<CollectionName>) -> Self {
        Self::new(name, Vec::new())
    }

    /// Validate the payload of a create.
    pub fn validate_create(&self, payload: &Payload) -> Result<()> {
        reject_id(payload)?;
        for field in &self.fields {
            field.validate(payload.get(&field.name))?;
        }
        Ok(())
    }

    /// Validate a partial update. Only fields present in the patch are
    /// checked, but a required field may not be cleared.
    pub fn validate_patch(&self, patch: &Payload) -> Result<()> {
        reject_id(patch)?;
        if patch.is_empty() {
            return Err(Error::InvalidPayload("update patch is empty".into()));
        }
        for field in &self.fields {
            if let Some(value) = patch.get(&field.name) {
                field.validate(Some(value))?;
            }
        }
        Ok(())
    }
}

fn reject_id(payload: &Payload) -> Result<()> {
    if payload.contains_key("id") {
        return Err(Error::InvalidPayload(
            "the backing store assigns ids; payload must not carry one".into(),
        ));
    }
    Ok(())
}

/// Schema for every collection a replica manages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Collection schemas by name
    pub collections: HashMap<CollectionName, CollectionSchema>,
}

impl Schema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a collection to the schema.
    pub fn add_collection(&mut self, collection: CollectionSchema) -> &mut Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    /// Builder-style method to add a collection.
    pub fn with_collection(mut self, collection: CollectionSchema) -> Self {
        self.add_collection(collection);
        self
    }

    /// Get a collection schema by name.
    pub fn get_collection(&self, name: &str) -> Result<&CollectionSchema> {
        self.collections
            .get(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    /// Validate the payload of a create against its collection.
    pub fn validate_create(&self, collection: &str, payload: &Payload) -> Result<()> {
        self.get_collection(collection)?.validate_create(payload)
    }

    /// Validate a partial update against its collection.
    pub fn validate_patch(&self, collection: &str, patch: &Payload) -> Result<()> {
        self.get_collection(collection)?.validate_patch(patch)
    }
}
