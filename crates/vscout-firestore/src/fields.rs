//! Field map helpers shared by the repositories.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{FirestoreError, FirestoreResult};
use crate::types::{Document, FromFirestoreValue, ToFirestoreValue, Value};

/// Builder for a document field map. `None` values are omitted rather
/// than stored as nulls.
#[derive(Debug, Default)]
pub struct FieldMap(HashMap<String, Value>);

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &str, value: impl ToFirestoreValue) -> Self {
        self.0.insert(name.to_string(), value.to_firestore_value());
        self
    }

    pub fn set_opt<T: ToFirestoreValue>(mut self, name: &str, value: Option<T>) -> Self {
        if let Some(v) = value {
            self.0.insert(name.to_string(), v.to_firestore_value());
        }
        self
    }

    pub fn into_inner(self) -> HashMap<String, Value> {
        self.0
    }
}

/// Typed access to a fetched document's fields.
pub struct FieldReader<'a> {
    fields: &'a HashMap<String, Value>,
    context: &'a str,
}

impl<'a> FieldReader<'a> {
    pub fn new(doc: &'a Document, context: &'a str) -> FirestoreResult<Self> {
        let fields = doc
            .fields
            .as_ref()
            .ok_or_else(|| FirestoreError::invalid_response(format!("{}: document has no fields", context)))?;
        Ok(Self { fields, context })
    }

    pub fn opt<T: FromFirestoreValue>(&self, name: &str) -> Option<T> {
        self.fields.get(name).and_then(T::from_firestore_value)
    }

    pub fn req<T: FromFirestoreValue>(&self, name: &str) -> FirestoreResult<T> {
        self.opt(name).ok_or_else(|| {
            FirestoreError::invalid_response(format!("{}: missing or invalid field '{}'", self.context, name))
        })
    }

    /// Required string field parsed with `FromStr` (status enums).
    pub fn parsed<T: FromStr>(&self, name: &str) -> FirestoreResult<T>
    where
        T::Err: std::fmt::Display,
    {
        let raw: String = self.req(name)?;
        raw.parse().map_err(|e: T::Err| {
            FirestoreError::invalid_response(format!("{}: field '{}': {}", self.context, name, e))
        })
    }

    pub fn timestamp(&self, name: &str) -> FirestoreResult<DateTime<Utc>> {
        self.req(name)
    }
}
