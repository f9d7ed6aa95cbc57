//! Firestore REST API types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Firestore document value types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Value {
    NullValue(()),
    BooleanValue(bool),
    IntegerValue(String), // Firestore sends integers as strings
    DoubleValue(f64),
    TimestampValue(String),
    StringValue(String),
    ArrayValue(ArrayValue),
    MapValue(MapValue),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayValue {
    pub values: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapValue {
    pub fields: Option<HashMap<String, Value>>,
}

/// Firestore document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Full resource name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Document fields
    pub fields: Option<HashMap<String, Value>>,
    /// Create time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_time: Option<String>,
    /// Update time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_time: Option<String>,
}

impl Document {
    /// Create a new document with the given fields.
    pub fn new(fields: HashMap<String, Value>) -> Self {
        Self {
            name: None,
            fields: Some(fields),
            create_time: None,
            update_time: None,
        }
    }

    /// Named document, as required by batch writes.
    pub fn named(name: String, fields: HashMap<String, Value>) -> Self {
        Self {
            name: Some(name),
            ..Self::new(fields)
        }
    }

    /// Last path segment of the resource name.
    pub fn id(&self) -> Option<&str> {
        self.name.as_deref().and_then(|n| n.rsplit('/').next())
    }
}

/// List documents response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDocumentsResponse {
    pub documents: Option<Vec<Document>>,
    pub next_page_token: Option<String>,
}

// ============================================================================
// Batch Write Types
// ============================================================================

/// A single write operation in a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Write {
    /// Update or insert a document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<Document>,

    /// Field mask for partial updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_mask: Option<DocumentMask>,

    /// Precondition for the write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_document: Option<Precondition>,
}

impl Write {
    /// Insert that fails for this write alone if the document exists.
    pub fn create(document: Document) -> Self {
        Self {
            update: Some(document),
            update_mask: None,
            current_document: Some(Precondition {
                exists: Some(false),
                update_time: None,
            }),
        }
    }

    /// Unconditional upsert.
    pub fn upsert(document: Document) -> Self {
        Self {
            update: Some(document),
            update_mask: None,
            current_document: None,
        }
    }
}

/// Document field mask for partial updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMask {
    pub field_paths: Vec<String>,
}

/// Precondition for a write operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Precondition {
    /// Document must (or must not) exist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,

    /// Document must have this update time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_time: Option<String>,
}

impl Precondition {
    pub fn exists() -> Self {
        Self {
            exists: Some(true),
            update_time: None,
        }
    }

    /// Unchanged since the read that returned `update_time`. With no
    /// update time, only requires the document to exist.
    pub fn unchanged_since(update_time: Option<&str>) -> Self {
        match update_time {
            Some(ts) => Self {
                exists: None,
                update_time: Some(ts.to_string()),
            },
            None => Self::exists(),
        }
    }
}

/// Batch write request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchWriteRequest {
    pub writes: Vec<Write>,
}

/// Result of a single write in a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    pub update_time: Option<String>,
}

/// Status of a single write in a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// gRPC status code (0 = OK).
    pub code: Option<i32>,
    pub message: Option<String>,
}

/// gRPC status codes that surface in batch write statuses.
pub mod grpc_code {
    pub const OK: i32 = 0;
    pub const ALREADY_EXISTS: i32 = 6;
    pub const FAILED_PRECONDITION: i32 = 9;
}

/// Outcome of one write within a non-atomic batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// `exists = false` precondition tripped
    AlreadyExists,
    Failed(i32),
}

/// Batch write response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchWriteResponse {
    /// Results for each write, in order.
    pub write_results: Option<Vec<WriteResult>>,
    /// Status for each write, in order.
    pub status: Option<Vec<Status>>,
}

impl BatchWriteResponse {
    /// Create an empty response for empty batch writes.
    pub fn empty() -> Self {
        Self {
            write_results: Some(vec![]),
            status: Some(vec![]),
        }
    }

    /// Per-write outcomes, in request order. A missing status means OK.
    pub fn outcomes(&self, writes: usize) -> Vec<WriteOutcome> {
        let statuses = self.status.as_deref().unwrap_or(&[]);
        (0..writes)
            .map(|i| match statuses.get(i).and_then(|s| s.code).unwrap_or(grpc_code::OK) {
                grpc_code::OK => WriteOutcome::Written,
                grpc_code::ALREADY_EXISTS | grpc_code::FAILED_PRECONDITION => WriteOutcome::AlreadyExists,
                code => WriteOutcome::Failed(code),
            })
            .collect()
    }

    /// First hard failure, if any.
    pub fn first_failure(&self) -> Option<(usize, &Status)> {
        self.status.as_deref()?.iter().enumerate().find(|(_, s)| {
            !matches!(
                s.code.unwrap_or(grpc_code::OK),
                grpc_code::OK | grpc_code::ALREADY_EXISTS | grpc_code::FAILED_PRECONDITION
            )
        })
    }
}

// ============================================================================
// Structured Query Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunQueryRequest {
    pub structured_query: StructuredQuery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunQueryResponse {
    pub document: Option<Document>,
    pub read_time: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredQuery {
    pub from: Vec<CollectionSelector>,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i32>,
}

impl StructuredQuery {
    /// Query a single collection under the request's parent.
    pub fn collection(collection_id: impl Into<String>) -> Self {
        Self {
            from: vec![CollectionSelector {
                collection_id: collection_id.into(),
                all_descendants: None,
            }],
            ..Default::default()
        }
    }

    /// AND all `filters` together (a single filter is used as is).
    pub fn filter_all(mut self, mut filters: Vec<Filter>) -> Self {
        self.filter = match filters.len() {
            0 => None,
            1 => filters.pop(),
            _ => Some(Filter::composite("AND", filters)),
        };
        self
    }

    pub fn limit(mut self, limit: i32) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSelector {
    pub collection_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_descendants: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub composite_filter: Option<CompositeFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_filter: Option<FieldFilter>,
}

impl Filter {
    /// `field == value`
    pub fn equal(field: &str, value: Value) -> Self {
        Self::field(field, "EQUAL", value)
    }

    /// `field IN values`
    pub fn in_values(field: &str, values: Vec<Value>) -> Self {
        Self::field(
            field,
            "IN",
            Value::ArrayValue(ArrayValue { values: Some(values) }),
        )
    }

    fn field(field: &str, op: &str, value: Value) -> Self {
        Self {
            composite_filter: None,
            field_filter: Some(FieldFilter {
                field: FieldReference {
                    field_path: field.to_string(),
                },
                op: op.to_string(),
                value,
            }),
        }
    }

    fn composite(op: &str, filters: Vec<Filter>) -> Self {
        Self {
            composite_filter: Some(CompositeFilter {
                op: op.to_string(),
                filters,
            }),
            field_filter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeFilter {
    pub op: String,
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldFilter {
    pub field: FieldReference,
    pub op: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldReference {
    pub field_path: String,
}

// ============================================================================
// Value Conversions
// ============================================================================

/// Convert a Rust value to Firestore Value.
pub trait ToFirestoreValue {
    fn to_firestore_value(&self) -> Value;
}

impl ToFirestoreValue for String {
    fn to_firestore_value(&self) -> Value {
        Value::StringValue(self.clone())
    }
}

impl ToFirestoreValue for &str {
    fn to_firestore_value(&self) -> Value {
        Value::StringValue(self.to_string())
    }
}

impl ToFirestoreValue for u32 {
    fn to_firestore_value(&self) -> Value {
        Value::IntegerValue((*self as i64).to_string())
    }
}

impl ToFirestoreValue for f64 {
    fn to_firestore_value(&self) -> Value {
        Value::DoubleValue(*self)
    }
}

impl ToFirestoreValue for DateTime<Utc> {
    fn to_firestore_value(&self) -> Value {
        Value::TimestampValue(self.to_rfc3339())
    }
}

/// Convert Firestore Value to Rust type.
pub trait FromFirestoreValue: Sized {
    fn from_firestore_value(value: &Value) -> Option<Self>;
}

impl FromFirestoreValue for String {
    fn from_firestore_value(value: &Value) -> Option<Self> {
        match value {
            Value::StringValue(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromFirestoreValue for u32 {
    fn from_firestore_value(value: &Value) -> Option<Self> {
        match value {
            Value::IntegerValue(s) => s.parse().ok(),
            Value::DoubleValue(f) => Some(*f as u32),
            _ => None,
        }
    }
}

impl FromFirestoreValue for f64 {
    fn from_firestore_value(value: &Value) -> Option<Self> {
        match value {
            Value::DoubleValue(f) => Some(*f),
            Value::IntegerValue(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl FromFirestoreValue for DateTime<Utc> {
    fn from_firestore_value(value: &Value) -> Option<Self> {
        match value {
            Value::TimestampValue(s) => DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.into()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_structured_query_serialization() {
        let query = StructuredQuery::collection("analysis_chunks").filter_all(vec![
            Filter::equal("status", "analyzing".to_firestore_value()),
            Filter::equal("sequence", 2u32.to_firestore_value()),
        ]);
        let value = serde_json::to_value(&query).unwrap();
        assert_eq!(value["from"][0]["collectionId"], "analysis_chunks");
        assert_eq!(value["where"]["compositeFilter"]["op"], "AND");
        assert_eq!(
            value["where"]["compositeFilter"]["filters"][1]["fieldFilter"]["value"],
            json!({"integerValue": "2"})
        );
        assert!(value.get("limit").is_none());
    }

    #[test]
    fn test_single_filter_is_not_wrapped() {
        let query = StructuredQuery::collection("analysis_jobs")
            .filter_all(vec![Filter::in_values("status", vec!["processing".to_firestore_value()])]);
        let value = serde_json::to_value(&query).unwrap();
        assert_eq!(value["where"]["fieldFilter"]["op"], "IN");
    }

    #[test]
    fn test_batch_outcomes() {
        let response: BatchWriteResponse = serde_json::from_value(json!({
            "writeResults": [{}, {}, {}],
            "status": [{}, {"code": 6, "message": "exists"}, {"code": 13}]
        }))
        .unwrap();
        assert_eq!(
            response.outcomes(3),
            vec![WriteOutcome::Written, WriteOutcome::AlreadyExists, WriteOutcome::Failed(13)]
        );
        assert_eq!(response.first_failure().map(|(i, _)| i), Some(2));
    }

    #[test]
    fn test_document_id_from_name() {
        let doc = Document::named(
            "projects/p/databases/(default)/documents/analysis_jobs/job_1".to_string(),
            HashMap::new(),
        );
        assert_eq!(doc.id(), Some("job_1"));
    }

    #[test]
    fn test_precondition_falls_back_to_exists() {
        let pre = Precondition::unchanged_since(None);
        assert_eq!(pre.exists, Some(true));
        assert!(pre.update_time.is_none());

        let pre = Precondition::unchanged_since(Some("2026-01-01T00:00:00.123456Z"));
        assert!(pre.exists.is_none());
        assert_eq!(
            serde_json::to_value(&pre).unwrap(),
            json!({"updateTime": "2026-01-01T00:00:00.123456Z"})
        );
    }
}
