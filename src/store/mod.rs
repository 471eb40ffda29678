//! Document store capability set.
//!
//! The scoring core talks to persistence only through [`DocumentStore`]:
//! collection and document references, filtered queries, point writes,
//! grouped batches and a change feed for live snapshots. Each backend gets
//! one adapter module.

use async_trait::async_trait;
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;

pub mod memory;
pub mod postgres;

pub const STUDENTS: &str = "students";
pub const COMPETITIONS: &str = "competitions";
pub const GROUPS: &str = "groups";
pub const SCORES: &str = "scores";
pub const ACTIVITY_DAYS: &str = "activity_days";
pub const TEACHERS: &str = "teachers";

pub const CREATED_AT: &str = "createdAt";
pub const UPDATED_AT: &str = "updatedAt";

pub type Fields = Map<String, Value>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("document encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("document {collection}/{id} not found")]
    NotFound { collection: String, id: String },

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("store is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRef {
    pub name: String,
}

impl CollectionRef {
    pub fn doc(&self, id: impl Into<String>) -> DocRef {
        DocRef {
            collection: self.name.clone(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocRef {
    pub collection: String,
    pub id: String,
}

pub fn collection(name: &str) -> CollectionRef {
    CollectionRef {
        name: name.to_string(),
    }
}

pub fn doc(collection: &str, id: impl Into<String>) -> DocRef {
    DocRef {
        collection: collection.to_string(),
        id: id.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    /// Field value is one of the listed values.
    In,
    /// Field is an array holding the value.
    ArrayContains,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: Op,
    pub value: Value,
}

impl Filter {
    pub fn matches(&self, fields: &Fields) -> bool {
        let Some(current) = fields.get(&self.field) else {
            return false;
        };
        match self.op {
            Op::Eq => current == &self.value,
            Op::In => match &self.value {
                Value::Array(options) => options.contains(current),
                single => current == single,
            },
            Op::ArrayContains => match current {
                Value::Array(items) => items.contains(&self.value),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
}

impl Query {
    pub fn filter(mut self, field: &str, op: Op, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        self.filters.iter().all(|filter| filter.matches(fields))
    }
}

pub fn query(collection: &CollectionRef) -> Query {
    Query {
        collection: collection.name.clone(),
        filters: Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    /// Decodes the document into a record, exposing the store id as `id`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        let mut fields = self.fields.clone();
        fields.insert("id".to_string(), Value::String(self.id.clone()));
        Ok(serde_json::from_value(Value::Object(fields))?)
    }
}

/// Encodes a record as document fields. The `id` field is dropped since the
/// store owns it.
pub fn encode<T: Serialize>(record: &T) -> Result<Fields, StoreError> {
    match serde_json::to_value(record)? {
        Value::Object(mut fields) => {
            fields.remove("id");
            Ok(fields)
        }
        other => Err(StoreError::InvalidDocument(format!(
            "expected an object, got {other}"
        ))),
    }
}

#[derive(Debug, Clone)]
pub enum BatchOp {
    Set(DocRef, Fields),
    Update(DocRef, Fields),
    Delete(DocRef),
}

pub(crate) fn timestamp() -> Value {
    Value::String(Utc::now().to_rfc3339())
}

/// Stamps a fresh document with creation and update times, keeping a
/// caller-provided `createdAt`.
pub(crate) fn stamp_new(fields: &mut Fields) {
    let now = timestamp();
    if !matches!(fields.get(CREATED_AT), Some(value) if !value.is_null()) {
        fields.insert(CREATED_AT.to_string(), now.clone());
    }
    fields.insert(UPDATED_AT.to_string(), now);
}

pub(crate) fn stamp_update(fields: &mut Fields) {
    fields.insert(UPDATED_AT.to_string(), timestamp());
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_doc(&self, doc: &DocRef) -> Result<Option<Document>, StoreError>;

    async fn get_docs(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Inserts a document under a fresh id.
    async fn add_doc(&self, collection: &CollectionRef, fields: Fields)
        -> Result<DocRef, StoreError>;

    /// Creates or replaces the document at `doc`, preserving its `createdAt`.
    async fn set_doc(&self, doc: &DocRef, fields: Fields) -> Result<(), StoreError>;

    /// Merges `fields` into an existing document.
    async fn update_doc(&self, doc: &DocRef, fields: Fields) -> Result<(), StoreError>;

    async fn delete_doc(&self, doc: &DocRef) -> Result<(), StoreError>;

    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    /// Feed of collection names touched by writes.
    fn changes(&self) -> broadcast::Receiver<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => Fields::new(),
        }
    }

    #[test]
    fn filters_cover_equality_membership_and_array_contains() {
        let group = fields(json!({
            "competitionId": "c1",
            "members": ["s1", "s2"],
            "date": "2026-10-18"
        }));

        let eq = query(&collection(GROUPS)).filter("competitionId", Op::Eq, "c1");
        assert!(eq.matches(&group));

        let within = query(&collection(GROUPS)).filter(
            "date",
            Op::In,
            json!(["2026-10-18", "2026-10-19"]),
        );
        assert!(within.matches(&group));

        let contains = query(&collection(GROUPS)).filter("members", Op::ArrayContains, "s2");
        assert!(contains.matches(&group));

        let missing = query(&collection(GROUPS)).filter("members", Op::ArrayContains, "s9");
        assert!(!missing.matches(&group));

        let absent_field = query(&collection(GROUPS)).filter("leader", Op::Eq, "s1");
        assert!(!absent_field.matches(&group));
    }

    #[test]
    fn stamp_new_keeps_existing_created_at() {
        let mut doc = fields(json!({ "createdAt": "2026-01-01T00:00:00+00:00" }));
        stamp_new(&mut doc);
        assert_eq!(doc[CREATED_AT], json!("2026-01-01T00:00:00+00:00"));
        assert!(doc.contains_key(UPDATED_AT));
    }
}
