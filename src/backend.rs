use crate::error::Result;
use crate::filter::{FilterOp, FilterSet};
use crate::query::QuerySpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A record as sent to or returned by a backend, in column order
pub type Record = Map<String, Value>;

/// Row from a query result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryRow {
    pub columns: Record,
}

impl QueryRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, value: Value) {
        self.columns.insert(key, value);
    }

    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.columns
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.columns
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.columns.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.columns.get(key).and_then(|v| v.as_bool())
    }

    /// Column names in order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }
}

impl From<Record> for QueryRow {
    fn from(columns: Record) -> Self {
        Self { columns }
    }
}

/// Result of a query
pub type QueryResult = Vec<QueryRow>;

/// What an insert produced
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The backend echoed the stored row
    Inserted(QueryRow),
    /// The backend acknowledged the insert without returning the row
    NoDataReturned,
}

impl InsertOutcome {
    pub fn row(&self) -> Option<&QueryRow> {
        match self {
            InsertOutcome::Inserted(row) => Some(row),
            InsertOutcome::NoDataReturned => None,
        }
    }
}

/// Data access backend.
///
/// Implementations must be usable from many concurrent requests through a
/// shared reference. Backend failures surface as `DbError::Backend` (or a
/// driver error) and are never swallowed.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Operators this backend can apply. Filter strings are parsed against this set.
    fn operators(&self) -> &'static [FilterOp];

    /// Run a read. No matching rows is an empty result, not an error.
    async fn select(&self, spec: &QuerySpec) -> Result<QueryResult>;

    /// Insert one record
    async fn insert(&self, table: &str, record: &Record) -> Result<InsertOutcome>;

    /// Update rows matching `filters`; returns the updated rows.
    /// An empty filter set is a `DbError::Validation`.
    async fn update(&self, table: &str, values: &Record, filters: &FilterSet)
        -> Result<QueryResult>;

    /// Delete rows matching `filters`; returns the deleted rows.
    /// An empty filter set is a `DbError::Validation`.
    async fn delete(&self, table: &str, filters: &FilterSet) -> Result<QueryResult>;

    /// Whether the backend currently holds a usable connection
    fn is_connected(&self) -> bool;
}
