//! Primary/Secondary selection for introspection.
//!
//! The Primary (direct SQL) is tried first when one is configured. Any error
//! from it sends that single unit of work to the Secondary exactly once.
//! There is no retry beyond that.

use crate::error::Result;
use crate::introspect::{ColumnDescriptor, RelationshipDescriptor, SchemaIntrospector, TableSchema};
use crate::settings::dedup_tables;
use async_trait::async_trait;
use futures::future::join_all;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a schema-gathering pass over several tables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaSnapshot {
    /// Tables that were described, in request order
    pub tables: IndexMap<String, TableSchema>,
    /// Tables that failed on every backend
    pub failed: Vec<String>,
}

impl SchemaSnapshot {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

pub struct SchemaResolver {
    primary: Option<Arc<dyn SchemaIntrospector>>,
    secondary: Arc<dyn SchemaIntrospector>,
}

impl SchemaResolver {
    /// Resolver with only the always-available Secondary
    pub fn new(secondary: Arc<dyn SchemaIntrospector>) -> Self {
        Self {
            primary: None,
            secondary,
        }
    }

    pub fn with_primary(mut self, primary: Arc<dyn SchemaIntrospector>) -> Self {
        self.primary = Some(primary);
        self
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    pub fn secondary(&self) -> &Arc<dyn SchemaIntrospector> {
        &self.secondary
    }

    /// Tables of every requested name, falling back per table.
    ///
    /// Lookups run concurrently, once per distinct name. A table that fails
    /// on both backends is listed in [`SchemaSnapshot::failed`] and the
    /// others are unaffected.
    pub async fn gather(&self, tables: &[String]) -> SchemaSnapshot {
        let tables = dedup_tables(tables.iter().cloned());
        let results = join_all(tables.iter().map(|table| self.table_schema(table))).await;

        let mut snapshot = SchemaSnapshot::default();
        for (table, result) in tables.iter().zip(results) {
            match result {
                Ok(schema) => {
                    snapshot.tables.insert(table.clone(), schema);
                }
                Err(err) => {
                    warn!(table = %table, error = %err, "schema lookup failed on every backend");
                    snapshot.failed.push(table.clone());
                }
            }
        }

        debug!(
            described = snapshot.tables.len(),
            failed = snapshot.failed.len(),
            "schema gathering finished"
        );
        snapshot
    }
}

#[async_trait]
impl SchemaIntrospector for SchemaResolver {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        if let Some(primary) = &self.primary {
            match primary.list_tables().await {
                Ok(tables) if !tables.is_empty() => return Ok(tables),
                Ok(_) => info!(
                    primary = primary.name(),
                    "primary reported no tables; asking {}",
                    self.secondary.name()
                ),
                Err(err) => warn!(
                    primary = primary.name(),
                    error = %err,
                    "listing tables failed; falling back to {}",
                    self.secondary.name()
                ),
            }
        }
        self.secondary.list_tables().await
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        if let Some(primary) = &self.primary {
            match primary.describe_table(table).await {
                Ok(columns) => return Ok(columns),
                Err(err) => warn!(
                    table = %table,
                    error = %err,
                    "describe failed on {}; falling back to {}",
                    primary.name(),
                    self.secondary.name()
                ),
            }
        }
        self.secondary.describe_table(table).await
    }

    async fn relationships(&self, table: Option<&str>) -> Result<Vec<RelationshipDescriptor>> {
        if let Some(primary) = &self.primary {
            match primary.relationships(table).await {
                Ok(relationships) => return Ok(relationships),
                Err(err) => warn!(
                    table = table.unwrap_or("*"),
                    error = %err,
                    "relationship lookup failed on {}; falling back to {}",
                    primary.name(),
                    self.secondary.name()
                ),
            }
        }
        self.secondary.relationships(table).await
    }

    /// Columns and relationships come from the same backend so a table is
    /// never described half by one and half by the other.
    async fn table_schema(&self, table: &str) -> Result<TableSchema> {
        if let Some(primary) = &self.primary {
            match primary.table_schema(table).await {
                Ok(schema) => return Ok(schema),
                Err(err) => warn!(
                    table = %table,
                    error = %err,
                    "schema lookup failed on {}; falling back to {}",
                    primary.name(),
                    self.secondary.name()
                ),
            }
        }
        self.secondary.table_schema(table).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::DbError;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-process introspector with per-table failure injection
    #[derive(Default)]
    pub(crate) struct StubIntrospector {
        pub(crate) tables: Vec<String>,
        pub(crate) columns: HashMap<String, Vec<ColumnDescriptor>>,
        pub(crate) relationships: Vec<RelationshipDescriptor>,
        pub(crate) failing: HashSet<String>,
        pub(crate) unavailable: bool,
        pub(crate) calls: AtomicUsize,
    }

    impl StubIntrospector {
        pub(crate) fn with_table(mut self, table: &str, columns: &[(&str, &str)]) -> Self {
            self.tables.push(table.to_string());
            let columns = columns
                .iter()
                .enumerate()
                .map(|(i, (name, data_type))| ColumnDescriptor {
                    name: name.to_string(),
                    data_type: data_type.to_string(),
                    nullable: false,
                    default: None,
                    ordinal_position: i as i32 + 1,
                })
                .collect();
            self.columns.insert(table.to_string(), columns);
            self
        }

        pub(crate) fn failing_on(mut self, table: &str) -> Self {
            self.failing.insert(table.to_string());
            self
        }

        pub(crate) fn unavailable() -> Self {
            Self {
                unavailable: true,
                ..Self::default()
            }
        }

        fn check(&self, table: Option<&str>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.unavailable {
                return Err(DbError::Configuration("POSTGRES_CONNECTION_STRING is not set".into()));
            }
            if let Some(table) = table {
                if self.failing.contains(table) {
                    return Err(DbError::backend(format!("permission denied for table {}", table)));
                }
            }
            Ok(())
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SchemaIntrospector for StubIntrospector {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn list_tables(&self) -> Result<Vec<String>> {
            self.check(None)?;
            let mut tables = self.tables.clone();
            tables.sort();
            Ok(tables)
        }

        async fn describe_table(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
            self.check(Some(table))?;
            Ok(self.columns.get(table).cloned().unwrap_or_default())
        }

        async fn relationships(&self, table: Option<&str>) -> Result<Vec<RelationshipDescriptor>> {
            self.check(table)?;
            Ok(self
                .relationships
                .iter()
                .filter(|r| table.map(|t| r.from_table == t).unwrap_or(true))
                .cloned()
                .collect())
        }
    }

    fn names(tables: &[&str]) -> Vec<String> {
        tables.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn test_primary_failure_falls_back_for_that_table_only() {
        let primary = Arc::new(
            StubIntrospector::default()
                .with_table("users", &[("id", "integer")])
                .with_table("orders", &[("id", "integer")])
                .failing_on("orders"),
        );
        let secondary = Arc::new(
            StubIntrospector::default()
                .with_table("users", &[("id", "bigint")])
                .with_table("orders", &[("id", "bigint"), ("total", "numeric")]),
        );

        let resolver = SchemaResolver::new(secondary.clone()).with_primary(primary);
        let snapshot = resolver.gather(&names(&["users", "orders"])).await;

        assert!(snapshot.failed.is_empty());
        assert_eq!(snapshot.tables.keys().collect::<Vec<_>>(), vec!["users", "orders"]);
        assert_eq!(snapshot.tables["users"].columns[0].data_type, "integer");
        assert_eq!(snapshot.tables["orders"].columns.len(), 2);
    }

    #[tokio::test]
    async fn test_failure_on_both_backends_is_isolated() {
        let primary = Arc::new(
            StubIntrospector::default()
                .with_table("users", &[("id", "integer")])
                .failing_on("orders"),
        );
        let secondary = Arc::new(StubIntrospector::default().failing_on("orders"));

        let resolver = SchemaResolver::new(secondary).with_primary(primary);
        let snapshot = resolver.gather(&names(&["orders", "users"])).await;

        assert_eq!(snapshot.failed, vec!["orders"]);
        assert!(!snapshot.tables.contains_key("orders"));
        assert!(snapshot.tables.contains_key("users"));
    }

    #[tokio::test]
    async fn test_repeated_names_gathered_once() {
        let secondary = Arc::new(
            StubIntrospector::default()
                .with_table("users", &[("id", "integer")])
                .failing_on("orders"),
        );

        let resolver = SchemaResolver::new(secondary.clone());
        let snapshot = resolver
            .gather(&names(&["orders", "users", "orders", "users"]))
            .await;

        assert_eq!(snapshot.failed, vec!["orders"]);
        assert_eq!(snapshot.tables.keys().collect::<Vec<_>>(), vec!["users"]);
    }

    #[tokio::test]
    async fn test_unavailable_primary_uses_secondary() {
        let primary = Arc::new(StubIntrospector::unavailable());
        let secondary = Arc::new(StubIntrospector::default().with_table("users", &[("id", "integer")]));

        let resolver = SchemaResolver::new(secondary.clone()).with_primary(primary.clone());

        assert_eq!(resolver.list_tables().await.unwrap(), vec!["users"]);
        assert_eq!(resolver.describe_table("users").await.unwrap().len(), 1);
        assert!(resolver.relationships(None).await.unwrap().is_empty());
        assert_eq!(primary.calls(), 3);
    }

    #[tokio::test]
    async fn test_secondary_untouched_when_primary_succeeds() {
        let primary = Arc::new(StubIntrospector::default().with_table("users", &[("id", "integer")]));
        let secondary = Arc::new(StubIntrospector::default());

        let resolver = SchemaResolver::new(secondary.clone()).with_primary(primary);
        resolver.gather(&names(&["users"])).await;
        resolver.list_tables().await.unwrap();

        assert_eq!(secondary.calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_primary_table_list_asks_secondary() {
        let primary = Arc::new(StubIntrospector::default());
        let secondary = Arc::new(StubIntrospector::default().with_table("users", &[("id", "integer")]));

        let resolver = SchemaResolver::new(secondary).with_primary(primary);
        assert_eq!(resolver.list_tables().await.unwrap(), vec!["users"]);
    }

    #[tokio::test]
    async fn test_without_primary_errors_propagate() {
        let resolver = SchemaResolver::new(Arc::new(StubIntrospector::unavailable()));
        assert!(!resolver.has_primary());
        assert!(resolver.list_tables().await.unwrap_err().is_configuration());
    }
}
