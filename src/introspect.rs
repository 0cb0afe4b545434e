//! Schema introspection from the standard `information_schema` views.
//!
//! Every call reads the catalog fresh; nothing is cached between calls.

use crate::backend::{QueryBackend, QueryRow};
use crate::error::{DbError, Result};
use crate::query::QuerySpec;
use crate::value::Scalar;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Schema introspection is restricted to this namespace
pub const DEFAULT_SCHEMA: &str = "public";

const CATALOG: &str = "information_schema";

/// Column definition as reported by the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub ordinal_position: i32,
}

/// One foreign key column pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationshipDescriptor {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

/// Table schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub relationships: Vec<RelationshipDescriptor>,
}

/// Source of catalog metadata
#[async_trait]
pub trait SchemaIntrospector: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Table names, sorted
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Columns of `table` in ordinal order. Unknown tables yield no columns.
    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnDescriptor>>;

    /// Foreign keys declared on `table`, or on every table when `None`
    async fn relationships(&self, table: Option<&str>) -> Result<Vec<RelationshipDescriptor>>;

    /// Columns and relationships of one table
    async fn table_schema(&self, table: &str) -> Result<TableSchema> {
        let columns = self.describe_table(table).await?;
        let relationships = self.relationships(Some(table)).await?;
        Ok(TableSchema {
            name: table.to_string(),
            columns,
            relationships,
        })
    }
}

/// Put columns in ordinal order
pub fn sort_columns(columns: &mut [ColumnDescriptor]) {
    columns.sort_by_key(|c| c.ordinal_position);
}

/// Stable relationship order: source table, source column, target
pub fn sort_relationships(relationships: &mut Vec<RelationshipDescriptor>) {
    relationships.sort();
    relationships.dedup();
}

fn text(row: &QueryRow, key: &str) -> Result<String> {
    row.get_string(key).ok_or_else(|| {
        DbError::backend(format!("catalog row is missing text column '{}'", key))
    })
}

/// Catalog integers come back as numbers or, through some gateways, strings.
fn integer(row: &QueryRow, key: &str) -> Result<i32> {
    let value = row.columns.get(key);
    value
        .and_then(Value::as_i64)
        .or_else(|| value.and_then(Value::as_str).and_then(|s| s.parse().ok()))
        .and_then(|n| i32::try_from(n).ok())
        .ok_or_else(|| DbError::backend(format!("catalog row is missing integer column '{}'", key)))
}

/// `YES`/`NO` as used by the catalog, or a plain boolean
fn yes_no(row: &QueryRow, key: &str) -> Result<bool> {
    match row.columns.get(key) {
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::String(s)) => Ok(s.eq_ignore_ascii_case("yes")),
        _ => Err(DbError::backend(format!("catalog row is missing flag column '{}'", key))),
    }
}

/// Build a column descriptor from a `information_schema.columns` row
pub fn column_from_row(row: &QueryRow) -> Result<ColumnDescriptor> {
    Ok(ColumnDescriptor {
        name: text(row, "column_name")?,
        data_type: text(row, "data_type")?,
        nullable: yes_no(row, "is_nullable")?,
        default: row.get_string("column_default"),
        ordinal_position: integer(row, "ordinal_position")?,
    })
}

/// Introspection through plain catalog reads on any [`QueryBackend`].
///
/// Relationships take three lookups per foreign key constraint
/// (`table_constraints`, then `key_column_usage` and `constraint_column_usage`)
/// because a REST-style backend cannot join catalog views.
pub struct CatalogIntrospector<B: QueryBackend> {
    backend: Arc<B>,
    schema: String,
}

impl<B: QueryBackend> CatalogIntrospector<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            schema: DEFAULT_SCHEMA.to_string(),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    fn catalog(&self, view: &str) -> QuerySpec {
        QuerySpec::new(view).in_schema(CATALOG)
    }

    fn in_schema(&self) -> Scalar {
        Scalar::Text(self.schema.clone())
    }

    async fn constraint_pairs(
        &self,
        table: &str,
        constraint: &str,
    ) -> Result<Vec<RelationshipDescriptor>> {
        let sources = self
            .backend
            .select(
                &self
                    .catalog("key_column_usage")
                    .select(vec!["column_name", "ordinal_position"])
                    .where_eq("constraint_name", Scalar::Text(constraint.to_string()))
                    .where_eq("table_schema", self.in_schema())
                    .where_eq("table_name", Scalar::Text(table.to_string()))
                    .order_asc("ordinal_position"),
            )
            .await?;

        let targets = self
            .backend
            .select(
                &self
                    .catalog("constraint_column_usage")
                    .select(vec!["table_name", "column_name"])
                    .where_eq("constraint_name", Scalar::Text(constraint.to_string()))
                    .where_eq("table_schema", self.in_schema()),
            )
            .await?;

        let mut pairs = Vec::with_capacity(sources.len() * targets.len());
        for source in &sources {
            for target in &targets {
                pairs.push(RelationshipDescriptor {
                    from_table: table.to_string(),
                    from_column: text(source, "column_name")?,
                    to_table: text(target, "table_name")?,
                    to_column: text(target, "column_name")?,
                });
            }
        }
        Ok(pairs)
    }
}

#[async_trait]
impl<B: QueryBackend> SchemaIntrospector for CatalogIntrospector<B> {
    fn name(&self) -> &'static str {
        self.backend.name()
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let rows = self
            .backend
            .select(
                &self
                    .catalog("tables")
                    .select(vec!["table_name"])
                    .where_eq("table_schema", self.in_schema())
                    .order_asc("table_name"),
            )
            .await?;

        rows.iter().map(|row| text(row, "table_name")).collect()
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let rows = self
            .backend
            .select(
                &self
                    .catalog("columns")
                    .select(vec![
                        "column_name",
                        "data_type",
                        "is_nullable",
                        "column_default",
                        "ordinal_position",
                    ])
                    .where_eq("table_schema", self.in_schema())
                    .where_eq("table_name", Scalar::Text(table.to_string()))
                    .order_asc("ordinal_position"),
            )
            .await?;

        let mut columns = rows.iter().map(column_from_row).collect::<Result<Vec<_>>>()?;
        sort_columns(&mut columns);
        Ok(columns)
    }

    async fn relationships(&self, table: Option<&str>) -> Result<Vec<RelationshipDescriptor>> {
        let mut spec = self
            .catalog("table_constraints")
            .select(vec!["constraint_name", "table_name"])
            .where_eq("constraint_type", Scalar::Text("FOREIGN KEY".to_string()))
            .where_eq("table_schema", self.in_schema())
            .order_asc("table_name");
        if let Some(table) = table {
            spec = spec.where_eq("table_name", Scalar::Text(table.to_string()));
        }

        let constraints = self.backend.select(&spec).await?;

        let mut relationships = Vec::new();
        for constraint in &constraints {
            let name = text(constraint, "constraint_name")?;
            let owner = text(constraint, "table_name")?;
            relationships.extend(self.constraint_pairs(&owner, &name).await?);
        }

        sort_relationships(&mut relationships);
        Ok(relationships)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use serde_json::json;

    fn row(value: Value) -> QueryRow {
        value.as_object().cloned().unwrap().into()
    }

    fn users_and_orgs() -> Arc<MemoryBackend> {
        let backend = MemoryBackend::new();
        backend.create_table("orgs", &[("id", "integer", false, None), ("name", "text", false, None)]);
        backend.create_table(
            "users",
            &[
                ("id", "integer", false, None),
                ("email", "text", false, None),
                ("role", "text", true, Some("'guest'")),
                ("org_id", "integer", true, None),
            ],
        );
        backend.add_foreign_key("users", "org_id", "orgs", "id");
        Arc::new(backend)
    }

    #[test]
    fn test_column_from_row() {
        let column = column_from_row(&row(json!({
            "column_name": "role",
            "data_type": "text",
            "is_nullable": "YES",
            "column_default": "'guest'::text",
            "ordinal_position": "3"
        })))
        .unwrap();

        assert_eq!(
            column,
            ColumnDescriptor {
                name: "role".into(),
                data_type: "text".into(),
                nullable: true,
                default: Some("'guest'::text".into()),
                ordinal_position: 3,
            }
        );
    }

    #[test]
    fn test_column_from_row_missing_field() {
        let err = column_from_row(&row(json!({"column_name": "id"}))).unwrap_err();
        assert!(err.is_backend());
    }

    #[tokio::test]
    async fn test_catalog_list_tables() {
        let introspector = CatalogIntrospector::new(users_and_orgs());
        assert_eq!(introspector.list_tables().await.unwrap(), vec!["orgs", "users"]);
    }

    #[tokio::test]
    async fn test_catalog_describe_table_in_ordinal_order() {
        let introspector = CatalogIntrospector::new(users_and_orgs());
        let columns = introspector.describe_table("users").await.unwrap();

        let names: Vec<_> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "email", "role", "org_id"]);
        assert!(!columns[0].nullable);
        assert_eq!(columns[2].default.as_deref(), Some("'guest'"));
    }

    #[tokio::test]
    async fn test_catalog_describe_unknown_table() {
        let introspector = CatalogIntrospector::new(users_and_orgs());
        assert!(introspector.describe_table("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_catalog_relationships() {
        let introspector = CatalogIntrospector::new(users_and_orgs());

        let expected = vec![RelationshipDescriptor {
            from_table: "users".into(),
            from_column: "org_id".into(),
            to_table: "orgs".into(),
            to_column: "id".into(),
        }];
        assert_eq!(introspector.relationships(Some("users")).await.unwrap(), expected);
        assert_eq!(introspector.relationships(None).await.unwrap(), expected);
        assert!(introspector.relationships(Some("orgs")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_same_constraint_name_on_two_tables() {
        let backend = users_and_orgs();
        backend.create_table("teams", &[("id", "integer", false, None), ("org_id", "integer", false, None)]);
        // Postgres only requires constraint names to be unique per table.
        backend.add_named_foreign_key("users_org_id_fkey", "teams", "org_id", "orgs", "id");

        let introspector = CatalogIntrospector::new(backend);
        let all = introspector.relationships(None).await.unwrap();

        assert_eq!(all.len(), 2);
        assert_eq!(all[0].from_table, "teams");
        assert_eq!(all[1].from_table, "users");
    }
}
