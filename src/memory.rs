//! In-memory backend for tests and local development.
//!
//! Tables live in process memory and the `information_schema` views are kept
//! in step with `create_table` / `add_foreign_key`, so catalog introspection
//! works against it exactly as it does against a live server.

use crate::backend::{InsertOutcome, QueryBackend, QueryResult, QueryRow, Record};
use crate::error::{DbError, Result};
use crate::filter::{FilterOp, FilterSet, Predicate};
use crate::introspect::DEFAULT_SCHEMA;
use crate::query::{QuerySpec, SortDirection};
use crate::value::Scalar;
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::cmp::Ordering;

const CATALOG: &str = "information_schema";

#[derive(Debug, Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Record>,
}

/// Column declaration for [`MemoryBackend::create_table`]:
/// name, data type, nullable, default expression.
pub type ColumnSpec<'a> = (&'a str, &'a str, bool, Option<&'a str>);

pub struct MemoryBackend {
    tables: RwLock<IndexMap<(String, String), Table>>,
    echo_writes: bool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let mut tables = IndexMap::new();
        let views: [(&str, &[&str]); 5] = [
            ("tables", &["table_schema", "table_name", "table_type"]),
            (
                "columns",
                &[
                    "table_schema",
                    "table_name",
                    "column_name",
                    "data_type",
                    "is_nullable",
                    "column_default",
                    "ordinal_position",
                ],
            ),
            (
                "table_constraints",
                &["constraint_name", "table_schema", "table_name", "constraint_type"],
            ),
            (
                "key_column_usage",
                &[
                    "constraint_name",
                    "table_schema",
                    "table_name",
                    "column_name",
                    "ordinal_position",
                ],
            ),
            (
                "constraint_column_usage",
                &["constraint_name", "table_schema", "table_name", "column_name"],
            ),
        ];
        for (view, columns) in views {
            tables.insert(
                (CATALOG.to_string(), view.to_string()),
                Table {
                    columns: columns.iter().map(|c| c.to_string()).collect(),
                    rows: Vec::new(),
                },
            );
        }

        Self {
            tables: RwLock::new(tables),
            echo_writes: true,
        }
    }

    /// Acknowledge inserts without returning the stored row
    pub fn without_echo(mut self) -> Self {
        self.echo_writes = false;
        self
    }

    fn push_catalog(&self, view: &str, row: Value) {
        let Value::Object(record) = row else {
            return;
        };
        let mut tables = self.tables.write();
        if let Some(table) = tables.get_mut(&(CATALOG.to_string(), view.to_string())) {
            table.rows.push(record);
        }
    }

    /// Create a table in the default schema and register it in the catalog
    pub fn create_table(&self, name: &str, columns: &[ColumnSpec<'_>]) {
        self.tables.write().insert(
            (DEFAULT_SCHEMA.to_string(), name.to_string()),
            Table {
                columns: columns.iter().map(|c| c.0.to_string()).collect(),
                rows: Vec::new(),
            },
        );

        self.push_catalog(
            "tables",
            json!({"table_schema": DEFAULT_SCHEMA, "table_name": name, "table_type": "BASE TABLE"}),
        );
        for (position, (column, data_type, nullable, default)) in columns.iter().enumerate() {
            self.push_catalog(
                "columns",
                json!({
                    "table_schema": DEFAULT_SCHEMA,
                    "table_name": name,
                    "column_name": column,
                    "data_type": data_type,
                    "is_nullable": if *nullable { "YES" } else { "NO" },
                    "column_default": default,
                    "ordinal_position": position + 1,
                }),
            );
        }
    }

    /// Declare `from_table.from_column -> to_table.to_column`, named the way
    /// Postgres names it by default
    pub fn add_foreign_key(&self, from_table: &str, from_column: &str, to_table: &str, to_column: &str) {
        let name = format!("{}_{}_fkey", from_table, from_column);
        self.add_named_foreign_key(&name, from_table, from_column, to_table, to_column);
    }

    pub fn add_named_foreign_key(
        &self,
        constraint: &str,
        from_table: &str,
        from_column: &str,
        to_table: &str,
        to_column: &str,
    ) {
        self.push_catalog(
            "table_constraints",
            json!({
                "constraint_name": constraint,
                "table_schema": DEFAULT_SCHEMA,
                "table_name": from_table,
                "constraint_type": "FOREIGN KEY",
            }),
        );
        self.push_catalog(
            "key_column_usage",
            json!({
                "constraint_name": constraint,
                "table_schema": DEFAULT_SCHEMA,
                "table_name": from_table,
                "column_name": from_column,
                "ordinal_position": 1,
            }),
        );
        self.push_catalog(
            "constraint_column_usage",
            json!({
                "constraint_name": constraint,
                "table_schema": DEFAULT_SCHEMA,
                "table_name": to_table,
                "column_name": to_column,
            }),
        );
    }

    /// Snapshot of a table's rows
    pub fn rows(&self, table: &str) -> QueryResult {
        self.tables
            .read()
            .get(&(DEFAULT_SCHEMA.to_string(), table.to_string()))
            .map(|t| t.rows.iter().cloned().map(QueryRow::from).collect())
            .unwrap_or_default()
    }
}

fn missing_relation(schema: &str, table: &str) -> DbError {
    DbError::backend_with_payload(
        format!("relation \"{}.{}\" does not exist", schema, table),
        json!({"code": "42P01"}),
    )
}

fn check_columns<'a>(table: &Table, name: &str, columns: impl Iterator<Item = &'a String>) -> Result<()> {
    for column in columns {
        if !table.columns.contains(column) {
            return Err(DbError::backend_with_payload(
                format!("column {}.{} does not exist", name, column),
                json!({"code": "42703"}),
            ));
        }
    }
    Ok(())
}

fn text_form(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn compare(value: &Value, scalar: &Scalar) -> Option<Ordering> {
    match (value, scalar) {
        (Value::Null, _) | (_, Scalar::Null) => None,
        (Value::Number(n), Scalar::Int(i)) => n.as_f64()?.partial_cmp(&(*i as f64)),
        (Value::Number(n), Scalar::Text(s)) => n.as_f64()?.partial_cmp(&s.parse::<f64>().ok()?),
        (Value::Bool(a), Scalar::Bool(b)) => Some(a.cmp(b)),
        (value, scalar) => Some(text_form(value)?.as_str().cmp(scalar.to_param().as_str())),
    }
}

/// SQL LIKE with `%` (or PostgREST's `*`) and `_`
fn like(text: &str, pattern: &str, case_insensitive: bool) -> bool {
    let fold = |s: &str| -> Vec<char> {
        if case_insensitive {
            s.to_lowercase().chars().collect()
        } else {
            s.chars().collect()
        }
    };
    let text = fold(text);
    let pattern = fold(pattern);

    // matched[j]: pattern[..j] matches the text consumed so far
    let mut matched = vec![false; pattern.len() + 1];
    matched[0] = true;
    for j in 1..=pattern.len() {
        matched[j] = matched[j - 1] && matches!(pattern[j - 1], '%' | '*');
    }

    for c in text {
        let mut next = vec![false; pattern.len() + 1];
        for j in 1..=pattern.len() {
            next[j] = match pattern[j - 1] {
                '%' | '*' => next[j - 1] || matched[j],
                '_' => matched[j - 1],
                p => matched[j - 1] && p == c,
            };
        }
        matched = next;
    }

    matched[pattern.len()]
}

fn matches(row: &Record, predicate: &Predicate) -> bool {
    let value = row.get(&predicate.column).unwrap_or(&Value::Null);

    match (predicate.op, &predicate.value) {
        (FilterOp::Eq | FilterOp::Is, Scalar::Null) => value.is_null(),
        (FilterOp::Neq, Scalar::Null) => !value.is_null(),
        (FilterOp::Is, Scalar::Bool(b)) => value == &Value::Bool(*b),
        (FilterOp::Is, _) => false,
        (FilterOp::Eq, scalar) => compare(value, scalar) == Some(Ordering::Equal),
        (FilterOp::Neq, scalar) => matches!(compare(value, scalar), Some(o) if o != Ordering::Equal),
        (FilterOp::Gt, scalar) => compare(value, scalar) == Some(Ordering::Greater),
        (FilterOp::Gte, scalar) => matches!(compare(value, scalar), Some(o) if o != Ordering::Less),
        (FilterOp::Lt, scalar) => compare(value, scalar) == Some(Ordering::Less),
        (FilterOp::Lte, scalar) => matches!(compare(value, scalar), Some(o) if o != Ordering::Greater),
        (op @ (FilterOp::Like | FilterOp::ILike), scalar) => text_form(value)
            .map(|t| like(&t, &scalar.to_param(), op == FilterOp::ILike))
            .unwrap_or(false),
    }
}

fn matches_all(row: &Record, filters: &FilterSet) -> bool {
    filters.predicates().all(|p| matches(row, &p))
}

/// Ascending order with nulls last
fn order_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (x, y) => text_form(x).cmp(&text_form(y)),
    }
}

#[async_trait]
impl QueryBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn operators(&self) -> &'static [FilterOp] {
        &FilterOp::ALL
    }

    async fn select(&self, spec: &QuerySpec) -> Result<QueryResult> {
        spec.validate()?;
        let schema = spec.schema.as_deref().unwrap_or(DEFAULT_SCHEMA);
        let tables = self.tables.read();
        let table = tables
            .get(&(schema.to_string(), spec.table.clone()))
            .ok_or_else(|| missing_relation(schema, &spec.table))?;

        if !spec.selects_all() {
            check_columns(table, &spec.table, spec.select.iter())?;
        }
        check_columns(
            table,
            &spec.table,
            spec.filters.predicates().map(|p| p.column).collect::<Vec<_>>().iter(),
        )?;

        let mut rows: Vec<&Record> = table
            .rows
            .iter()
            .filter(|row| matches_all(row, &spec.filters))
            .collect();

        if let Some(order) = &spec.order {
            rows.sort_by(|a, b| {
                let ordering = order_values(
                    a.get(&order.column).unwrap_or(&Value::Null),
                    b.get(&order.column).unwrap_or(&Value::Null),
                );
                match order.direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                }
            });
        }

        let offset = spec.offset.unwrap_or(0) as usize;
        let limit = spec.limit.map(|l| l as usize).unwrap_or(usize::MAX);

        Ok(rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|row| {
                if spec.selects_all() {
                    QueryRow::from(row.clone())
                } else {
                    let mut projected = QueryRow::new();
                    for column in &spec.select {
                        projected.insert(
                            column.clone(),
                            row.get(column).cloned().unwrap_or(Value::Null),
                        );
                    }
                    projected
                }
            })
            .collect())
    }

    async fn insert(&self, table_name: &str, record: &Record) -> Result<InsertOutcome> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(&(DEFAULT_SCHEMA.to_string(), table_name.to_string()))
            .ok_or_else(|| missing_relation(DEFAULT_SCHEMA, table_name))?;
        check_columns(table, table_name, record.keys())?;

        let mut stored = Record::new();
        for column in &table.columns {
            stored.insert(column.clone(), record.get(column).cloned().unwrap_or(Value::Null));
        }
        table.rows.push(stored.clone());

        Ok(if self.echo_writes {
            InsertOutcome::Inserted(stored.into())
        } else {
            InsertOutcome::NoDataReturned
        })
    }

    async fn update(
        &self,
        table_name: &str,
        values: &Record,
        filters: &FilterSet,
    ) -> Result<QueryResult> {
        filters.require_any("update")?;
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(&(DEFAULT_SCHEMA.to_string(), table_name.to_string()))
            .ok_or_else(|| missing_relation(DEFAULT_SCHEMA, table_name))?;
        check_columns(table, table_name, values.keys())?;

        let mut updated = Vec::new();
        for row in table.rows.iter_mut().filter(|row| matches_all(row, filters)) {
            for (column, value) in values {
                row.insert(column.clone(), value.clone());
            }
            updated.push(QueryRow::from(row.clone()));
        }
        Ok(updated)
    }

    async fn delete(&self, table_name: &str, filters: &FilterSet) -> Result<QueryResult> {
        filters.require_any("delete")?;
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(&(DEFAULT_SCHEMA.to_string(), table_name.to_string()))
            .ok_or_else(|| missing_relation(DEFAULT_SCHEMA, table_name))?;

        let (deleted, kept): (Vec<Record>, Vec<Record>) = table
            .rows
            .drain(..)
            .partition(|row| matches_all(row, filters));
        table.rows = kept;

        Ok(deleted.into_iter().map(QueryRow::from).collect())
    }

    fn is_connected(&self) -> bool {
        true
    }
}
