//! Plain-text renderings for agents.
//!
//! Everything here is pure. The same input always produces byte-identical
//! output, which the snapshot tests rely on.

use crate::backend::{InsertOutcome, QueryRow};
use crate::error::DbError;
use crate::introspect::{ColumnDescriptor, RelationshipDescriptor, TableSchema};
use indexmap::IndexMap;
use serde::Serialize;

pub const SCHEMA_HEADER: &str = "DATABASE SCHEMA INFORMATION:";

fn pretty<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|err| format!("<unserializable: {}>", err))
}

fn json_block(value: &impl Serialize) -> String {
    format!("```json\n{}\n```", pretty(value))
}

/// `  - {name}: {type} {NULL|NOT NULL}[ DEFAULT {expr}]`
fn column_line(column: &ColumnDescriptor) -> String {
    let nullable = if column.nullable { "NULL" } else { "NOT NULL" };
    let default = match column.default.as_deref() {
        Some(expr) if !expr.is_empty() => format!(" DEFAULT {}", expr),
        _ => String::new(),
    };
    format!("  - {}: {} {}{}\n", column.name, column.data_type, nullable, default)
}

fn relationship_line(relationship: &RelationshipDescriptor) -> String {
    format!(
        "  - {} -> {}.{}\n",
        relationship.from_column, relationship.to_table, relationship.to_column
    )
}

/// Schema block for the system message, tables in mapping order
pub fn format_schema(tables: &IndexMap<String, TableSchema>) -> String {
    let mut out = format!("{}\n\n", SCHEMA_HEADER);

    for (name, table) in tables {
        out.push_str(&format!("Table: {}\n", name));
        out.push_str("Columns:\n");
        for column in &table.columns {
            out.push_str(&column_line(column));
        }

        if !table.relationships.is_empty() {
            out.push_str("Relationships:\n");
            for relationship in &table.relationships {
                out.push_str(&relationship_line(relationship));
            }
        }

        out.push('\n');
    }

    out
}

pub fn render_query(table: &str, rows: &[QueryRow]) -> String {
    if rows.is_empty() {
        return format!("No records found in table '{}' matching the criteria.", table);
    }
    format!("Query results from '{}':\n\n{}", table, json_block(&rows))
}

pub fn render_insert(table: &str, outcome: &InsertOutcome) -> String {
    match outcome {
        InsertOutcome::Inserted(row) => format!(
            "Successfully inserted record into '{}':\n\n{}",
            table,
            json_block(row)
        ),
        InsertOutcome::NoDataReturned => format!(
            "Record was inserted into '{}', but no data was returned.",
            table
        ),
    }
}

pub fn render_update(table: &str, rows: &[QueryRow]) -> String {
    if rows.is_empty() {
        return format!("No records in '{}' were updated matching the filter criteria.", table);
    }
    format!(
        "Successfully updated {} record(s) in '{}':\n\n{}",
        rows.len(),
        table,
        json_block(&rows)
    )
}

pub fn render_delete(table: &str, rows: &[QueryRow]) -> String {
    if rows.is_empty() {
        return format!("No records in '{}' were deleted matching the filter criteria.", table);
    }
    format!(
        "Successfully deleted {} record(s) from '{}':\n\n{}",
        rows.len(),
        table,
        json_block(&rows)
    )
}

pub fn render_tables(tables: &[String]) -> String {
    if tables.is_empty() {
        return "No tables found in the database.".to_string();
    }
    let lines: Vec<String> = tables.iter().map(|t| format!("- {}", t)).collect();
    format!("Available tables in database:\n\n{}", lines.join("\n"))
}

pub fn render_table(table: &TableSchema) -> String {
    if table.columns.is_empty() {
        return format!("Table '{}' not found or has no columns.", table.name);
    }

    let mut out = format!("Schema for table '{}':\n\nColumns:\n", table.name);
    for column in &table.columns {
        out.push_str(&column_line(column));
    }

    if !table.relationships.is_empty() {
        out.push_str("\nRelationships:\n");
        for relationship in &table.relationships {
            out.push_str(&relationship_line(relationship));
        }
    }

    out
}

/// Relationships grouped under their source table.
///
/// Input is expected sorted by source table, as introspectors return it.
pub fn render_relationships(table: Option<&str>, relationships: &[RelationshipDescriptor]) -> String {
    if relationships.is_empty() {
        return match table {
            Some(table) => format!("No relationships found for table '{}'.", table),
            None => "No relationships found in the database.".to_string(),
        };
    }

    let mut out = match table {
        Some(table) => format!("Relationships for table {}:\n\n", table),
        None => "Relationships:\n\n".to_string(),
    };

    let mut current: Option<&str> = None;
    for relationship in relationships {
        if current != Some(relationship.from_table.as_str()) {
            current = Some(relationship.from_table.as_str());
            out.push_str(&format!("Table '{}':\n", relationship.from_table));
        }
        out.push_str(&relationship_line(relationship));
    }

    out
}

/// Readable failure text. The backend's own message is kept, and its raw
/// payload too when there is one.
pub fn render_error(err: &DbError) -> String {
    match err.payload() {
        Some(payload) => format!("Error: {}\n\nDetails:\n{}", err, pretty(payload)),
        None => format!("Error: {}", err),
    }
}
