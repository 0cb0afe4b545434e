//! Parameterized SQL for the direct-SQL backend.
//!
//! Identifiers are validated and double-quoted; every value is a `$n`
//! parameter. Row-returning statements wrap their rows in `row_to_json` so the
//! driver hands back one ordered JSON object per row regardless of column types.

use crate::error::{DbError, Result};
use crate::filter::{FilterOp, FilterSet, Predicate};
use crate::query::QuerySpec;
use crate::value::Scalar;
use serde_json::{Map, Value};

/// A bound statement parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Int(i64),
    Bool(bool),
    Text(String),
    Json(Value),
}

/// SQL text plus its parameters, in `$1..$n` order
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

/// Accept only `[A-Za-z_][A-Za-z0-9_$]*`
pub fn validate_ident(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        }
        _ => false,
    };

    if !valid {
        return Err(DbError::Validation(format!("invalid identifier '{}'", name)));
    }

    Ok(name)
}

/// Validate an identifier and quote it. Validation guarantees there is
/// nothing to escape.
pub fn quote_ident(name: &str) -> Result<String> {
    Ok(format!("\"{}\"", validate_ident(name)?))
}

/// `"schema"."table"` or `"table"`
pub fn qualified_table(schema: Option<&str>, table: &str) -> Result<String> {
    match schema {
        Some(schema) => Ok(format!("{}.{}", quote_ident(schema)?, quote_ident(table)?)),
        None => quote_ident(table),
    }
}

struct StatementBuilder {
    sql: String,
    params: Vec<SqlParam>,
}

impl StatementBuilder {
    fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    fn bind(&mut self, param: SqlParam) -> &mut Self {
        self.params.push(param);
        self.sql.push_str(&format!("${}", self.params.len()));
        self
    }

    fn push_where(&mut self, filters: &FilterSet) -> Result<()> {
        let mut first = true;
        for predicate in filters.predicates() {
            self.push(if first { " WHERE " } else { " AND " });
            self.push_predicate(&predicate)?;
            first = false;
        }
        Ok(())
    }

    fn push_predicate(&mut self, predicate: &Predicate) -> Result<()> {
        let column = quote_ident(&predicate.column)?;

        match (predicate.op, &predicate.value) {
            (FilterOp::Is, Scalar::Null) | (FilterOp::Eq, Scalar::Null) => {
                self.push(&format!("{} IS NULL", column));
            }
            (FilterOp::Neq, Scalar::Null) => {
                self.push(&format!("{} IS NOT NULL", column));
            }
            (FilterOp::Is, Scalar::Bool(b)) => {
                self.push(&format!("{} IS {}", column, if *b { "TRUE" } else { "FALSE" }));
            }
            (FilterOp::Is, other) => {
                return Err(DbError::Validation(format!(
                    "operator 'is' expects null, true or false, got '{}'",
                    other
                )))
            }
            (_, Scalar::Null) => {
                return Err(DbError::Validation(format!(
                    "operator '{}' cannot compare against null; use 'is'",
                    predicate.op
                )))
            }
            (op, Scalar::Int(n)) if !matches!(op, FilterOp::Like | FilterOp::ILike) => {
                self.push(&format!("{} {} ", column, op.to_sql()));
                self.bind(SqlParam::Int(*n));
            }
            (op, Scalar::Bool(b)) if !matches!(op, FilterOp::Like | FilterOp::ILike) => {
                self.push(&format!("{} {} ", column, op.to_sql()));
                self.bind(SqlParam::Bool(*b));
            }
            (op, value) => {
                // Text parameters compare against the column's text form.
                self.push(&format!("{}::text {} ", column, op.to_sql()));
                self.bind(SqlParam::Text(value.to_param()));
            }
        }

        Ok(())
    }

    fn finish(self) -> SqlStatement {
        SqlStatement {
            sql: self.sql,
            params: self.params,
        }
    }
}

fn select_list(columns: &[String]) -> Result<String> {
    if columns.iter().any(|c| c == "*") {
        return Ok("*".to_string());
    }
    let quoted = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>>>()?;
    Ok(quoted.join(", "))
}

fn record_columns(record: &Map<String, Value>) -> Result<String> {
    let quoted = record
        .keys()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>>>()?;
    Ok(quoted.join(", "))
}

/// SELECT for a query spec: equality filters, raw predicates, order, limit, offset
pub fn select_statement(spec: &QuerySpec) -> Result<SqlStatement> {
    spec.validate()?;

    let table = qualified_table(spec.schema.as_deref(), &spec.table)?;
    let mut builder = StatementBuilder::new(format!(
        "SELECT row_to_json(q) AS row FROM (SELECT {} FROM {}",
        select_list(&spec.select)?,
        table
    ));

    builder.push_where(&spec.filters)?;

    if let Some(order) = &spec.order {
        builder.push(&format!(
            " ORDER BY {} {}",
            quote_ident(&order.column)?,
            order.direction
        ));
    }
    if let Some(limit) = spec.limit {
        builder.push(&format!(" LIMIT {}", limit));
    }
    if let Some(offset) = spec.offset {
        builder.push(&format!(" OFFSET {}", offset));
    }

    builder.push(") q");
    Ok(builder.finish())
}

/// INSERT of one record. Values go through `jsonb_populate_record` so the
/// server coerces them to the column types.
pub fn insert_statement(table: &str, record: &Map<String, Value>) -> Result<SqlStatement> {
    if record.is_empty() {
        return Err(DbError::Validation("insert requires at least one column".to_string()));
    }

    let table = quote_ident(table)?;
    let columns = record_columns(record)?;
    let mut builder = StatementBuilder::new(format!(
        "WITH r AS (INSERT INTO {table} ({columns}) SELECT {columns} FROM jsonb_populate_record(NULL::{table}, "
    ));
    builder.bind(SqlParam::Json(Value::Object(record.clone())));
    builder.push(") RETURNING *) SELECT row_to_json(r) AS row FROM r");
    Ok(builder.finish())
}

/// UPDATE of every row matching `filters`. Fails on an empty filter set.
pub fn update_statement(
    table: &str,
    values: &Map<String, Value>,
    filters: &FilterSet,
) -> Result<SqlStatement> {
    filters.require_any("update")?;
    if values.is_empty() {
        return Err(DbError::Validation("update must set at least one column".to_string()));
    }

    let table = quote_ident(table)?;
    let columns = record_columns(values)?;
    let mut builder = StatementBuilder::new(format!(
        "WITH r AS (UPDATE {table} SET ({columns}) = (SELECT {columns} FROM jsonb_populate_record(NULL::{table}, "
    ));
    builder.bind(SqlParam::Json(Value::Object(values.clone())));
    builder.push("))");
    builder.push_where(filters)?;
    builder.push(" RETURNING *) SELECT row_to_json(r) AS row FROM r");
    Ok(builder.finish())
}

/// DELETE of every row matching `filters`. Fails on an empty filter set.
pub fn delete_statement(table: &str, filters: &FilterSet) -> Result<SqlStatement> {
    filters.require_any("delete")?;

    let mut builder = StatementBuilder::new(format!(
        "WITH r AS (DELETE FROM {}",
        quote_ident(table)?
    ));
    builder.push_where(filters)?;
    builder.push(" RETURNING *) SELECT row_to_json(r) AS row FROM r");
    Ok(builder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SortDirection;
    use serde_json::json;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users").unwrap(), "\"users\"");
        assert_eq!(quote_ident("_tmp$1").unwrap(), "\"_tmp$1\"");
        assert!(quote_ident("users; drop table x").is_err());
        assert!(quote_ident("1abc").is_err());
        assert!(quote_ident("").is_err());
        assert!(quote_ident("a\"b").is_err());
    }

    #[test]
    fn test_select_basic() {
        let stmt = select_statement(&QuerySpec::new("users")).unwrap();

        assert_eq!(
            stmt.sql,
            "SELECT row_to_json(q) AS row FROM (SELECT * FROM \"users\") q"
        );
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_select_full() {
        let spec = QuerySpec::new("users")
            .select(vec!["id", "email"])
            .where_eq("role", Scalar::Text("admin".into()))
            .where_pred(Predicate::new("age", FilterOp::Gte, Scalar::Int(21)))
            .where_pred(Predicate::new("email", FilterOp::ILike, Scalar::Text("%@x.io".into())))
            .order_by("id", SortDirection::Desc)
            .limit(10)
            .offset(5);

        let stmt = select_statement(&spec).unwrap();

        assert_eq!(
            stmt.sql,
            "SELECT row_to_json(q) AS row FROM (SELECT \"id\", \"email\" FROM \"users\" \
             WHERE \"role\"::text = $1 AND \"age\" >= $2 AND \"email\"::text ILIKE $3 \
             ORDER BY \"id\" DESC LIMIT 10 OFFSET 5) q"
        );
        assert_eq!(
            stmt.params,
            vec![
                SqlParam::Text("admin".into()),
                SqlParam::Int(21),
                SqlParam::Text("%@x.io".into()),
            ]
        );
    }

    #[test]
    fn test_select_null_and_is() {
        let spec = QuerySpec::new("users")
            .where_eq("deleted_at", Scalar::Null)
            .where_pred(Predicate::new("active", FilterOp::Is, Scalar::Bool(true)))
            .where_pred(Predicate::new("org_id", FilterOp::Neq, Scalar::Null));

        let stmt = select_statement(&spec).unwrap();

        assert!(stmt.sql.contains(
            "WHERE \"deleted_at\" IS NULL AND \"active\" IS TRUE AND \"org_id\" IS NOT NULL"
        ));
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_select_rejects_bad_is_value() {
        let spec = QuerySpec::new("users")
            .where_pred(Predicate::new("active", FilterOp::Is, Scalar::Int(1)));
        assert!(select_statement(&spec).unwrap_err().is_validation());

        let spec = QuerySpec::new("users")
            .where_pred(Predicate::new("age", FilterOp::Gt, Scalar::Null));
        assert!(select_statement(&spec).unwrap_err().is_validation());
    }

    #[test]
    fn test_select_schema_qualified() {
        let spec = QuerySpec::new("columns").in_schema("information_schema");
        let stmt = select_statement(&spec).unwrap();
        assert!(stmt.sql.contains("FROM \"information_schema\".\"columns\""));
    }

    #[test]
    fn test_insert() {
        let record = json!({"email": "a@b.c", "role": "guest"});
        let stmt = insert_statement("users", record.as_object().unwrap()).unwrap();

        assert_eq!(
            stmt.sql,
            "WITH r AS (INSERT INTO \"users\" (\"email\", \"role\") SELECT \"email\", \"role\" \
             FROM jsonb_populate_record(NULL::\"users\", $1) RETURNING *) \
             SELECT row_to_json(r) AS row FROM r"
        );
        assert_eq!(stmt.params, vec![SqlParam::Json(record)]);
    }

    #[test]
    fn test_update_requires_filter() {
        let values = json!({"role": "admin"});
        let err = update_statement("users", values.as_object().unwrap(), &FilterSet::new())
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_update() {
        let values = json!({"role": "admin"});
        let filters = FilterSet::new().eq("id", Scalar::Int(3));
        let stmt = update_statement("users", values.as_object().unwrap(), &filters).unwrap();

        assert_eq!(
            stmt.sql,
            "WITH r AS (UPDATE \"users\" SET (\"role\") = (SELECT \"role\" FROM \
             jsonb_populate_record(NULL::\"users\", $1)) WHERE \"id\" = $2 RETURNING *) \
             SELECT row_to_json(r) AS row FROM r"
        );
        assert_eq!(stmt.params[1], SqlParam::Int(3));
    }

    #[test]
    fn test_delete_requires_filter() {
        assert!(delete_statement("users", &FilterSet::new())
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn test_delete() {
        let filters = FilterSet::new().with(Predicate::new("id", FilterOp::Lt, Scalar::Int(100)));
        let stmt = delete_statement("users", &filters).unwrap();

        assert_eq!(
            stmt.sql,
            "WITH r AS (DELETE FROM \"users\" WHERE \"id\" < $1 RETURNING *) \
             SELECT row_to_json(r) AS row FROM r"
        );
    }
}
