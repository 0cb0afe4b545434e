//! Compact filter expressions.
//!
//! A filter string is a comma-separated list of `column.operator.value`
//! clauses, e.g. `status.eq.active,created_at.gt.2025-01-01,email.like.%example.com`.
//! Everything after the second dot is the value, so values may contain dots.
//! Malformed clauses are skipped with a diagnostic; the remaining clauses are
//! still applied.

use crate::error::{DbError, Result};
use crate::value::{coerce, Scalar};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Comparison operators accepted in filter clauses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    ILike,
    Is,
}

impl FilterOp {
    /// The full allowlist. Backends expose a subset (or all) of these.
    pub const ALL: [FilterOp; 9] = [
        FilterOp::Eq,
        FilterOp::Neq,
        FilterOp::Gt,
        FilterOp::Gte,
        FilterOp::Lt,
        FilterOp::Lte,
        FilterOp::Like,
        FilterOp::ILike,
        FilterOp::Is,
    ];

    /// Tag as written in filter strings and REST query parameters
    pub fn tag(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::Like => "like",
            FilterOp::ILike => "ilike",
            FilterOp::Is => "is",
        }
    }

    /// SQL comparison operator
    pub fn to_sql(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Neq => "<>",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
            FilterOp::Like => "LIKE",
            FilterOp::ILike => "ILIKE",
            FilterOp::Is => "IS",
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl FromStr for FilterOp {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        FilterOp::ALL
            .iter()
            .copied()
            .find(|op| op.tag() == s)
            .ok_or_else(|| format!("unknown operator '{}'", s))
    }
}

/// A single `column <op> value` condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub column: String,
    pub op: FilterOp,
    pub value: Scalar,
}

impl Predicate {
    pub fn new(column: impl Into<String>, op: FilterOp, value: Scalar) -> Self {
        Self {
            column: column.into(),
            op,
            value,
        }
    }

    pub fn eq(column: impl Into<String>, value: Scalar) -> Self {
        Self::new(column, FilterOp::Eq, value)
    }
}

/// Outcome of parsing a filter string
#[derive(Debug, Default)]
pub struct ParsedFilters {
    pub predicates: Vec<Predicate>,
    /// One `DbError::Parse` per skipped clause, in input order
    pub skipped: Vec<DbError>,
}

/// Parse a filter string against the operators a backend supports.
///
/// Never fails: bad clauses end up in `skipped` and are logged.
pub fn parse_filters(raw: &str, supported: &[FilterOp]) -> ParsedFilters {
    let mut parsed = ParsedFilters::default();

    for clause in raw.split(',') {
        let clause = clause.trim();
        if clause.is_empty() {
            continue;
        }

        match parse_clause(clause, supported) {
            Ok(predicate) => parsed.predicates.push(predicate),
            Err(err) => {
                warn!(clause = %clause, error = %err, "skipping filter clause");
                parsed.skipped.push(err);
            }
        }
    }

    parsed
}

fn parse_clause(clause: &str, supported: &[FilterOp]) -> Result<Predicate> {
    let mut parts = clause.splitn(3, '.');
    let (column, op, value) = match (parts.next(), parts.next(), parts.next()) {
        (Some(column), Some(op), Some(value)) => (column, op, value),
        _ => {
            return Err(DbError::Parse {
                clause: clause.to_string(),
                reason: "expected column.operator.value".to_string(),
            })
        }
    };

    let op = FilterOp::from_str(op).map_err(|reason| DbError::Parse {
        clause: clause.to_string(),
        reason,
    })?;

    if !supported.contains(&op) {
        return Err(DbError::Parse {
            clause: clause.to_string(),
            reason: format!("operator '{}' is not supported by this backend", op),
        });
    }

    Ok(Predicate::new(column, op, coerce(value)))
}

/// Equality filters plus raw predicates, all ANDed together
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSet {
    pub equality: IndexMap<String, Scalar>,
    pub raw: Vec<Predicate>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the shapes agents send: a JSON object of equality filters
    /// and an optional filter string.
    pub fn from_request(
        filters: Option<&Map<String, Value>>,
        raw_filters: Option<&str>,
        supported: &[FilterOp],
    ) -> Result<Self> {
        let mut set = Self::new();

        if let Some(filters) = filters {
            for (column, value) in filters {
                set.equality.insert(column.clone(), Scalar::try_from(value)?);
            }
        }

        if let Some(raw) = raw_filters {
            set.raw = parse_filters(raw, supported).predicates;
        }

        Ok(set)
    }

    /// Add an equality filter
    pub fn eq(mut self, column: impl Into<String>, value: Scalar) -> Self {
        self.equality.insert(column.into(), value);
        self
    }

    /// Add a raw predicate
    pub fn with(mut self, predicate: Predicate) -> Self {
        self.raw.push(predicate);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.equality.is_empty() && self.raw.is_empty()
    }

    /// Refuse to go on without any filter. There is no way to say "every row"
    /// through an empty filter set.
    pub fn require_any(&self, operation: &str) -> Result<()> {
        if self.is_empty() {
            return Err(DbError::Validation(format!(
                "{} requires at least one filter; refusing to touch every row",
                operation
            )));
        }
        Ok(())
    }

    /// All conditions in application order: equality filters first, then raw
    /// predicates as parsed.
    pub fn predicates(&self) -> impl Iterator<Item = Predicate> + '_ {
        self.equality
            .iter()
            .map(|(column, value)| Predicate::eq(column.clone(), value.clone()))
            .chain(self.raw.iter().cloned())
    }
}
