use crate::error::{DbError, Result};
use crate::filter::{FilterSet, Predicate};
use crate::value::Scalar;
use std::fmt;
use std::str::FromStr;

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "ASC"),
            SortDirection::Desc => write!(f, "DESC"),
        }
    }
}

impl SortDirection {
    pub fn tag(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

/// ORDER BY clause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn new(column: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            column: column.into(),
            direction,
        }
    }
}

impl FromStr for OrderBy {
    type Err = DbError;

    /// `column`, `column.asc` or `column.desc`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (column, direction) = match s.rsplit_once('.') {
            Some((column, dir)) if dir.eq_ignore_ascii_case("asc") => (column, SortDirection::Asc),
            Some((column, dir)) if dir.eq_ignore_ascii_case("desc") => {
                (column, SortDirection::Desc)
            }
            Some((_, dir)) => {
                return Err(DbError::Validation(format!(
                    "invalid sort direction '{}' in order '{}'",
                    dir, s
                )))
            }
            None => (s, SortDirection::Asc),
        };

        if column.is_empty() {
            return Err(DbError::Validation(format!("invalid order '{}'", s)));
        }

        Ok(OrderBy::new(column, direction))
    }
}

/// Parse a select list: `*` or comma-separated column names
pub fn parse_select(select: &str) -> Vec<String> {
    let columns: Vec<String> = select
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(String::from)
        .collect();

    if columns.is_empty() {
        vec!["*".to_string()]
    } else {
        columns
    }
}

/// A read against one table
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub table: String,
    /// Namespace the table lives in; `None` means the backend's default
    pub schema: Option<String>,
    pub select: Vec<String>,
    pub filters: FilterSet,
    pub order: Option<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QuerySpec {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            schema: None,
            select: vec!["*".to_string()],
            filters: FilterSet::new(),
            order: None,
            limit: None,
            offset: None,
        }
    }

    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Select specific columns
    pub fn select(mut self, columns: Vec<impl Into<String>>) -> Self {
        self.select = columns.into_iter().map(|c| c.into()).collect();
        if self.select.is_empty() {
            self.select = vec!["*".to_string()];
        }
        self
    }

    pub fn where_eq(mut self, column: impl Into<String>, value: Scalar) -> Self {
        self.filters = self.filters.eq(column, value);
        self
    }

    pub fn where_pred(mut self, predicate: Predicate) -> Self {
        self.filters = self.filters.with(predicate);
        self
    }

    pub fn filters(mut self, filters: FilterSet) -> Self {
        self.filters = filters;
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        self.order = Some(OrderBy::new(column, direction));
        self
    }

    pub fn order_asc(self, column: impl Into<String>) -> Self {
        self.order_by(column, SortDirection::Asc)
    }

    pub fn order_desc(self, column: impl Into<String>) -> Self {
        self.order_by(column, SortDirection::Desc)
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn selects_all(&self) -> bool {
        self.select.iter().any(|c| c == "*")
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(DbError::Validation("table name must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterOp;

    #[test]
    fn test_order_parse() {
        assert_eq!(
            "created_at.desc".parse::<OrderBy>().unwrap(),
            OrderBy::new("created_at", SortDirection::Desc)
        );
        assert_eq!(
            "name".parse::<OrderBy>().unwrap(),
            OrderBy::new("name", SortDirection::Asc)
        );
        assert_eq!(
            "name.ASC".parse::<OrderBy>().unwrap(),
            OrderBy::new("name", SortDirection::Asc)
        );
        assert!("name.sideways".parse::<OrderBy>().unwrap_err().is_validation());
        assert!(".desc".parse::<OrderBy>().is_err());
    }

    #[test]
    fn test_parse_select() {
        assert_eq!(parse_select("*"), vec!["*"]);
        assert_eq!(parse_select(" id, email "), vec!["id", "email"]);
        assert_eq!(parse_select(""), vec!["*"]);
    }

    #[test]
    fn test_spec_builder() {
        let spec = QuerySpec::new("users")
            .select(vec!["id", "email"])
            .where_eq("role", Scalar::Text("admin".into()))
            .where_pred(Predicate::new("age", FilterOp::Gt, Scalar::Int(18)))
            .order_desc("id")
            .limit(10)
            .offset(20);

        assert_eq!(spec.select, vec!["id", "email"]);
        assert_eq!(spec.filters.predicates().count(), 2);
        assert_eq!(spec.order, Some(OrderBy::new("id", SortDirection::Desc)));
        assert_eq!((spec.limit, spec.offset), (Some(10), Some(20)));
        assert!(!spec.selects_all());
    }

    #[test]
    fn test_spec_validate() {
        assert!(QuerySpec::new("users").validate().is_ok());
        assert!(QuerySpec::new(" ").validate().unwrap_err().is_validation());
    }
}
