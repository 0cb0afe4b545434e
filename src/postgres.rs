//! Direct Postgres backend.
//!
//! The pool is created on first use, handed out while it is open, and
//! rebuilt on the next call after it has been closed. Every statement runs
//! under the configured timeout, and so does getting the pool, including
//! the wait behind a connect already in progress.

use crate::backend::{InsertOutcome, QueryBackend, QueryResult, QueryRow, Record};
use crate::builder::{self, SqlParam, SqlStatement};
use crate::config::PostgresConfig;
use crate::error::{DbError, Result};
use crate::filter::{FilterOp, FilterSet};
use crate::introspect::{
    sort_columns, sort_relationships, ColumnDescriptor, RelationshipDescriptor, SchemaIntrospector,
    DEFAULT_SCHEMA,
};
use crate::query::QuerySpec;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row, ValueRef};
use std::future::Future;
use tokio::sync::RwLock;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

const LIST_TABLES: &str = "\
SELECT table_name::text AS table_name
FROM information_schema.tables
WHERE table_schema = $1
ORDER BY table_name";

const DESCRIBE_TABLE: &str = "\
SELECT column_name::text AS column_name,
       data_type::text AS data_type,
       (is_nullable::text = 'YES') AS nullable,
       column_default::text AS column_default,
       ordinal_position::int4 AS ordinal_position
FROM information_schema.columns
WHERE table_schema = $1 AND table_name = $2
ORDER BY ordinal_position";

const RELATIONSHIPS: &str = "\
SELECT tc.table_name::text AS table_name,
       kcu.column_name::text AS column_name,
       ccu.table_name::text AS foreign_table_name,
       ccu.column_name::text AS foreign_column_name
FROM information_schema.table_constraints AS tc
JOIN information_schema.key_column_usage AS kcu
  ON tc.constraint_name = kcu.constraint_name
 AND tc.table_schema = kcu.table_schema
 AND tc.table_name = kcu.table_name
JOIN information_schema.constraint_column_usage AS ccu
  ON ccu.constraint_name = tc.constraint_name
 AND ccu.table_schema = tc.table_schema
WHERE tc.constraint_type = 'FOREIGN KEY'
  AND tc.table_schema = $1
  AND ($2::text IS NULL OR tc.table_name = $2)
ORDER BY tc.table_name, kcu.column_name, ccu.table_name, ccu.column_name";

/// Acknowledgement required by [`PostgresBackend::execute_raw`].
///
/// There is no filtering of the statement: whatever is passed runs with the
/// privileges of the configured role.
#[derive(Debug, Clone, Copy)]
pub struct ArbitrarySql(());

impl ArbitrarySql {
    pub fn i_understand_this_runs_arbitrary_sql() -> Self {
        ArbitrarySql(())
    }
}

/// A connect attempt that did not produce a pool
#[derive(Debug, Clone)]
struct ConnectFailure {
    at: Instant,
    configuration: bool,
    message: String,
}

impl ConnectFailure {
    fn new(err: &DbError) -> Self {
        let (configuration, message) = match err {
            DbError::Configuration(message) => (true, message.clone()),
            DbError::Backend { message, .. } => (false, message.clone()),
            other => (false, other.to_string()),
        };
        Self {
            at: Instant::now(),
            configuration,
            message,
        }
    }

    fn to_error(&self) -> DbError {
        if self.configuration {
            DbError::Configuration(self.message.clone())
        } else {
            DbError::backend(self.message.clone())
        }
    }
}

#[derive(Debug, Default)]
struct PoolSlot {
    pool: Option<PgPool>,
    last_failure: Option<ConnectFailure>,
}

impl PoolSlot {
    fn open(&self) -> Option<PgPool> {
        self.pool.as_ref().filter(|pool| !pool.is_closed()).cloned()
    }

    /// Failure of an attempt that finished after `since`. Callers that were
    /// already waiting share its outcome instead of trying again.
    fn failed_since(&self, since: Instant) -> Option<&ConnectFailure> {
        self.last_failure.as_ref().filter(|failure| failure.at >= since)
    }
}

pub struct PostgresBackend {
    config: PostgresConfig,
    slot: RwLock<PoolSlot>,
}

impl PostgresBackend {
    /// Create the backend without connecting
    pub fn new(config: PostgresConfig) -> Self {
        Self {
            config,
            slot: RwLock::new(PoolSlot::default()),
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(PostgresConfig::from_env()?))
    }

    /// Create the backend and open the pool right away
    pub async fn connect(config: PostgresConfig) -> Result<Self> {
        let backend = Self::new(config);
        backend.pool().await?;
        Ok(backend)
    }

    /// Open pool, creating or recreating it when needed.
    ///
    /// The configured timeout covers the lock wait as well as the connect.
    /// Only one caller connects at a time; callers queued behind a failed
    /// attempt get its error without connecting again.
    async fn pool(&self) -> Result<PgPool> {
        let started = Instant::now();
        let deadline = started + self.config.timeout;
        let expired = || DbError::timeout("connect", self.config.timeout);

        let open = timeout_at(deadline, self.slot.read())
            .await
            .map_err(|_| expired())?
            .open();
        if let Some(pool) = open {
            return Ok(pool);
        }

        let mut slot = timeout_at(deadline, self.slot.write())
            .await
            .map_err(|_| expired())?;
        if let Some(pool) = slot.open() {
            return Ok(pool);
        }
        if let Some(failure) = slot.failed_since(started) {
            debug!(error = %failure.message, "sharing failed postgres connect");
            return Err(failure.to_error());
        }
        match slot.pool {
            Some(_) => info!("postgres pool was closed; reconnecting"),
            None => debug!("opening postgres pool"),
        }

        let connect = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(self.config.timeout)
            .connect(&self.config.connection_string);

        let result = match timeout_at(deadline, connect).await {
            Ok(Ok(pool)) => Ok(pool),
            Ok(Err(sqlx::Error::Configuration(e))) => Err(DbError::Configuration(format!(
                "invalid postgres connection string: {}",
                e
            ))),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(expired()),
        };

        match result {
            Ok(pool) => {
                slot.pool = Some(pool.clone());
                slot.last_failure = None;
                Ok(pool)
            }
            Err(err) => {
                warn!(error = %err, "postgres connect failed");
                slot.last_failure = Some(ConnectFailure::new(&err));
                Err(err)
            }
        }
    }

    /// Run a driver future under the configured timeout
    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.config.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DbError::timeout(what, self.config.timeout)),
        }
    }

    fn bind_params<'q>(
        mut query: Query<'q, Postgres, PgArguments>,
        params: &'q [SqlParam],
    ) -> Query<'q, Postgres, PgArguments> {
        for param in params {
            query = match param {
                SqlParam::Int(n) => query.bind(*n),
                SqlParam::Bool(b) => query.bind(*b),
                SqlParam::Text(s) => query.bind(s.as_str()),
                SqlParam::Json(v) => query.bind(sqlx::types::Json(v)),
            };
        }
        query
    }

    /// Run a statement whose rows are a single `row` JSON column
    async fn fetch_json_rows(&self, what: &str, statement: SqlStatement) -> Result<QueryResult> {
        let pool = self.pool().await?;
        debug!(sql = %statement.sql, params = statement.params.len(), "postgres statement");

        let query = Self::bind_params(sqlx::query(&statement.sql), &statement.params);
        let rows = self.bounded(what, query.fetch_all(&pool)).await?;

        rows.iter()
            .map(|row| match row.try_get::<Value, _>("row")? {
                Value::Object(map) => Ok(QueryRow::from(map)),
                other => Err(DbError::backend(format!("unexpected row shape: {}", other))),
            })
            .collect()
    }

    /// Convert a row of arbitrary column types to a QueryRow
    fn convert_row(row: &PgRow) -> QueryRow {
        let mut query_row = QueryRow::new();

        for column in row.columns() {
            let index = column.ordinal();
            let is_null = row.try_get_raw(index).map(|v| v.is_null()).unwrap_or(true);

            let value = if is_null {
                Value::Null
            } else if let Ok(value) = row.try_get::<Value, _>(index) {
                value
            } else if let Ok(value) = row.try_get::<String, _>(index) {
                Value::String(value)
            } else if let Ok(value) = row.try_get::<i64, _>(index) {
                Value::Number(value.into())
            } else if let Ok(value) = row.try_get::<i32, _>(index) {
                Value::Number(value.into())
            } else if let Ok(value) = row.try_get::<i16, _>(index) {
                Value::Number(value.into())
            } else if let Ok(value) = row.try_get::<f64, _>(index) {
                serde_json::Number::from_f64(value)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            } else if let Ok(value) = row.try_get::<bool, _>(index) {
                Value::Bool(value)
            } else {
                Value::Null
            };

            query_row.insert(column.name().to_string(), value);
        }

        query_row
    }

    /// Run a statement as-is. No vetting of any kind happens here.
    pub async fn execute_raw(&self, sql: &str, _ack: ArbitrarySql) -> Result<QueryResult> {
        let pool = self.pool().await?;
        info!("executing caller-supplied SQL");
        let rows = self
            .bounded("raw statement", sqlx::query(sql).fetch_all(&pool))
            .await?;
        Ok(rows.iter().map(Self::convert_row).collect())
    }

    /// Close the pool. The next call opens a fresh one.
    pub async fn close(&self) {
        let pool = {
            let mut slot = self.slot.write().await;
            slot.last_failure = None;
            slot.pool.take()
        };
        if let Some(pool) = pool {
            pool.close().await;
        }
    }
}

#[async_trait]
impl QueryBackend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn operators(&self) -> &'static [FilterOp] {
        &FilterOp::ALL
    }

    async fn select(&self, spec: &QuerySpec) -> Result<QueryResult> {
        let statement = builder::select_statement(spec)?;
        self.fetch_json_rows(&format!("select on {}", spec.table), statement)
            .await
    }

    async fn insert(&self, table: &str, record: &Record) -> Result<InsertOutcome> {
        let statement = builder::insert_statement(table, record)?;
        let rows = self
            .fetch_json_rows(&format!("insert into {}", table), statement)
            .await?;
        Ok(match rows.into_iter().next() {
            Some(row) => InsertOutcome::Inserted(row),
            None => InsertOutcome::NoDataReturned,
        })
    }

    async fn update(
        &self,
        table: &str,
        values: &Record,
        filters: &FilterSet,
    ) -> Result<QueryResult> {
        let statement = builder::update_statement(table, values, filters)?;
        self.fetch_json_rows(&format!("update of {}", table), statement)
            .await
    }

    async fn delete(&self, table: &str, filters: &FilterSet) -> Result<QueryResult> {
        let statement = builder::delete_statement(table, filters)?;
        self.fetch_json_rows(&format!("delete from {}", table), statement)
            .await
    }

    fn is_connected(&self) -> bool {
        self.slot
            .try_read()
            .map(|slot| slot.open().is_some())
            .unwrap_or(false)
    }
}

#[async_trait]
impl SchemaIntrospector for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let pool = self.pool().await?;
        let rows = self
            .bounded(
                "list tables",
                sqlx::query(LIST_TABLES).bind(DEFAULT_SCHEMA).fetch_all(&pool),
            )
            .await?;

        rows.iter()
            .map(|row| Ok(row.try_get::<String, _>("table_name")?))
            .collect()
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let pool = self.pool().await?;
        let rows = self
            .bounded(
                "describe table",
                sqlx::query(DESCRIBE_TABLE)
                    .bind(DEFAULT_SCHEMA)
                    .bind(table)
                    .fetch_all(&pool),
            )
            .await?;

        let mut columns = rows
            .iter()
            .map(|row| {
                Ok(ColumnDescriptor {
                    name: row.try_get("column_name")?,
                    data_type: row.try_get("data_type")?,
                    nullable: row.try_get("nullable")?,
                    default: row.try_get("column_default")?,
                    ordinal_position: row.try_get("ordinal_position")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        sort_columns(&mut columns);
        Ok(columns)
    }

    async fn relationships(&self, table: Option<&str>) -> Result<Vec<RelationshipDescriptor>> {
        let pool = self.pool().await?;
        let rows = self
            .bounded(
                "relationships",
                sqlx::query(RELATIONSHIPS)
                    .bind(DEFAULT_SCHEMA)
                    .bind(table)
                    .fetch_all(&pool),
            )
            .await?;

        let mut relationships = rows
            .iter()
            .map(|row| {
                Ok(RelationshipDescriptor {
                    from_table: row.try_get("table_name")?,
                    from_column: row.try_get("column_name")?,
                    to_table: row.try_get("foreign_table_name")?,
                    to_column: row.try_get("foreign_column_name")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        sort_relationships(&mut relationships);
        Ok(relationships)
    }
}
