//! The surface agents call.
//!
//! CRUD always goes to the REST-style backend. Introspection goes through a
//! [`SchemaResolver`], which prefers direct SQL when it is configured.

use crate::backend::{InsertOutcome, QueryBackend, QueryResult, Record};
use crate::config::DbConfig;
use crate::error::{DbError, Result};
use crate::fallback::{SchemaResolver, SchemaSnapshot};
use crate::filter::FilterSet;
use crate::format;
use crate::inject::{self, Message};
use crate::introspect::{CatalogIntrospector, ColumnDescriptor, RelationshipDescriptor, SchemaIntrospector, TableSchema};
use crate::query::{parse_select, OrderBy, QuerySpec};
use crate::rest::RestBackend;
use crate::settings::{JsonSettingsStore, SettingsStore};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(feature = "postgres")]
use crate::postgres::{ArbitrarySql, PostgresBackend};

/// Arguments of a read, in the shape agents send them
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct QueryRequest {
    pub table: String,
    /// `*` or a comma-separated column list
    pub select: Option<String>,
    /// Equality filters
    pub filters: Option<Record>,
    /// `column`, `column.asc` or `column.desc`
    pub order: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// `column.operator.value` clauses separated by commas
    pub raw_filters: Option<String>,
}

impl QueryRequest {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    fn to_spec(&self, filters: FilterSet) -> Result<QuerySpec> {
        let mut spec = QuerySpec::new(&self.table).filters(filters);
        if let Some(select) = &self.select {
            spec = spec.select(parse_select(select));
        }
        if let Some(order) = &self.order {
            spec.order = Some(order.parse::<OrderBy>()?);
        }
        spec.limit = self.limit;
        spec.offset = self.offset;
        spec.validate()?;
        Ok(spec)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InsertRequest {
    pub table: String,
    pub data: Record,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UpdateRequest {
    pub table: String,
    pub data: Record,
    pub filters: Option<Record>,
    pub raw_filters: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeleteRequest {
    pub table: String,
    pub filters: Option<Record>,
    pub raw_filters: Option<String>,
}

fn require_table(table: &str) -> Result<()> {
    if table.trim().is_empty() {
        return Err(DbError::Validation("table name must not be empty".to_string()));
    }
    Ok(())
}

fn require_data(operation: &str, data: &Record) -> Result<()> {
    if data.is_empty() {
        return Err(DbError::Validation(format!("{} requires at least one column value", operation)));
    }
    Ok(())
}

pub struct AgentDb {
    crud: Arc<dyn QueryBackend>,
    schema: SchemaResolver,
    settings: Arc<dyn SettingsStore>,
    #[cfg(feature = "postgres")]
    sql: Option<Arc<PostgresBackend>>,
    #[cfg(feature = "postgres")]
    arbitrary_sql: Option<ArbitrarySql>,
}

impl AgentDb {
    /// Assemble from parts. Settings default to the JSON store in
    /// `data/db/agent_settings`.
    pub fn new(crud: Arc<dyn QueryBackend>, schema: SchemaResolver) -> Self {
        Self {
            crud,
            schema,
            settings: Arc::new(JsonSettingsStore::default()),
            #[cfg(feature = "postgres")]
            sql: None,
            #[cfg(feature = "postgres")]
            arbitrary_sql: None,
        }
    }

    /// REST backend for CRUD and fallback introspection, plus direct Postgres
    /// as the preferred introspector when its connection string is set.
    pub fn from_config(config: DbConfig) -> Result<Self> {
        let rest = Arc::new(RestBackend::new(config.rest?)?);
        let resolver = SchemaResolver::new(Arc::new(CatalogIntrospector::new(rest.clone())));
        let db = Self::new(rest, resolver);

        #[cfg(feature = "postgres")]
        let db = match config.postgres {
            Ok(pg) => db.with_sql(Arc::new(PostgresBackend::new(pg))),
            Err(err) => {
                info!(reason = %err, "direct postgres not configured; introspection uses REST only");
                db
            }
        };

        Ok(db)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_config(DbConfig::from_env())
    }

    pub fn with_settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = settings;
        self
    }

    /// Use `backend` as the Primary introspector
    #[cfg(feature = "postgres")]
    pub fn with_sql(mut self, backend: Arc<PostgresBackend>) -> Self {
        self.schema = self.schema.with_primary(backend.clone());
        self.sql = Some(backend);
        self
    }

    /// Enable [`AgentDb::execute_sql`]. Only do this for trusted callers.
    #[cfg(feature = "postgres")]
    pub fn allow_arbitrary_sql(mut self, ack: ArbitrarySql) -> Self {
        warn!("arbitrary SQL execution enabled");
        self.arbitrary_sql = Some(ack);
        self
    }

    pub fn resolver(&self) -> &SchemaResolver {
        &self.schema
    }

    pub fn settings(&self) -> &Arc<dyn SettingsStore> {
        &self.settings
    }

    fn filters(&self, filters: Option<&Record>, raw: Option<&str>) -> Result<FilterSet> {
        FilterSet::from_request(filters, raw, self.crud.operators())
    }

    pub async fn query_db(&self, request: &QueryRequest) -> Result<QueryResult> {
        require_table(&request.table)?;
        let filters = self.filters(request.filters.as_ref(), request.raw_filters.as_deref())?;
        let spec = request.to_spec(filters)?;
        debug!(table = %spec.table, backend = self.crud.name(), "query");
        self.crud.select(&spec).await
    }

    pub async fn insert_db(&self, request: &InsertRequest) -> Result<InsertOutcome> {
        require_table(&request.table)?;
        require_data("insert", &request.data)?;
        debug!(table = %request.table, backend = self.crud.name(), "insert");
        self.crud.insert(&request.table, &request.data).await
    }

    /// Refuses to run without a filter, before the backend is contacted
    pub async fn update_db(&self, request: &UpdateRequest) -> Result<QueryResult> {
        require_table(&request.table)?;
        require_data("update", &request.data)?;
        let filters = self.filters(request.filters.as_ref(), request.raw_filters.as_deref())?;
        filters.require_any("update")?;
        debug!(table = %request.table, backend = self.crud.name(), "update");
        self.crud.update(&request.table, &request.data, &filters).await
    }

    /// Refuses to run without a filter, before the backend is contacted
    pub async fn delete_db(&self, request: &DeleteRequest) -> Result<QueryResult> {
        require_table(&request.table)?;
        let filters = self.filters(request.filters.as_ref(), request.raw_filters.as_deref())?;
        filters.require_any("delete")?;
        debug!(table = %request.table, backend = self.crud.name(), "delete");
        self.crud.delete(&request.table, &filters).await
    }

    pub async fn list_tables(&self) -> Result<Vec<String>> {
        self.schema.list_tables().await
    }

    pub async fn describe_table(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        self.schema.describe_table(table).await
    }

    /// Columns and relationships, both from the same backend
    pub async fn table_schema(&self, table: &str) -> Result<TableSchema> {
        self.schema.table_schema(table).await
    }

    pub async fn get_relationships(&self, table: Option<&str>) -> Result<Vec<RelationshipDescriptor>> {
        self.schema.relationships(table).await
    }

    /// Run `sql` on the direct connection. Disabled unless
    /// [`AgentDb::allow_arbitrary_sql`] was called.
    #[cfg(feature = "postgres")]
    pub async fn execute_sql(&self, sql: &str) -> Result<QueryResult> {
        let Some(ack) = self.arbitrary_sql else {
            return Err(DbError::Validation("arbitrary SQL execution is not enabled".to_string()));
        };
        let Some(backend) = &self.sql else {
            return Err(DbError::Configuration(
                "arbitrary SQL needs a direct postgres connection".to_string(),
            ));
        };
        backend.execute_raw(sql, ack).await
    }

    /// Which tables to describe for `agent`: the explicit list, else the
    /// agent's enabled tables, else every table.
    async fn tables_for(&self, agent: &str, tables: Option<&[String]>) -> Result<Vec<String>> {
        if let Some(tables) = tables.filter(|t| !t.is_empty()) {
            return Ok(tables.to_vec());
        }

        match self.settings.load(agent) {
            Ok(settings) if !settings.enabled_tables.is_empty() => {
                return Ok(settings.enabled_tables);
            }
            Ok(_) => {}
            Err(err) => warn!(agent = %agent, error = %err, "could not load db settings"),
        }

        self.list_tables().await
    }

    /// Schemas of the tables [`AgentDb::inject_schema_info`] would describe
    pub async fn schema_snapshot(&self, agent: &str, tables: Option<&[String]>) -> Result<SchemaSnapshot> {
        let tables = self.tables_for(agent, tables).await?;
        Ok(self.schema.gather(&tables).await)
    }

    /// Schema text for an agent's system message
    pub async fn inject_schema_info(&self, agent: &str, tables: Option<&[String]>) -> Result<String> {
        let tables = self.tables_for(agent, tables).await?;
        if tables.is_empty() {
            return Ok("No tables found in database.".to_string());
        }

        let snapshot = self.schema.gather(&tables).await;
        if snapshot.is_empty() {
            warn!(agent = %agent, failed = ?snapshot.failed, "no table could be described");
            return Ok("Could not retrieve schema information for any tables.".to_string());
        }

        Ok(format::format_schema(&snapshot.tables))
    }

    /// Message hook: put the agent's schema into the first system message.
    ///
    /// Stale blocks are always removed from the history. Nothing is injected
    /// when no table could be described.
    pub async fn inject_into(&self, agent: &str, messages: &mut [Message]) -> Result<bool> {
        let snapshot = self.schema_snapshot(agent, None).await?;
        if snapshot.is_empty() {
            inject::strip_schema_from_history(messages);
            return Ok(false);
        }
        Ok(inject::inject_schema(messages, &format::format_schema(&snapshot.tables)))
    }

    pub async fn query_db_text(&self, request: &QueryRequest) -> String {
        match self.query_db(request).await {
            Ok(rows) => format::render_query(&request.table, &rows),
            Err(err) => format::render_error(&err),
        }
    }

    pub async fn insert_db_text(&self, request: &InsertRequest) -> String {
        match self.insert_db(request).await {
            Ok(outcome) => format::render_insert(&request.table, &outcome),
            Err(err) => format::render_error(&err),
        }
    }

    pub async fn update_db_text(&self, request: &UpdateRequest) -> String {
        match self.update_db(request).await {
            Ok(rows) => format::render_update(&request.table, &rows),
            Err(err) => format::render_error(&err),
        }
    }

    pub async fn delete_db_text(&self, request: &DeleteRequest) -> String {
        match self.delete_db(request).await {
            Ok(rows) => format::render_delete(&request.table, &rows),
            Err(err) => format::render_error(&err),
        }
    }

    pub async fn list_tables_text(&self) -> String {
        match self.list_tables().await {
            Ok(tables) => format::render_tables(&tables),
            Err(err) => format::render_error(&err),
        }
    }

    pub async fn describe_table_text(&self, table: &str) -> String {
        match self.table_schema(table).await {
            Ok(schema) => format::render_table(&schema),
            Err(err) => format::render_error(&err),
        }
    }

    pub async fn get_relationships_text(&self, table: Option<&str>) -> String {
        match self.get_relationships(table).await {
            Ok(relationships) => format::render_relationships(table, &relationships),
            Err(err) => format::render_error(&err),
        }
    }
}
