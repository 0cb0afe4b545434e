//! agent-db - Schema-aware database access for agent runtimes
//!
//! agent-db gives an agent four CRUD commands over a Postgres database
//! (through a PostgREST/Supabase-style REST endpoint) and describes the
//! database to the agent by splicing a schema summary into its system
//! message.
//!
//! # Architecture
//!
//! - **Filter mini-language**: `column.operator.value` clauses, with values
//!   coerced to null, boolean, integer or text
//! - **Secondary backend (REST)**: always used for CRUD and as the fallback
//!   for introspection
//! - **Primary backend (direct SQL)**: preferred for introspection, one
//!   joined catalog query instead of per-constraint lookups
//! - **Per-table fallback**: a table that fails on the Primary is retried
//!   once on the Secondary; failures on both are isolated to that table
//! - **Schema injection**: an idempotent, delimited block in the first
//!   system message
//!
//! # Example
//!
//! ```rust,no_run
//! use agent_db::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // SUPABASE_URL and SUPABASE_KEY are required,
//!     // POSTGRES_CONNECTION_STRING is optional
//!     let db = AgentDb::from_env()?;
//!
//!     let rows = db
//!         .query_db(&QueryRequest {
//!             raw_filters: Some("status.eq.pending,created_at.gt.2025-01-01".into()),
//!             order: Some("created_at.desc".into()),
//!             limit: Some(10),
//!             ..QueryRequest::new("tasks")
//!         })
//!         .await?;
//!     println!("{} pending tasks", rows.len());
//!
//!     let mut messages = vec![Message::new("system", "You manage tasks.")];
//!     db.inject_into("planner", &mut messages).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Backend Support
//!
//! The direct-SQL backend is behind the default `postgres` feature:
//!
//! ```toml
//! [dependencies]
//! agent-db = { version = "0.1", default-features = false }
//! ```
//!
//! # Safety
//!
//! - `update_db` and `delete_db` refuse to run without at least one filter
//! - Values are always sent as parameters, never spliced into SQL
//! - Running caller-supplied SQL needs an explicit [`postgres::ArbitrarySql`]
//!   acknowledgement; there is no keyword blocklist pretending to be a guard

pub mod backend;
pub mod builder;
pub mod config;
pub mod error;
pub mod fallback;
pub mod filter;
pub mod format;
pub mod inject;
pub mod introspect;
pub mod memory;
pub mod query;
pub mod rest;
pub mod service;
pub mod settings;
pub mod value;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use backend::{InsertOutcome, QueryBackend, QueryResult, QueryRow, Record};
pub use config::{DbConfig, PostgresConfig, RestConfig};
pub use error::{DbError, Result};
pub use fallback::{SchemaResolver, SchemaSnapshot};
pub use filter::{parse_filters, FilterOp, FilterSet, ParsedFilters, Predicate};
pub use format::format_schema;
pub use inject::{extract_schema_info, inject_schema, Content, ContentPart, Message};
pub use introspect::{
    CatalogIntrospector, ColumnDescriptor, RelationshipDescriptor, SchemaIntrospector, TableSchema,
};
pub use memory::MemoryBackend;
pub use query::{OrderBy, QuerySpec, SortDirection};
pub use rest::RestBackend;
pub use service::{AgentDb, DeleteRequest, InsertRequest, QueryRequest, UpdateRequest};
pub use settings::{AgentDbSettings, JsonSettingsStore, MemorySettingsStore, SettingsStore};
pub use value::{coerce, Scalar};

#[cfg(feature = "postgres")]
pub use postgres::{ArbitrarySql, PostgresBackend};

/// Prelude for common imports
pub mod prelude {
    pub use crate::backend::{InsertOutcome, QueryBackend, QueryResult, QueryRow};
    pub use crate::error::{DbError, Result};
    pub use crate::filter::{FilterOp, FilterSet, Predicate};
    pub use crate::inject::Message;
    pub use crate::introspect::{SchemaIntrospector, TableSchema};
    pub use crate::query::QuerySpec;
    pub use crate::service::{AgentDb, DeleteRequest, InsertRequest, QueryRequest, UpdateRequest};
    pub use crate::value::Scalar;

    #[cfg(feature = "postgres")]
    pub use crate::postgres::PostgresBackend;
}
