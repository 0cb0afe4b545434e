//! Connection settings, read from the environment.
//!
//! | Variable | Used by |
//! |---|---|
//! | `SUPABASE_URL` | REST backend base URL |
//! | `SUPABASE_KEY` | REST backend API key |
//! | `POSTGRES_CONNECTION_STRING` | direct-SQL backend |
//! | `DB_TIMEOUT_SECS` | per-call timeout for both (default 30) |

use crate::error::{DbError, Result};
use std::time::Duration;

pub const SUPABASE_URL: &str = "SUPABASE_URL";
pub const SUPABASE_KEY: &str = "SUPABASE_KEY";
pub const POSTGRES_CONNECTION_STRING: &str = "POSTGRES_CONNECTION_STRING";
pub const DB_TIMEOUT_SECS: &str = "DB_TIMEOUT_SECS";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<String> {
    match lookup(name) {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(DbError::Configuration(format!(
            "environment variable {} must be set",
            name
        ))),
    }
}

fn timeout(lookup: &impl Fn(&str) -> Option<String>) -> Result<Duration> {
    match lookup(DB_TIMEOUT_SECS) {
        None => Ok(DEFAULT_TIMEOUT),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .ok_or_else(|| {
                DbError::Configuration(format!(
                    "{} must be a positive number of seconds, got '{}'",
                    DB_TIMEOUT_SECS, raw
                ))
            }),
    }
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// REST endpoint settings
#[derive(Clone)]
pub struct RestConfig {
    /// Project URL, e.g. `https://abc.supabase.co`
    pub url: String,
    pub api_key: String,
    /// Path prefix of the REST API under `url`
    pub rest_path: String,
    pub timeout: Duration,
}

impl RestConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            rest_path: "/rest/v1".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let url = required(&lookup, SUPABASE_URL)?;
        let api_key = required(&lookup, SUPABASE_KEY)?;

        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(DbError::Configuration(format!(
                "{} must be an http(s) URL",
                SUPABASE_URL
            )));
        }

        Ok(Self {
            timeout: timeout(&lookup)?,
            ..Self::new(url, api_key)
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Base URL of the REST API, without trailing slash
    pub fn rest_url(&self) -> String {
        format!(
            "{}{}",
            self.url.trim_end_matches('/'),
            self.rest_path.trim_end_matches('/')
        )
    }
}

// Keeps the key out of logs.
impl std::fmt::Debug for RestConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestConfig")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .field("rest_path", &self.rest_path)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Direct Postgres connection settings
#[derive(Clone)]
pub struct PostgresConfig {
    pub connection_string: String,
    pub max_connections: u32,
    pub timeout: Duration,
}

impl PostgresConfig {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            max_connections: 5,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            timeout: timeout(&lookup)?,
            ..Self::new(required(&lookup, POSTGRES_CONNECTION_STRING)?)
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl std::fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("connection_string", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Everything the service needs. The Postgres part is optional: when it is
/// missing, introspection goes through the REST backend alone.
#[derive(Debug)]
pub struct DbConfig {
    pub rest: Result<RestConfig>,
    pub postgres: Result<PostgresConfig>,
}

impl DbConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            rest: RestConfig::from_lookup(&lookup),
            postgres: PostgresConfig::from_lookup(&lookup),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_rest_config_from_lookup() {
        let config = RestConfig::from_lookup(lookup(&[
            (SUPABASE_URL, "https://abc.supabase.co/"),
            (SUPABASE_KEY, "secret"),
        ]))
        .unwrap();

        assert_eq!(config.rest_url(), "https://abc.supabase.co/rest/v1");
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert!(!format!("{:?}", config).contains("secret"));
    }

    #[test]
    fn test_missing_key_is_configuration_error() {
        let err = RestConfig::from_lookup(lookup(&[(SUPABASE_URL, "https://abc.supabase.co")]))
            .unwrap_err();

        assert!(err.is_configuration());
        assert!(err.to_string().contains(SUPABASE_KEY));
    }

    #[test]
    fn test_empty_value_counts_as_missing() {
        let err = PostgresConfig::from_lookup(lookup(&[(POSTGRES_CONNECTION_STRING, "  ")]))
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_timeout_override() {
        let config = PostgresConfig::from_lookup(lookup(&[
            (POSTGRES_CONNECTION_STRING, "postgres://localhost/db"),
            (DB_TIMEOUT_SECS, "5"),
        ]))
        .unwrap();
        assert_eq!(config.timeout, Duration::from_secs(5));

        let err = PostgresConfig::from_lookup(lookup(&[
            (POSTGRES_CONNECTION_STRING, "postgres://localhost/db"),
            (DB_TIMEOUT_SECS, "0"),
        ]))
        .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_db_config_without_postgres() {
        let config = DbConfig::from_lookup(lookup(&[
            (SUPABASE_URL, "http://localhost:54321"),
            (SUPABASE_KEY, "k"),
        ]));

        assert!(config.rest.is_ok());
        assert!(config.postgres.unwrap_err().is_configuration());
    }
}
