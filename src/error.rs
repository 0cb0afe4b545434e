use serde_json::Value;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    /// Missing or invalid credentials for a backend.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A malformed filter clause. Never fatal to the surrounding request.
    #[error("Parse error in '{clause}': {reason}")]
    Parse { clause: String, reason: String },

    /// The backend rejected or failed a request.
    #[error("Backend error: {message}")]
    Backend {
        message: String,
        payload: Option<Value>,
    },

    /// The request itself is not acceptable (for example an unfiltered delete).
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[cfg(feature = "postgres")]
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl DbError {
    pub fn backend(message: impl Into<String>) -> Self {
        DbError::Backend {
            message: message.into(),
            payload: None,
        }
    }

    pub fn backend_with_payload(message: impl Into<String>, payload: Value) -> Self {
        DbError::Backend {
            message: message.into(),
            payload: Some(payload),
        }
    }

    pub fn timeout(what: &str, after: std::time::Duration) -> Self {
        DbError::backend(format!("{} timed out after {:?}", what, after))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, DbError::Configuration(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, DbError::Validation(_))
    }

    /// True for anything the backend itself reported, including driver and transport failures.
    pub fn is_backend(&self) -> bool {
        match self {
            DbError::Backend { .. } | DbError::Http(_) => true,
            #[cfg(feature = "postgres")]
            DbError::Sqlx(_) => true,
            _ => false,
        }
    }

    /// Raw error payload as the backend returned it, when there was one.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            DbError::Backend { payload, .. } => payload.as_ref(),
            _ => None,
        }
    }
}
