//! Error types for the database access layer.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Driver errors keep their SQLSTATE or platform code so the retry classifier can
//! make an exact-match decision.

use crate::db::classify;
use std::io::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Secret '{secret_id}' unavailable: {message}")]
    Secrets { secret_id: String, message: String },

    #[error("Connection failed: {message}")]
    Connection {
        message: String,
        /// Platform code such as "ECONNREFUSED"
        code: Option<String>,
        suggestion: String,
    },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "40P01" for deadlock detected
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation}")]
    Timeout { operation: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a secrets-store error.
    pub fn secrets(secret_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Secrets {
            secret_id: secret_id.into(),
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            code: None,
            suggestion: suggestion.into(),
        }
    }

    /// Create a connection error carrying a platform code.
    pub fn connection_with_code(
        message: impl Into<String>,
        code: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            code: Some(code.into()),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Driver-level code (SQLSTATE or platform code), if the error carries one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Database { sql_state, .. } => sql_state.as_deref(),
            Self::Connection { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        classify::is_retryable(self)
    }
}

/// Platform code for an I/O failure, matching the names the classifier knows.
fn io_code(kind: ErrorKind) -> Option<&'static str> {
    match kind {
        ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        ErrorKind::TimedOut => Some("ETIMEDOUT"),
        ErrorKind::ConnectionReset => Some("ECONNRESET"),
        ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
        _ => None,
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax, constraints and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire"),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Recreate the database client")
            }
            sqlx::Error::Io(io_err) => {
                let message = format!("I/O error: {}", io_err);
                let suggestion = "Check network connectivity and database server status";
                match io_code(io_err.kind()) {
                    Some(code) => DbError::connection_with_code(message, code, suggestion),
                    None => DbError::connection(message, suggestion),
                }
            }
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::invalid_input(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => {
                DbError::connection("Database worker crashed", "Recreate the database client")
            }
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
