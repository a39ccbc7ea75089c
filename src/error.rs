//! Error types for the storage layer.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Every I/O failure carries the operation and the engine it happened on, so it can be
//! diagnosed without a stack trace.

use crate::models::Engine;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// Dial, authentication or file-access failure.
    #[error("Connection failed ({engine}): {message}")]
    Connection { engine: Engine, message: String },

    #[error("Unsupported database engine: '{engine}'")]
    UnsupportedEngine { engine: String },

    #[error("Failed to begin transaction ({engine}): {message}")]
    BeginTx { engine: Engine, message: String },

    #[error("Failed to commit transaction ({engine}): {message}")]
    Commit { engine: Engine, message: String },

    /// The unit of work failed and so did the rollback. Both are kept.
    #[error("{cause}; rollback also failed: {rollback}")]
    Rollback {
        #[source]
        cause: Box<DbError>,
        rollback: Box<DbError>,
    },

    #[error("Unsupported execution context: {reason}")]
    UnsupportedContext { reason: String },

    #[error("Migration to version {version} failed ({engine}): {source}")]
    Migration {
        engine: Engine,
        version: i64,
        #[source]
        source: Box<DbError>,
    },

    #[error("Database error ({engine}): {message}")]
    Database {
        engine: Engine,
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
    },

    /// A deadline elapsed before the operation completed.
    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    /// Several independent failures, none of which short-circuited the others.
    #[error("{}", join_messages(.0))]
    Joined(Vec<DbError>),
}

fn join_messages(errors: &[DbError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl DbError {
    /// Create a connection error.
    pub fn connection(engine: Engine, message: impl Into<String>) -> Self {
        Self::Connection {
            engine,
            message: message.into(),
        }
    }

    /// Create an unsupported engine error.
    pub fn unsupported_engine(engine: impl Into<String>) -> Self {
        Self::UnsupportedEngine {
            engine: engine.into(),
        }
    }

    /// Create a begin-transaction error.
    pub fn begin_tx(engine: Engine, message: impl Into<String>) -> Self {
        Self::BeginTx {
            engine,
            message: message.into(),
        }
    }

    /// Create a commit error.
    pub fn commit(engine: Engine, message: impl Into<String>) -> Self {
        Self::Commit {
            engine,
            message: message.into(),
        }
    }

    /// Join a failed rollback with the error that triggered it.
    pub fn rollback(cause: DbError, rollback: DbError) -> Self {
        Self::Rollback {
            cause: Box::new(cause),
            rollback: Box::new(rollback),
        }
    }

    /// Create an unsupported execution context error.
    pub fn unsupported_context(reason: impl Into<String>) -> Self {
        Self::UnsupportedContext {
            reason: reason.into(),
        }
    }

    /// Wrap the failure of a schema-change script.
    pub fn migration(engine: Engine, version: i64, source: DbError) -> Self {
        Self::Migration {
            engine,
            version,
            source: Box::new(source),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(engine: Engine, message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Database {
            engine,
            message: message.into(),
            sql_state,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Fold independent failures: `Ok` when there are none, the error itself
    /// when there is one, `Joined` otherwise.
    pub fn join(mut errors: Vec<DbError>) -> DbResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Joined(errors)),
        }
    }

    /// Get the SQLSTATE code for database errors, if available.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Database { sql_state, .. } => sql_state.as_deref(),
            Self::Migration { source, .. } => source.sql_state(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Convert a driver error, keeping track of which engine produced it.
    pub fn from_sqlx(engine: Engine, err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => {
                DbError::invalid_config(format!("{} connect options: {}", engine, msg))
            }
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(engine, db_err.message(), code)
            }
            sqlx::Error::RowNotFound => DbError::database(engine, "No rows returned", None),
            sqlx::Error::PoolTimedOut => DbError::Timeout {
                operation: format!("{} connection pool acquire", engine),
                elapsed_ms: 0,
            },
            sqlx::Error::PoolClosed => DbError::connection(engine, "Connection pool is closed"),
            sqlx::Error::Io(io_err) => DbError::connection(engine, format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => {
                DbError::connection(engine, format!("TLS error: {}", tls_err))
            }
            sqlx::Error::Protocol(msg) => {
                DbError::connection(engine, format!("Protocol error: {}", msg))
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::database(engine, format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection(engine, "Database worker crashed"),
            _ => DbError::internal(format!("Unknown {} error: {}", engine, err)),
        }
    }
}

/// Result type alias for storage operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection(Engine::Postgres, "connection refused");
        assert!(err.to_string().contains("Connection failed"));
        assert!(err.to_string().contains("postgres"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("acquire", Duration::from_secs(1)).is_retryable());
        assert!(DbError::connection(Engine::SQLite, "err").is_retryable());
        assert!(!DbError::unsupported_engine("oracle").is_retryable());
        assert!(!DbError::commit(Engine::SQLite, "disk full").is_retryable());
    }

    #[test]
    fn test_rollback_keeps_both_errors() {
        let err = DbError::rollback(
            DbError::internal("constraint violated"),
            DbError::connection(Engine::SQLite, "connection lost"),
        );
        let msg = err.to_string();
        assert!(msg.contains("constraint violated"));
        assert!(msg.contains("connection lost"));

        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("constraint violated"));
    }

    #[test]
    fn test_join_empty_is_ok() {
        assert!(DbError::join(Vec::new()).is_ok());
    }

    #[test]
    fn test_join_single_is_unwrapped() {
        let err = DbError::join(vec![DbError::internal("one")]).unwrap_err();
        assert!(matches!(err, DbError::Internal { .. }));
    }

    #[test]
    fn test_join_many_keeps_all() {
        let err = DbError::join(vec![
            DbError::internal("first"),
            DbError::timeout("closing sqlite pool", Duration::from_millis(250)),
        ])
        .unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, DbError::Joined(ref v) if v.len() == 2));
        assert!(msg.contains("first"));
        assert!(msg.contains("250ms"));
    }

    #[test]
    fn test_migration_error_exposes_sql_state() {
        let err = DbError::migration(
            Engine::Postgres,
            20241209,
            DbError::database(Engine::Postgres, "syntax error", Some("42601".to_string())),
        );
        assert_eq!(err.sql_state(), Some("42601"));
        assert!(err.to_string().contains("20241209"));
    }

    #[test]
    fn test_from_sqlx_pool_closed() {
        let err = DbError::from_sqlx(Engine::SQLite, sqlx::Error::PoolClosed);
        assert!(matches!(err, DbError::Connection { engine: Engine::SQLite, .. }));
    }

    #[test]
    fn test_from_sqlx_pool_timed_out() {
        let err = DbError::from_sqlx(Engine::Postgres, sqlx::Error::PoolTimedOut);
        assert!(matches!(err, DbError::Timeout { .. }));
        assert!(err.is_retryable());
    }
}
