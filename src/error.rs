//! Error Handling Infrastructure
//!
//! This module defines all error types used throughout dbkit.
//! Every error maps to a stable error code and to a process exit code.
//!
//! # Error Categories
//! - `InvalidIdentifier`: A database/user/role name was rejected before reaching any engine
//! - `ConnectionFailed`: Engine unreachable or authentication rejected
//! - `QueryFailed`: A raw statement failed (REPL only, never fatal to a session)
//! - `InvalidInput`: Malformed arguments
//! - `EngineError`: A native operation failed after connecting
//! - `ConfigError`: A configuration layer produced an unusable value
//! - `Io`: Interactive input/output failed
//!
//! Operator cancellation is not an error, see [`crate::lifecycle::Outcome::Cancelled`].

use thiserror::Error;

/// Main error type for dbkit operations
#[derive(Error, Debug)]
pub enum DbkitError {
    /// Identifier rejected by the whitelist (no mutation was attempted)
    #[error("Invalid {kind} name '{name}' (only letters, numbers and underscore are allowed)")]
    InvalidIdentifier { kind: String, name: String },

    /// Database connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Raw statement execution failed
    #[error("{0}")]
    QueryFailed(String),

    /// Invalid input or missing required parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Engine-specific database error
    #[error("Engine error ({engine}): {detail}")]
    EngineError { engine: String, detail: String },

    /// Configuration error (unparseable port, unknown transport, etc.)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Interactive stream failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbkitError {
    /// Convert error to a stable error code string
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidIdentifier { .. } => "INVALID_IDENTIFIER",
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::QueryFailed(_) => "QUERY_FAILED",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::EngineError { .. } => "ENGINE_ERROR",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Process exit code for an unrecovered error
    ///
    /// Input rejected locally exits with 2, everything that reached (or tried to reach)
    /// an engine exits with 1.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidIdentifier { .. } | Self::InvalidInput(_) => 2,
            _ => 1,
        }
    }

    /// Get human-readable error message
    ///
    /// Messages never contain passwords: adapters only ever format validated identifiers
    /// and driver error text into them.
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Create an invalid identifier error
    pub fn invalid_identifier(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::InvalidIdentifier { kind: kind.into(), name: name.into() }
    }

    /// Create a connection failed error
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create a query failed error
    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::QueryFailed(message.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create an engine-specific error
    pub fn engine_error(engine: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::EngineError { engine: engine.into(), detail: detail.into() }
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }
}

/// Result type alias for dbkit operations
pub type Result<T> = std::result::Result<T, DbkitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(DbkitError::invalid_identifier("database", "a-b").error_code(), "INVALID_IDENTIFIER");
        assert_eq!(DbkitError::connection_failed("test").error_code(), "CONNECTION_FAILED");
        assert_eq!(DbkitError::query_failed("test").error_code(), "QUERY_FAILED");
        assert_eq!(DbkitError::invalid_input("test").error_code(), "INVALID_INPUT");
        assert_eq!(DbkitError::engine_error("mysql", "test").error_code(), "ENGINE_ERROR");
        assert_eq!(DbkitError::config_error("test").error_code(), "CONFIG_ERROR");
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(DbkitError::from(io).error_code(), "IO_ERROR");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(DbkitError::invalid_identifier("user", "").exit_code(), 2);
        assert_eq!(DbkitError::invalid_input("missing").exit_code(), 2);
        assert_eq!(DbkitError::connection_failed("refused").exit_code(), 1);
        assert_eq!(DbkitError::engine_error("pgsql", "boom").exit_code(), 1);
    }

    #[test]
    fn test_error_messages() {
        let err = DbkitError::invalid_identifier("database", "my-db");
        assert!(err.message().contains("Invalid database name 'my-db'"));

        let err = DbkitError::engine_error("pgsql", "connection timeout");
        assert!(err.message().contains("pgsql"));
        assert!(err.message().contains("connection timeout"));

        // Statement errors are surfaced verbatim behind the REPL's "ERROR:" prefix
        let err = DbkitError::query_failed("syntax error at or near \"SELEC\"");
        assert_eq!(err.message(), "syntax error at or near \"SELEC\"");
    }

    #[test]
    fn test_error_constructors() {
        let err = DbkitError::invalid_identifier("role", "x y");
        assert!(matches!(err, DbkitError::InvalidIdentifier { .. }));

        let err = DbkitError::connection_failed("test");
        assert!(matches!(err, DbkitError::ConnectionFailed(_)));

        let err = DbkitError::invalid_input("test");
        assert!(matches!(err, DbkitError::InvalidInput(_)));

        let err = DbkitError::engine_error("mongo", "test");
        assert!(matches!(err, DbkitError::EngineError { .. }));

        let err = DbkitError::config_error("test");
        assert!(matches!(err, DbkitError::ConfigError(_)));
    }
}
