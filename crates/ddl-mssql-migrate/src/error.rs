//! Error types for the migration library.

use std::path::PathBuf;

use thiserror::Error;

use crate::connection::ConnectionError;

/// Exit code for success.
pub const EXIT_SUCCESS: u8 = 0;
/// Exit code for unreadable input, unrecoverable connection failures and
/// other fatal runtime errors.
pub const EXIT_FATAL: u8 = 1;
/// Exit code for invalid configuration.
pub const EXIT_CONFIG_ERROR: u8 = 2;
/// Exit code when a schema conflict needs a manual rule.
pub const EXIT_CONFLICT: u8 = 3;
/// Exit code when a table transfer failed.
pub const EXIT_TRANSFER_ERROR: u8 = 4;
/// Exit code after SIGINT/SIGTERM.
pub const EXIT_CANCELLED: u8 = 130;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// A file (input DDL, watermark state) could not be read or written.
    #[error("Cannot access file {path}: {source}")]
    FileAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Source or target connection could not be opened.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Schema conflicts that require a manual rename rule.
    #[error("{count} schema conflict(s) require a manual rule: {details}")]
    Conflict { count: usize, details: String },

    /// Data transfer failed for a specific table.
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// Statement execution or row streaming failed on an open session.
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Watermark state error
    #[error("State error: {0}")]
    State(String),

    /// Recurring job registration failed
    #[error("Schedule registration failed: {0}")]
    Schedule(String),

    /// Orchestrator asked to move between phases that are not connected
    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a FileAccess error for `path`.
    pub fn file_access(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MigrateError::FileAccess {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => EXIT_CONFIG_ERROR,
            MigrateError::Conflict { .. } => EXIT_CONFLICT,
            MigrateError::Transfer { .. } => EXIT_TRANSFER_ERROR,
            MigrateError::Cancelled => EXIT_CANCELLED,
            MigrateError::FileAccess { .. }
            | MigrateError::Connection(_)
            | MigrateError::Database(_)
            | MigrateError::State(_)
            | MigrateError::Schedule(_)
            | MigrateError::InvalidTransition { .. }
            | MigrateError::Io(_)
            | MigrateError::Json(_) => EXIT_FATAL,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionErrorKind, Role};
    use crate::config::Provider;

    #[test]
    fn test_exit_codes() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(MigrateError::file_access("schema.sql", io).exit_code(), 1);
        assert_eq!(MigrateError::Config("bad".into()).exit_code(), 2);
        assert_eq!(
            MigrateError::Conflict {
                count: 1,
                details: "x".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(MigrateError::transfer("t", "boom").exit_code(), 4);
        assert_eq!(MigrateError::Cancelled.exit_code(), 130);

        let conn = ConnectionError::new(
            ConnectionErrorKind::DriverConnect,
            Role::Target,
            Provider::Azure,
            "refused",
        );
        assert_eq!(MigrateError::from(conn).exit_code(), 1);
    }

    #[test]
    fn test_format_detailed_includes_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = MigrateError::file_access("input.sql", io);
        let text = err.format_detailed();
        assert!(text.contains("input.sql"));
        assert!(text.contains("Caused by"));
        assert!(text.contains("denied"));
    }
}
