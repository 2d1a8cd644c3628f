//! Error types for the migration library.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// An endpoint could not be reached at startup
    #[error("Cannot connect to {endpoint} database: {message}")]
    Connectivity { endpoint: String, message: String },

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Table or foreign key discovery failed
    #[error("Metadata discovery failed: {0}")]
    Metadata(String),

    /// Catalog query error
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// A wave had a failed job or did not finish within its timeout
    #[error("Wave {wave} failed: {reason}")]
    WaveFailed {
        wave: usize,
        reason: String,
        failed_tables: Vec<String>,
    },

    /// State file error
    #[error("State file error: {0}")]
    State(String),

    /// Config hash mismatch on resume
    #[error("Config has changed since last run - cannot resume. Delete the state file to start fresh.")]
    ConfigChanged,

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
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Connectivity error for the named endpoint
    pub fn connectivity(endpoint: impl Into<String>, message: impl std::fmt::Display) -> Self {
        MigrateError::Connectivity {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) | MigrateError::ConfigChanged => 1,
            MigrateError::Connectivity { .. } | MigrateError::Pool { .. } => 2,
            MigrateError::Metadata(_) | MigrateError::Database(_) => 3,
            MigrateError::WaveFailed { .. } => 4,
            MigrateError::State(_) | MigrateError::Json(_) => 5,
            MigrateError::Cancelled => 6,
            MigrateError::Io(_) => 7,
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

        if let MigrateError::WaveFailed { failed_tables, .. } = self {
            if !failed_tables.is_empty() {
                output.push_str(&format!("\nFailed tables: {}", failed_tables.join(", ")));
            }
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_distinguish_failure_classes() {
        assert_eq!(MigrateError::Config("x".into()).exit_code(), 1);
        assert_eq!(MigrateError::connectivity("source", "refused").exit_code(), 2);
        assert_eq!(MigrateError::Metadata("x".into()).exit_code(), 3);
        assert_eq!(
            MigrateError::WaveFailed {
                wave: 1,
                reason: "x".into(),
                failed_tables: vec![],
            }
            .exit_code(),
            4
        );
        assert_eq!(MigrateError::Cancelled.exit_code(), 6);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(MigrateError::from(io).exit_code(), 7);
    }

    #[test]
    fn test_format_detailed_lists_failed_tables() {
        let err = MigrateError::WaveFailed {
            wave: 2,
            reason: "1 of 3 jobs failed".into(),
            failed_tables: vec!["orders".into()],
        };
        let text = err.format_detailed();
        assert!(text.contains("Wave 2 failed: 1 of 3 jobs failed"));
        assert!(text.contains("Failed tables: orders"));
    }

    #[test]
    fn test_connectivity_message_names_endpoint() {
        let err = MigrateError::connectivity("target", "connection refused");
        assert_eq!(
            err.to_string(),
            "Cannot connect to target database: connection refused"
        );
    }
}
