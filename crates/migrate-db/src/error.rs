//! Error types for the migration library.

use std::fmt::Write as _;

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] tiberius::error::Error),

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A source value could not be converted to the target column type
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Data transfer failed for a specific table
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// A table task failed; wraps the underlying cause
    #[error("Table {table} failed: {source}")]
    TableFailed {
        table: String,
        #[source]
        source: Box<MigrateError>,
    },

    /// An operation exceeded its configured timeout
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// Checkpoint or restore-script store error
    #[error("State file error: {0}")]
    State(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Wrap an error with the name of the table whose task produced it.
    pub fn table_failed(table: impl Into<String>, source: MigrateError) -> Self {
        MigrateError::TableFailed {
            table: table.into(),
            source: Box::new(source),
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

        if let Some(diagnostics) = self.diagnostics() {
            output.push_str("\n\n");
            output.push_str(&diagnostics);
        }

        output
    }

    /// Engine-specific diagnostic fields, when the error came from a database server.
    pub fn diagnostics(&self) -> Option<String> {
        match self {
            MigrateError::TableFailed { source, .. } => source.diagnostics(),
            MigrateError::Target(e) => e.as_db_error().map(|db| {
                let mut out = String::new();
                let _ = writeln!(out, "Severity: {}", db.severity());
                let _ = writeln!(out, "SqlState: {}", db.code().code());
                let _ = writeln!(out, "MessageText: {}", db.message());
                if let Some(detail) = db.detail() {
                    let _ = writeln!(out, "Detail: {}", detail);
                }
                if let Some(hint) = db.hint() {
                    let _ = writeln!(out, "Hint: {}", hint);
                }
                if let Some(where_) = db.where_() {
                    let _ = writeln!(out, "Where: {}", where_);
                }
                if let Some(position) = db.position() {
                    let _ = writeln!(out, "Position: {:?}", position);
                }
                if let Some(file) = db.file() {
                    let _ = writeln!(out, "File: {}", file);
                }
                if let Some(line) = db.line() {
                    let _ = writeln!(out, "Line: {}", line);
                }
                if let Some(routine) = db.routine() {
                    let _ = writeln!(out, "Routine: {}", routine);
                }
                out.trim_end().to_string()
            }),
            MigrateError::Source(tiberius::error::Error::Server(token)) => {
                let mut out = String::new();
                let _ = writeln!(out, "Number: {}", token.code());
                let _ = writeln!(out, "State: {}", token.state());
                let _ = writeln!(out, "Class: {}", token.class());
                let _ = writeln!(out, "Message: {}", token.message());
                let _ = writeln!(out, "Server: {}", token.server());
                if !token.procedure().is_empty() {
                    let _ = writeln!(out, "Procedure: {}", token.procedure());
                }
                let _ = writeln!(out, "Line: {}", token.line());
                Some(out.trim_end().to_string())
            }
            _ => None,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => 2,
            _ => 1,
        }
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_detailed_includes_cause_chain() {
        let inner = MigrateError::Conversion("column \"qty\": 'abc' is not an integer".into());
        let err = MigrateError::table_failed("orders", inner);

        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: Table orders failed"));
        assert!(detailed.contains("Caused by:\n  1: Conversion error"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("missing".into()).exit_code(), 2);
        assert_eq!(MigrateError::transfer("t", "boom").exit_code(), 1);
        assert_eq!(MigrateError::State("unreadable".into()).exit_code(), 1);
    }

    #[test]
    fn test_diagnostics_absent_for_local_errors() {
        assert!(MigrateError::Conversion("x".into()).diagnostics().is_none());
        let timeout = MigrateError::Timeout {
            operation: "COPY finalize".into(),
            seconds: 900,
        };
        assert!(timeout.diagnostics().is_none());
        assert_eq!(timeout.to_string(), "COPY finalize timed out after 900s");
    }
}
