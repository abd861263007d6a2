//! Error types for the migration library.

use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Exit code for configuration errors.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for database errors.
pub const EXIT_DATABASE_ERROR: u8 = 2;
/// Exit code for lock acquisition failures.
pub const EXIT_LOCK_ERROR: u8 = 3;
/// Exit code for helper misuse inside a migration.
pub const EXIT_USAGE_ERROR: u8 = 4;
/// Exit code for lock policy violations detected after a migration ran.
pub const EXIT_LOCK_POLICY_ERROR: u8 = 5;
/// Exit code for gitlab_schema violations.
pub const EXIT_SCHEMA_ERROR: u8 = 6;
/// Exit code for file system errors.
pub const EXIT_IO_ERROR: u8 = 7;
/// Exit code when the run was interrupted by a signal.
pub const EXIT_CANCELLED: u8 = 130;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection or query error
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A statement could not acquire its lock within `lock_timeout`.
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// A helper was used in a way that can never succeed (fix the migration).
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// All timed lock-retry attempts failed and the caller asked not to block.
    #[error("Configured attempts to obtain locks are exhausted after {attempts} attempts")]
    AttemptsExhausted { attempts: usize },

    /// A transactional migration acquired high-severity locks in several statements.
    #[error("{0}")]
    MultipleTableLocks(String),

    /// A statement touched tables outside of the migration's gitlab_schema.
    #[error("Schema restriction violated: {0}")]
    SchemaViolation(String),

    /// A column a helper depends on does not exist.
    #[error("Column '{column}' does not exist on {table}")]
    MissingColumn { table: String, column: String },

    /// Identifier longer than PostgreSQL's 63-byte limit.
    #[error("Identifier '{name}' is too long ({len} > {max} bytes)")]
    IdentifierTooLong { name: String, len: usize, max: usize },

    /// A migration failed while running.
    #[error("Migration {version} failed: {message}")]
    Migration { version: i64, message: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was cancelled (SIGINT, etc.)
    #[error("Migration run cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create an InvalidUsage error
    pub fn usage(message: impl Into<String>) -> Self {
        MigrateError::InvalidUsage(message.into())
    }

    /// Create a Migration error
    pub fn migration(version: i64, message: impl Into<String>) -> Self {
        MigrateError::Migration {
            version,
            message: message.into(),
        }
    }

    /// Classify a driver error, mapping `lock_not_available` to [`MigrateError::LockTimeout`].
    pub fn from_pg(err: tokio_postgres::Error) -> Self {
        if err.code() == Some(&SqlState::LOCK_NOT_AVAILABLE) {
            let message = err
                .as_db_error()
                .map(|db| db.message().to_string())
                .unwrap_or_else(|| err.to_string());
            return MigrateError::LockTimeout(message);
        }
        MigrateError::Database(err)
    }

    /// Whether the lock-retry runner may retry after this error.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, MigrateError::LockTimeout(_))
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) | MigrateError::Json(_) => {
                EXIT_CONFIG_ERROR
            }
            MigrateError::Database(_) | MigrateError::Pool { .. } | MigrateError::Migration { .. } => {
                EXIT_DATABASE_ERROR
            }
            MigrateError::LockTimeout(_) | MigrateError::AttemptsExhausted { .. } => EXIT_LOCK_ERROR,
            MigrateError::InvalidUsage(_)
            | MigrateError::MissingColumn { .. }
            | MigrateError::IdentifierTooLong { .. } => EXIT_USAGE_ERROR,
            MigrateError::MultipleTableLocks(_) => EXIT_LOCK_POLICY_ERROR,
            MigrateError::SchemaViolation(_) => EXIT_SCHEMA_ERROR,
            MigrateError::Io(_) => EXIT_IO_ERROR,
            MigrateError::Cancelled => EXIT_CANCELLED,
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
