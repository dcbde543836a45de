//! Error taxonomy for the persistence layer.
use thiserror::Error;

/// Errors raised while bringing up a [`crate::store::Store`].
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid store configuration: {0}")]
    Config(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to connect to database: {0}")]
    Connect(String),

    #[error("health check failed: {0}")]
    Health(String),

    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),
}

/// Result type for [`StoreError`].
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised while applying embedded schema migrations.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("failed to apply migration {version} ({name}): {source}")]
    Apply {
        version: i64,
        name: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to record migration {version} ({name}): {source}")]
    Record {
        version: i64,
        name: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("schema verification failed: missing {0}")]
    Incomplete(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors raised by repository operations.
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("api key not found: {0}")]
    ApiKeyNotFound(String),

    #[error("email already exists: {0}")]
    EmailExists(String),

    #[error("an admin user already exists")]
    AlreadyBootstrapped,

    #[error("workflow is not ready to complete: {0}")]
    WorkflowNotReady(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("foreign key violation: {0}")]
    ForeignKey(String),

    #[error("database busy/locked: {0}")]
    Busy(String),

    #[error("output transformer failed: {0}")]
    Transformer(String),

    #[error("usage error: {0}")]
    Usage(String),

    #[error("transaction retries exhausted: {0}")]
    RetriesExhausted(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for repository operations.
pub type RepositoryResult<T> = Result<T, RepositoryError>;

impl RepositoryError {
    /// Classify a raw `sqlx::Error` as SQLite BUSY/LOCKED. Primary signal is the
    /// driver's reported code; string-match is only a fallback for wrapped/
    /// foreign-key-checked errors that lose the code.
    pub fn is_busy(err: &sqlx::Error) -> bool {
        if let sqlx::Error::Database(db_err) = err {
            if let Some(code) = db_err.code() {
                // SQLite: 5 = SQLITE_BUSY, 6 = SQLITE_LOCKED (primary result codes).
                if code == "5" || code == "6" {
                    return true;
                }
            }
        }
        err.to_string().contains("database is locked") || err.to_string().contains("database table is locked")
    }

    /// True for FOREIGN KEY constraint violations raised by SQLite.
    pub fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
        if let sqlx::Error::Database(db_err) = err {
            let msg = db_err.message();
            return msg.contains("FOREIGN KEY constraint failed");
        }
        false
    }

    /// Map a raw driver error from a mandatory single-row fetch into the
    /// appropriate `NotFound` variant, or pass through as `Database` otherwise.
    pub fn from_fetch(err: sqlx::Error, not_found: impl FnOnce() -> RepositoryError) -> RepositoryError {
        match err {
            sqlx::Error::RowNotFound => not_found(),
            other if Self::is_foreign_key_violation(&other) => {
                RepositoryError::ForeignKey(other.to_string())
            }
            other => RepositoryError::Database(other),
        }
    }
}
