use std::path::PathBuf;

/// Errors from database operations.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// The database directory does not exist and creation was not requested.
    #[error("database not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Another open database holds the directory lock.
    #[error("database directory is locked: {}", .0.display())]
    Locked(PathBuf),

    /// I/O error from the underlying file system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The on-disk log is damaged somewhere other than its final record.
    #[error("corrupt log at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },

    /// The caller passed something the backend cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An internal lock was poisoned by a panicking writer.
    #[error("database lock poisoned")]
    LockPoisoned,

    /// The database was closed or destroyed.
    #[error("database is closed")]
    Closed,

    /// Failure injected by a test backend.
    #[error("injected failure: {0}")]
    Injected(&'static str),
}

impl DatabaseError {
    /// Whether this error indicates damaged on-disk state.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// Result alias for database operations.
pub type DbResult<T> = Result<T, DatabaseError>;
