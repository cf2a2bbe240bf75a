//! Store engine error types
//!
//! Defines all errors that can occur in the persistence layer, and the
//! crate-wide propagation policy: internal layers return `EngineResult`,
//! the engine facade converts failures into boolean/optional returns plus
//! a log line, and background loops log and continue. The only fatal path
//! is schema creation at construction time.

use thiserror::Error;

/// Errors that can occur in the error-history engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// All pool slots are occupied by healthy connections; retryable
    #[error("connection pool exhausted: all {capacity} slots in use")]
    PoolExhausted { capacity: usize },

    /// Underlying SQLite failure (I/O, constraint, syntax)
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// A record's map/list field could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or out-of-range configuration value
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// Failure inside a single scheduler pass
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl EngineError {
    /// Whether the caller can reasonably retry the operation as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::PoolExhausted { .. })
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
