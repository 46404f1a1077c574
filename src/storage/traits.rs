//! Storage traits and error types

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::storage::{EntityQuery, PersistedEntity};

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Timed out waiting for a pooled connection")]
    PoolTimeout,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid stored value: {0}")]
    InvalidData(String),

    #[error("Storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(failure, message)
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                Self::ConstraintViolation(message.clone().unwrap_or_else(|| e.to_string()))
            }
            _ => Self::Sqlite(e),
        }
    }
}

impl StorageError {
    /// Whether the error looks like lost or contended connectivity, which is
    /// worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
                failure.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
            ),
            Self::Pool(_) | Self::PoolTimeout | Self::Io(_) => true,
            _ => false,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Read-only access to persisted entities
///
/// This is the surface handed to consumers of the pipeline's output. Nothing
/// reachable through it mutates pipeline state.
pub trait EntityReader {
    /// Gets an entity by its identity key
    fn get_entity(&self, identity_key: &str) -> StorageResult<Option<PersistedEntity>>;

    /// Lists entities matching `query`, most recently seen first
    fn list_entities(&self, query: &EntityQuery) -> StorageResult<Vec<PersistedEntity>>;

    /// Counts entities matching `query`
    fn count_entities(&self, query: &EntityQuery) -> StorageResult<u64>;
}
