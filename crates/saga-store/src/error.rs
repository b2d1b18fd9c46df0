use domain::DomainError;
use thiserror::Error;

use crate::{SagaId, Version};

/// Errors that can occur when reading or writing sagas.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored version did not match the version the writer expected.
    #[error(
        "Concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// No saga with this ID exists.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// A saga with this ID was already created.
    #[error("Saga already exists: {0}")]
    AlreadyExists(SagaId),

    /// A write carried no events.
    #[error("Cannot commit saga {0} without events")]
    EmptyCommit(SagaId),

    /// The journal could not be replayed into a saga.
    #[error("Replay error: {0}")]
    Replay(#[from] DomainError),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
