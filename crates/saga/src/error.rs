//! Saga error types.

use std::time::Duration;

use common::SagaId;
use domain::DomainError;
use saga_store::StoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No saga type with this name is registered.
    #[error("Unknown saga type: {0}")]
    UnknownSagaType(String),

    /// A forward or compensating action did not return within its deadline.
    #[error("Step '{step}' timed out after {timeout:?}")]
    StepTimeout { step: String, timeout: Duration },

    /// An action reported a failure.
    #[error("Step '{step}' failed: {message}")]
    StepAction {
        step: String,
        message: String,
        retryable: bool,
    },

    /// A compensating action kept failing; the saga is frozen.
    #[error("Compensation of step '{step}' failed after {attempts} attempt(s): {message}")]
    CompensationExhausted {
        step: String,
        attempts: u32,
        message: String,
    },

    /// The saga's status does not permit the requested operation.
    #[error("Invalid transition for saga {saga_id}: {reason}")]
    InvalidTransition { saga_id: SagaId, reason: String },

    /// No saga with this ID exists.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// Registry configuration names an action nobody registered.
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// A malformed saga definition.
    #[error("Invalid saga definition: {0}")]
    Registry(String),

    /// Domain error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Store error.
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Maps a rejected command on a saga to the caller-facing error.
    pub(crate) fn rejected(saga_id: SagaId, err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition { .. } | DomainError::Expired { .. } => {
                SagaError::InvalidTransition {
                    saga_id,
                    reason: err.to_string(),
                }
            }
            other => SagaError::Domain(other),
        }
    }
}

impl From<StoreError> for SagaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(saga_id) => SagaError::NotFound(saga_id),
            other => SagaError::Store(other),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
