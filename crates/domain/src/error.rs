//! Domain error types.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::saga::{SagaStatus, StepStatus};

/// Errors raised by saga command methods.
#[derive(Debug, Error)]
pub enum DomainError {
    /// The saga's status does not permit the requested action.
    #[error("Cannot {action} a saga in {status} status")]
    InvalidTransition {
        action: &'static str,
        status: SagaStatus,
    },

    /// The saga passed its overall deadline.
    #[error("Saga expired at {timeout_at}")]
    Expired { timeout_at: DateTime<Utc> },

    /// The step is not in the status the action requires.
    #[error("Step '{step}' is {status}, expected {expected}")]
    UnexpectedStepStatus {
        step: String,
        status: StepStatus,
        expected: StepStatus,
    },

    /// A step index outside the saga's step list.
    #[error("Step index {index} out of range for {total} steps")]
    StepOutOfRange { index: usize, total: usize },

    /// A pending step whose retry delay has not elapsed.
    #[error("Step '{step}' is not due until {scheduled_at}")]
    StepNotDue {
        step: String,
        scheduled_at: DateTime<Utc>,
    },

    /// A saga definition without steps.
    #[error("Saga type '{0}' has no steps")]
    NoSteps(String),

    /// Two steps of one saga share a name.
    #[error("Duplicate step name '{0}'")]
    DuplicateStep(String),

    /// A journal that does not begin with SagaCreated.
    #[error("Journal does not start with SagaCreated")]
    MissingCreation,
}

/// Convenience type alias for domain results.
pub type Result<T> = std::result::Result<T, DomainError>;
