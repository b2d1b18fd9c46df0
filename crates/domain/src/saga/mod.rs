//! The Saga aggregate and its steps.

pub mod aggregate;
pub mod events;
pub mod state;
pub mod step;

pub use aggregate::Saga;
pub use events::SagaEvent;
pub use state::{SagaStatus, StepStatus};
pub use step::{SagaStep, StepDefinition, StepFailure};
