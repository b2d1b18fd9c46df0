//! Domain layer for the saga orchestrator.
//!
//! This crate provides:
//! - Aggregate and DomainEvent traits
//! - The Saga aggregate with its ordered SagaSteps
//! - The journal events every saga transition is recorded as
//! - The saga and step status state machines

pub mod aggregate;
pub mod error;
pub mod saga;

pub use aggregate::{Aggregate, DomainEvent};
pub use error::DomainError;
pub use saga::{
    Saga, SagaEvent, SagaStatus, SagaStep, StepDefinition, StepFailure, StepStatus,
};
