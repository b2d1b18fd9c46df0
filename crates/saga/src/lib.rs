//! Saga orchestration.
//!
//! A saga is a multi-step business transaction whose steps each have a
//! forward action and, optionally, a compensating action. The
//! [`Orchestrator`] runs the steps in order, retries retryable failures
//! with exponential backoff, and on a permanent failure undoes the
//! completed steps in reverse order. Every transition is persisted through
//! a [`SagaStore`](saga_store::SagaStore) so a crashed process can be
//! resumed by the sweeper.
//!
//! The `create_order` saga is built in:
//! 1. Reserve inventory
//! 2. Charge payment
//! 3. Send notification

pub mod action;
pub mod choreography;
mod compensation;
pub mod config;
pub mod create_order;
pub mod error;
pub mod fault;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod services;
pub mod status;
pub mod sweeper;

pub use action::{
    ActionError, CompensatingAction, CompensationContext, ForwardAction, StepContext,
    compensate_fn, forward_fn,
};
pub use choreography::{ChoreographyEvent, EventDeduplicator, EventKind};
pub use config::OrchestratorConfig;
pub use error::{Result, SagaError};
pub use fault::{FaultInjector, Faulty};
pub use orchestrator::{CancelOptions, Orchestrator};
pub use registry::{ActionCatalog, Registry, RegistryBuilder, SagaTypeConfig, StepConfig, StepSpec};
pub use retry::RetryPolicy;
pub use status::{SagaDetail, StepDetail};
pub use sweeper::SweepReport;
