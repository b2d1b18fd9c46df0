//! Saga journal events.
//!
//! Every transition of a saga is recorded as one or more of these events,
//! committed together with the resulting record.

use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};

use crate::aggregate::DomainEvent;

use super::step::StepDefinition;

/// Events that can occur during a saga run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// Saga created with its steps captured from the registry.
    SagaCreated(SagaCreatedData),

    /// A step's forward action was invoked.
    StepStarted(StepStartedData),

    /// A step's forward action returned a result.
    StepCompleted(StepCompletedData),

    /// A step failed and was put back to pending for another attempt.
    StepRetryScheduled(StepRetryData),

    /// A step failed permanently.
    StepFailed(StepFailedData),

    /// Completed steps are about to be undone in reverse order.
    CompensationStarted(CompensationStartedData),

    /// A compensating action failed (it may be retried).
    CompensationStepFailed(CompensationStepFailedData),

    /// A compensating action confirmed the step's effect is undone.
    CompensationStepCompleted(CompensationStepData),

    /// All steps completed.
    SagaCompleted(SagaFinishedData),

    /// All completed steps were compensated.
    SagaCompensated(SagaFinishedData),

    /// The saga was frozen and needs an operator.
    SagaFailed(SagaFailedData),

    /// A caller cancelled the saga.
    SagaCancelled(SagaCancelledData),

    /// An operator restarted the saga from its first step.
    SagaRetried(SagaRetriedData),
}

impl DomainEvent for SagaEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::SagaCreated(_) => "SagaCreated",
            SagaEvent::StepStarted(_) => "StepStarted",
            SagaEvent::StepCompleted(_) => "StepCompleted",
            SagaEvent::StepRetryScheduled(_) => "StepRetryScheduled",
            SagaEvent::StepFailed(_) => "StepFailed",
            SagaEvent::CompensationStarted(_) => "CompensationStarted",
            SagaEvent::CompensationStepFailed(_) => "CompensationStepFailed",
            SagaEvent::CompensationStepCompleted(_) => "CompensationStepCompleted",
            SagaEvent::SagaCompleted(_) => "SagaCompleted",
            SagaEvent::SagaCompensated(_) => "SagaCompensated",
            SagaEvent::SagaFailed(_) => "SagaFailed",
            SagaEvent::SagaCancelled(_) => "SagaCancelled",
            SagaEvent::SagaRetried(_) => "SagaRetried",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaCreatedData {
    pub saga_id: SagaId,
    pub saga_type: String,
    /// The immutable input payload.
    pub data: serde_json::Value,
    pub steps: Vec<StepDefinition>,
    pub started_at: DateTime<Utc>,
    /// Overall deadline for the run.
    pub timeout_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStartedData {
    pub step_index: usize,
    pub step_name: String,
    pub started_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletedData {
    pub step_index: usize,
    pub step_name: String,
    pub result: serde_json::Value,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRetryData {
    pub step_index: usize,
    pub step_name: String,
    pub error: String,
    /// Retry count after this failure.
    pub retry_count: u32,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailedData {
    pub step_index: usize,
    pub step_name: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationStartedData {
    /// Why the saga is being rolled back.
    pub reason: String,
    /// The step whose failure triggered compensation, if any.
    pub failed_step: Option<String>,
    /// True when the failed step's outcome is unknown.
    #[serde(default)]
    pub ambiguous: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationStepFailedData {
    pub step_index: usize,
    pub step_name: String,
    pub error: String,
    pub retry_count: u32,
    /// Earliest time the compensation may be attempted again; `None` when
    /// it will not be retried.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationStepData {
    pub step_index: usize,
    pub step_name: String,
    pub compensated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFinishedData {
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFailedData {
    pub reason: String,
    pub failed_step: Option<String>,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaCancelledData {
    pub cancelled_at: DateTime<Utc>,
    /// Whether the caller also asked for completed steps to be undone.
    pub compensate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRetriedData {
    pub retried_at: DateTime<Utc>,
}
