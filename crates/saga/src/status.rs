//! Read models returned by status queries.

use chrono::{DateTime, Utc};
use common::SagaId;
use domain::{Aggregate, Saga, SagaStatus, SagaStep, StepStatus};
use serde::Serialize;

/// A saga's status with per-step detail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SagaDetail {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub status: SagaStatus,
    pub current_step: usize,
    pub total_steps: usize,
    pub progress_percent: u8,
    pub error: Option<String>,
    pub failed_step: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepDetail {
    pub name: String,
    pub status: StepStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Whether the step's effect has been undone.
    pub compensated: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub compensated_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl From<&SagaStep> for StepDetail {
    fn from(step: &SagaStep) -> Self {
        Self {
            name: step.name().to_string(),
            status: step.status(),
            retry_count: step.retry_count(),
            max_retries: step.max_retries(),
            compensated: step.was_compensated(),
            started_at: step.started_at(),
            completed_at: step.completed_at(),
            failed_at: step.failed_at(),
            timeout_at: step.timeout_at(),
            scheduled_at: step.scheduled_at(),
            compensated_at: step.compensated_at(),
            result: step.result().cloned(),
            error: step.error().map(str::to_string),
        }
    }
}

impl From<&Saga> for SagaDetail {
    fn from(saga: &Saga) -> Self {
        Self {
            saga_id: saga.id(),
            saga_type: saga.saga_type().to_string(),
            status: saga.status(),
            current_step: saga.current_step(),
            total_steps: saga.total_steps(),
            progress_percent: saga.progress_percent(),
            error: saga.error().map(str::to_string),
            failed_step: saga.failed_step().map(str::to_string),
            started_at: saga.started_at(),
            completed_at: saga.completed_at(),
            timeout_at: saga.timeout_at(),
            cancelled_at: saga.cancelled_at(),
            steps: saga.steps().iter().map(StepDetail::from).collect(),
        }
    }
}
