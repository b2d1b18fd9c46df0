//! Saga steps and the definitions they are created from.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::StepStatus;

/// The registry's description of a step, captured into the saga at creation.
///
/// A saga keeps the definitions it was created with, so later registry
/// changes never affect in-flight runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step name, unique within the saga.
    pub name: String,
    /// Deadline for one forward or compensating invocation.
    pub timeout: Duration,
    /// Retries allowed after the first failed attempt.
    pub max_retries: u32,
    /// Whether a compensating action is registered for the step.
    pub compensable: bool,
    /// Whether the forward action is safe to repeat after an ambiguous timeout.
    pub idempotent: bool,
}

/// Why an attempt at a step failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Human-readable reason, stored as the step's `error`.
    pub message: String,
    /// Whether another attempt may succeed.
    pub retryable: bool,
    /// Whether the external effect is unknown (timeout of a non-idempotent action).
    pub ambiguous: bool,
}

impl StepFailure {
    /// A failure another attempt may fix.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            ambiguous: false,
        }
    }

    /// A failure that must not be retried.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            ambiguous: false,
        }
    }

    /// A timed-out invocation whose side effect may or may not have happened.
    pub fn ambiguous(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            ambiguous: true,
        }
    }
}

/// One unit of work inside a saga run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStep {
    definition: StepDefinition,
    status: StepStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    timeout_at: Option<DateTime<Utc>>,
    /// Earliest time a pending retry, or a failed compensation, may run again.
    scheduled_at: Option<DateTime<Utc>>,
    compensated_at: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
    error: Option<String>,
    retry_count: u32,
    compensation_retry_count: u32,
}

impl SagaStep {
    /// Creates a pending step from its definition.
    pub fn pending(definition: StepDefinition) -> Self {
        Self {
            definition,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            failed_at: None,
            timeout_at: None,
            scheduled_at: None,
            compensated_at: None,
            result: None,
            error: None,
            retry_count: 0,
            compensation_retry_count: 0,
        }
    }

    pub fn definition(&self) -> &StepDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn failed_at(&self) -> Option<DateTime<Utc>> {
        self.failed_at
    }

    pub fn timeout_at(&self) -> Option<DateTime<Utc>> {
        self.timeout_at
    }

    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.scheduled_at
    }

    pub fn compensated_at(&self) -> Option<DateTime<Utc>> {
        self.compensated_at
    }

    /// Returns the payload produced by the forward action.
    pub fn result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref()
    }

    /// Returns the last error recorded for the step.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.definition.max_retries
    }

    pub fn compensation_retry_count(&self) -> u32 {
        self.compensation_retry_count
    }

    /// Returns true if the step's effect has been undone.
    pub fn was_compensated(&self) -> bool {
        self.status == StepStatus::Compensated
    }

    /// Returns true if the step completed and has an effect left to undo.
    pub fn needs_compensation(&self) -> bool {
        self.status == StepStatus::Completed && self.definition.compensable
    }

    /// Returns true if a pending step may start at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == StepStatus::Pending && self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Returns true if the step's compensation may be attempted at `now`.
    pub fn is_compensation_due(&self, now: DateTime<Utc>) -> bool {
        self.needs_compensation() && self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Returns true if a running step has outlived its deadline.
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.status == StepStatus::Running && self.timeout_at.is_some_and(|at| at <= now)
    }

    pub(crate) fn mark_running(&mut self, started_at: DateTime<Utc>, timeout_at: DateTime<Utc>) {
        self.status = StepStatus::Running;
        self.started_at = Some(started_at);
        self.timeout_at = Some(timeout_at);
        self.scheduled_at = None;
    }

    pub(crate) fn mark_completed(&mut self, result: serde_json::Value, at: DateTime<Utc>) {
        self.status = StepStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(at);
        self.timeout_at = None;
    }

    pub(crate) fn mark_retry(&mut self, error: String, retry_count: u32, at: DateTime<Utc>) {
        self.status = StepStatus::Pending;
        self.error = Some(error);
        self.retry_count = retry_count;
        self.scheduled_at = Some(at);
        self.timeout_at = None;
    }

    pub(crate) fn mark_failed(&mut self, error: String, at: DateTime<Utc>) {
        self.status = StepStatus::Failed;
        self.error = Some(error);
        self.failed_at = Some(at);
        self.timeout_at = None;
    }

    pub(crate) fn record_compensation_failure(
        &mut self,
        error: String,
        retry_count: u32,
        scheduled_at: Option<DateTime<Utc>>,
    ) {
        self.error = Some(error);
        self.compensation_retry_count = retry_count;
        self.scheduled_at = scheduled_at;
    }

    /// `completed_at` is only kept while the step is `completed`; the
    /// completion time stays in the journal.
    pub(crate) fn mark_compensated(&mut self, at: DateTime<Utc>) {
        self.status = StepStatus::Compensated;
        self.completed_at = None;
        self.scheduled_at = None;
        self.compensated_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> StepDefinition {
        StepDefinition {
            name: "reserve_inventory".to_string(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
            compensable: true,
            idempotent: true,
        }
    }

    #[test]
    fn test_pending_step_is_due_immediately() {
        let step = SagaStep::pending(definition());
        let now = Utc::now();
        assert_eq!(step.status(), StepStatus::Pending);
        assert!(step.is_due(now));
        assert_eq!(step.retry_count(), 0);
        assert!(step.result().is_none());
    }

    #[test]
    fn test_retry_schedules_in_the_future() {
        let mut step = SagaStep::pending(definition());
        let now = Utc::now();
        step.mark_running(now, now + chrono::Duration::seconds(5));
        step.mark_retry("flaky".into(), 1, now + chrono::Duration::seconds(2));

        assert_eq!(step.status(), StepStatus::Pending);
        assert_eq!(step.retry_count(), 1);
        assert_eq!(step.error(), Some("flaky"));
        assert!(step.failed_at().is_none());
        assert!(!step.is_due(now));
        assert!(step.is_due(now + chrono::Duration::seconds(2)));
    }

    #[test]
    fn test_timed_out_only_while_running() {
        let mut step = SagaStep::pending(definition());
        let now = Utc::now();
        assert!(!step.is_timed_out(now));

        step.mark_running(now, now + chrono::Duration::seconds(5));
        assert!(!step.is_timed_out(now));
        assert!(step.is_timed_out(now + chrono::Duration::seconds(5)));

        step.mark_completed(serde_json::json!({}), now);
        assert!(!step.is_timed_out(now + chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_needs_compensation_respects_compensable_flag() {
        let now = Utc::now();
        let mut step = SagaStep::pending(definition());
        step.mark_completed(serde_json::json!({"id": 1}), now);
        assert!(step.needs_compensation());

        step.mark_compensated(now);
        assert!(!step.needs_compensation());
        assert!(step.was_compensated());
        assert!(step.completed_at().is_none());
        assert_eq!(step.compensated_at(), Some(now));
        assert_eq!(step.result(), Some(&serde_json::json!({"id": 1})));

        let mut read_only = SagaStep::pending(StepDefinition {
            compensable: false,
            ..definition()
        });
        read_only.mark_completed(serde_json::json!(true), now);
        assert!(!read_only.needs_compensation());
    }
}
