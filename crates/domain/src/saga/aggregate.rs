//! Saga aggregate.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::clock::add_duration;
use common::{SagaId, Version};
use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;
use crate::error::{DomainError, Result};

use super::events::*;
use super::state::{SagaStatus, StepStatus};
use super::step::{SagaStep, StepDefinition, StepFailure};

/// A saga run: its input, its ordered steps and where it is in them.
///
/// The record only changes through [`Aggregate::apply`]; the command
/// methods below check the current state and return the events that
/// describe a transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Saga {
    id: SagaId,
    #[serde(default)]
    version: Version,
    saga_type: String,
    data: serde_json::Value,
    status: SagaStatus,
    steps: Vec<SagaStep>,
    /// Next step to execute; walks backwards during compensation.
    current_step: usize,
    total_steps: usize,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    timeout_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    error: Option<String>,
    failed_step: Option<String>,
    /// Set when compensation was triggered by a step whose outcome is unknown.
    #[serde(default)]
    ambiguous: bool,
}

impl Aggregate for Saga {
    type Event = SagaEvent;
    type Error = DomainError;

    fn aggregate_type() -> &'static str {
        "Saga"
    }

    fn id(&self) -> SagaId {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            SagaEvent::SagaCreated(data) => {
                self.id = data.saga_id;
                self.saga_type = data.saga_type;
                self.data = data.data;
                self.total_steps = data.steps.len();
                self.steps = data.steps.into_iter().map(SagaStep::pending).collect();
                self.status = SagaStatus::Started;
                self.current_step = 0;
                self.started_at = Some(data.started_at);
                self.timeout_at = Some(data.timeout_at);
            }
            SagaEvent::StepStarted(data) => {
                if let Some(step) = self.steps.get_mut(data.step_index) {
                    step.mark_running(data.started_at, data.timeout_at);
                }
                self.current_step = data.step_index;
            }
            SagaEvent::StepCompleted(data) => {
                if let Some(step) = self.steps.get_mut(data.step_index) {
                    step.mark_completed(data.result, data.completed_at);
                }
                self.current_step = data.step_index + 1;
            }
            SagaEvent::StepRetryScheduled(data) => {
                if let Some(step) = self.steps.get_mut(data.step_index) {
                    step.mark_retry(data.error, data.retry_count, data.scheduled_at);
                }
            }
            SagaEvent::StepFailed(data) => {
                if let Some(step) = self.steps.get_mut(data.step_index) {
                    step.mark_failed(data.error, data.failed_at);
                }
            }
            SagaEvent::CompensationStarted(data) => {
                self.status = SagaStatus::Compensating;
                self.error = Some(data.reason);
                self.failed_step = data.failed_step;
                self.ambiguous = data.ambiguous;
            }
            SagaEvent::CompensationStepFailed(data) => {
                if let Some(step) = self.steps.get_mut(data.step_index) {
                    step.record_compensation_failure(
                        data.error,
                        data.retry_count,
                        data.scheduled_at,
                    );
                }
            }
            SagaEvent::CompensationStepCompleted(data) => {
                if let Some(step) = self.steps.get_mut(data.step_index) {
                    step.mark_compensated(data.compensated_at);
                }
                self.current_step = data.step_index;
            }
            SagaEvent::SagaCompleted(data) => {
                self.status = SagaStatus::Completed;
                self.completed_at = Some(data.completed_at);
            }
            SagaEvent::SagaCompensated(data) => {
                self.status = SagaStatus::Compensated;
                self.completed_at = Some(data.completed_at);
            }
            SagaEvent::SagaFailed(data) => {
                self.status = SagaStatus::Failed;
                self.error = Some(data.reason);
                if data.failed_step.is_some() {
                    self.failed_step = data.failed_step;
                }
            }
            SagaEvent::SagaCancelled(data) => {
                self.status = SagaStatus::Cancelled;
                self.cancelled_at = Some(data.cancelled_at);
            }
            SagaEvent::SagaRetried(_) => {
                self.status = SagaStatus::Started;
                self.current_step = 0;
                self.steps = self
                    .steps
                    .iter()
                    .map(|step| SagaStep::pending(step.definition().clone()))
                    .collect();
                self.completed_at = None;
                self.cancelled_at = None;
                self.error = None;
                self.failed_step = None;
                self.ambiguous = false;
            }
        }
    }
}

// Query methods
impl Saga {
    /// Rebuilds a saga from its journal.
    pub fn from_events(events: impl IntoIterator<Item = SagaEvent>) -> Result<Self> {
        let mut events = events.into_iter();
        let first = match events.next() {
            Some(event @ SagaEvent::SagaCreated(_)) => event,
            _ => return Err(DomainError::MissingCreation),
        };

        let mut saga = Saga::default();
        saga.apply(first);
        let mut count = 1;
        for event in events {
            saga.apply(event);
            count += 1;
        }
        saga.set_version(Version::initial().advance(count));
        Ok(saga)
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    /// Returns the immutable input payload.
    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn steps(&self) -> &[SagaStep] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&SagaStep> {
        self.steps.get(index)
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn timeout_at(&self) -> Option<DateTime<Utc>> {
        self.timeout_at
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    /// Returns the saga-level failure reason, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Returns the name of the step that caused the failure, if any.
    pub fn failed_step(&self) -> Option<&str> {
        self.failed_step.as_deref()
    }

    /// Percentage of the step list the cursor has moved past.
    pub fn progress_percent(&self) -> u8 {
        if self.total_steps == 0 {
            return 0;
        }
        (self.current_step.min(self.total_steps) * 100 / self.total_steps) as u8
    }

    /// Returns true once the overall deadline has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.timeout_at.is_some_and(|at| at <= now)
    }

    /// Returns the step currently marked running, if any.
    pub fn running_step(&self) -> Option<(usize, &SagaStep)> {
        self.steps
            .iter()
            .enumerate()
            .find(|(_, step)| step.status() == StepStatus::Running)
    }

    /// Results of the completed steps before `index`, in execution order.
    pub fn prior_results(&self, index: usize) -> Vec<(String, serde_json::Value)> {
        self.steps
            .iter()
            .take(index)
            .filter(|step| step.status() == StepStatus::Completed)
            .filter_map(|step| {
                step.result()
                    .map(|result| (step.name().to_string(), result.clone()))
            })
            .collect()
    }

    /// The most recently completed step that still has an effect to undo.
    pub fn next_compensation(&self) -> Option<usize> {
        self.steps.iter().rposition(SagaStep::needs_compensation)
    }

    fn step_or_err(&self, index: usize) -> Result<&SagaStep> {
        self.steps.get(index).ok_or(DomainError::StepOutOfRange {
            index,
            total: self.total_steps,
        })
    }

    fn require_step_status(&self, index: usize, expected: StepStatus) -> Result<&SagaStep> {
        let step = self.step_or_err(index)?;
        if step.status() != expected {
            return Err(DomainError::UnexpectedStepStatus {
                step: step.name().to_string(),
                status: step.status(),
                expected,
            });
        }
        Ok(step)
    }

    fn require_status(&self, expected: SagaStatus, action: &'static str) -> Result<()> {
        if self.status != expected {
            return Err(DomainError::InvalidTransition {
                action,
                status: self.status,
            });
        }
        Ok(())
    }
}

// Command methods (return events)
impl Saga {
    /// Validates a new saga and returns its creation event.
    pub fn create(
        saga_id: SagaId,
        saga_type: impl Into<String>,
        data: serde_json::Value,
        steps: Vec<StepDefinition>,
        started_at: DateTime<Utc>,
        timeout_at: DateTime<Utc>,
    ) -> Result<SagaEvent> {
        let saga_type = saga_type.into();
        if steps.is_empty() {
            return Err(DomainError::NoSteps(saga_type));
        }

        let mut seen = HashSet::new();
        for step in &steps {
            if !seen.insert(step.name.as_str()) {
                return Err(DomainError::DuplicateStep(step.name.clone()));
            }
        }

        Ok(SagaEvent::SagaCreated(SagaCreatedData {
            saga_id,
            saga_type,
            data,
            steps,
            started_at,
            timeout_at,
        }))
    }

    /// Marks the step at the cursor as running.
    pub fn start_step(&self, now: DateTime<Utc>) -> Result<Vec<SagaEvent>> {
        self.require_status(SagaStatus::Started, "advance")?;
        if let Some(timeout_at) = self.timeout_at.filter(|at| *at <= now) {
            return Err(DomainError::Expired { timeout_at });
        }

        let index = self.current_step;
        let step = self.require_step_status(index, StepStatus::Pending)?;
        if !step.is_due(now) {
            return Err(DomainError::StepNotDue {
                step: step.name().to_string(),
                scheduled_at: step.scheduled_at().unwrap_or(now),
            });
        }

        Ok(vec![SagaEvent::StepStarted(StepStartedData {
            step_index: index,
            step_name: step.name().to_string(),
            started_at: now,
            timeout_at: add_duration(now, step.definition().timeout),
        })])
    }

    /// Records a forward action's result.
    ///
    /// A running step is allowed to finish even if the saga was cancelled
    /// meanwhile. Completing the last step of a started saga completes it.
    pub fn complete_step(
        &self,
        index: usize,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Vec<SagaEvent>> {
        let step = self.require_step_status(index, StepStatus::Running)?;

        let mut events = vec![SagaEvent::StepCompleted(StepCompletedData {
            step_index: index,
            step_name: step.name().to_string(),
            result,
            completed_at: now,
        })];
        if self.status == SagaStatus::Started && index + 1 == self.total_steps {
            events.push(SagaEvent::SagaCompleted(SagaFinishedData { completed_at: now }));
        }
        Ok(events)
    }

    /// Records a failed forward attempt.
    ///
    /// Retryable failures with retries left put the step back to pending,
    /// scheduled after `retry_delay(new_retry_count)`. Anything else fails
    /// the step and, for a started saga, begins compensation.
    pub fn fail_step(
        &self,
        index: usize,
        failure: &StepFailure,
        retry_delay: impl FnOnce(u32) -> Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<SagaEvent>> {
        let step = self.require_step_status(index, StepStatus::Running)?;
        let step_name = step.name().to_string();

        if self.status == SagaStatus::Started
            && failure.retryable
            && step.retry_count() < step.max_retries()
        {
            let retry_count = step.retry_count() + 1;
            return Ok(vec![SagaEvent::StepRetryScheduled(StepRetryData {
                step_index: index,
                step_name,
                error: failure.message.clone(),
                retry_count,
                scheduled_at: add_duration(now, retry_delay(retry_count)),
            })]);
        }

        let mut events = vec![SagaEvent::StepFailed(StepFailedData {
            step_index: index,
            step_name: step_name.clone(),
            error: failure.message.clone(),
            failed_at: now,
        })];
        if self.status.can_compensate() {
            events.push(SagaEvent::CompensationStarted(CompensationStartedData {
                reason: failure.message.clone(),
                failed_step: Some(step_name),
                ambiguous: failure.ambiguous,
            }));
        }
        Ok(events)
    }

    /// Fails a started saga that outlived its overall deadline.
    pub fn expire(&self, now: DateTime<Utc>) -> Result<Vec<SagaEvent>> {
        self.require_status(SagaStatus::Started, "expire")?;
        let Some(timeout_at) = self.timeout_at.filter(|at| *at <= now) else {
            return Ok(vec![]);
        };

        Ok(vec![SagaEvent::CompensationStarted(
            CompensationStartedData {
                reason: format!("saga deadline exceeded at {timeout_at}"),
                failed_step: None,
                ambiguous: false,
            },
        )])
    }

    /// Completes a started saga whose cursor moved past the last step.
    pub fn complete(&self, now: DateTime<Utc>) -> Result<Vec<SagaEvent>> {
        self.require_status(SagaStatus::Started, "complete")?;
        if let Some(step) = self
            .steps
            .iter()
            .find(|step| step.status() != StepStatus::Completed)
        {
            return Err(DomainError::UnexpectedStepStatus {
                step: step.name().to_string(),
                status: step.status(),
                expected: StepStatus::Completed,
            });
        }
        Ok(vec![SagaEvent::SagaCompleted(SagaFinishedData {
            completed_at: now,
        })])
    }

    /// Records that a step's compensating action succeeded.
    pub fn complete_compensation_step(
        &self,
        index: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<SagaEvent>> {
        self.require_status(SagaStatus::Compensating, "compensate")?;
        let step = self.require_step_status(index, StepStatus::Completed)?;
        Ok(vec![SagaEvent::CompensationStepCompleted(
            CompensationStepData {
                step_index: index,
                step_name: step.name().to_string(),
                compensated_at: now,
            },
        )])
    }

    /// Records a failed compensation attempt that will be retried after
    /// `retry_delay(new_retry_count)`.
    pub fn fail_compensation_step(
        &self,
        index: usize,
        error: &str,
        retry_delay: impl FnOnce(u32) -> Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<SagaEvent>> {
        self.require_status(SagaStatus::Compensating, "compensate")?;
        let step = self.require_step_status(index, StepStatus::Completed)?;
        let retry_count = step.compensation_retry_count() + 1;
        Ok(vec![SagaEvent::CompensationStepFailed(
            CompensationStepFailedData {
                step_index: index,
                step_name: step.name().to_string(),
                error: error.to_string(),
                retry_count,
                scheduled_at: Some(add_duration(now, retry_delay(retry_count))),
            },
        )])
    }

    /// Freezes the saga after a compensation could not be confirmed.
    pub fn freeze(
        &self,
        index: usize,
        error: &str,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<Vec<SagaEvent>> {
        self.require_status(SagaStatus::Compensating, "freeze")?;
        let step = self.require_step_status(index, StepStatus::Completed)?;
        Ok(vec![
            SagaEvent::CompensationStepFailed(CompensationStepFailedData {
                step_index: index,
                step_name: step.name().to_string(),
                error: error.to_string(),
                retry_count: step.compensation_retry_count(),
                scheduled_at: None,
            }),
            SagaEvent::SagaFailed(SagaFailedData {
                reason,
                failed_step: Some(step.name().to_string()),
                failed_at: now,
            }),
        ])
    }

    /// Ends compensation once nothing is left to undo.
    ///
    /// A rollback triggered by an ambiguous step ends `failed`, because that
    /// step's own effect could not be confirmed either way.
    pub fn finish_compensation(&self, now: DateTime<Utc>) -> Result<Vec<SagaEvent>> {
        self.require_status(SagaStatus::Compensating, "finish compensating")?;
        if let Some(index) = self.next_compensation() {
            return Err(DomainError::UnexpectedStepStatus {
                step: self.steps[index].name().to_string(),
                status: StepStatus::Completed,
                expected: StepStatus::Compensated,
            });
        }

        if self.ambiguous {
            let step = self.failed_step.clone().unwrap_or_default();
            return Ok(vec![SagaEvent::SagaFailed(SagaFailedData {
                reason: format!(
                    "step '{step}' timed out with an unknown outcome; earlier steps were compensated"
                ),
                failed_step: self.failed_step.clone(),
                failed_at: now,
            })]);
        }

        Ok(vec![SagaEvent::SagaCompensated(SagaFinishedData {
            completed_at: now,
        })])
    }

    /// Cancels a started saga, optionally rolling back completed steps.
    pub fn cancel(&self, now: DateTime<Utc>, compensate: bool) -> Result<Vec<SagaEvent>> {
        if !self.status.can_cancel() {
            return Err(DomainError::InvalidTransition {
                action: "cancel",
                status: self.status,
            });
        }

        let mut events = vec![SagaEvent::SagaCancelled(SagaCancelledData {
            cancelled_at: now,
            compensate,
        })];
        if compensate {
            events.push(SagaEvent::CompensationStarted(CompensationStartedData {
                reason: "cancelled by caller".to_string(),
                failed_step: None,
                ambiguous: false,
            }));
        }
        Ok(events)
    }

    /// Restarts a failed or compensated saga from its first step.
    pub fn retry(&self, now: DateTime<Utc>) -> Result<Vec<SagaEvent>> {
        if !self.status.can_retry() {
            return Err(DomainError::InvalidTransition {
                action: "retry",
                status: self.status,
            });
        }
        if let Some(timeout_at) = self.timeout_at.filter(|at| *at <= now) {
            return Err(DomainError::Expired { timeout_at });
        }

        Ok(vec![SagaEvent::SagaRetried(SagaRetriedData {
            retried_at: now,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(name: &str, max_retries: u32, compensable: bool) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            timeout: Duration::from_secs(10),
            max_retries,
            compensable,
            idempotent: true,
        }
    }

    fn order_steps() -> Vec<StepDefinition> {
        vec![
            definition("reserve_inventory", 3, true),
            definition("charge_payment", 3, true),
            definition("send_notification", 3, false),
        ]
    }

    fn new_saga(now: DateTime<Utc>) -> Saga {
        let event = Saga::create(
            SagaId::new(),
            "create_order",
            serde_json::json!({"order_id": "o-1"}),
            order_steps(),
            now,
            now + chrono::Duration::hours(1),
        )
        .unwrap();
        let mut saga = Saga::default();
        saga.apply(event);
        saga
    }

    fn run(saga: &mut Saga, events: Vec<SagaEvent>) {
        saga.apply_events(events);
    }

    fn no_delay(_: u32) -> Duration {
        Duration::ZERO
    }

    #[test]
    fn test_create_populates_pending_steps() {
        let saga = new_saga(Utc::now());
        assert_eq!(saga.status(), SagaStatus::Started);
        assert_eq!(saga.total_steps(), 3);
        assert_eq!(saga.current_step(), 0);
        assert!(saga.steps().iter().all(|s| s.status() == StepStatus::Pending));
        assert_eq!(saga.progress_percent(), 0);
    }

    #[test]
    fn test_create_rejects_empty_and_duplicate_steps() {
        let now = Utc::now();
        let empty = Saga::create(SagaId::new(), "t", serde_json::Value::Null, vec![], now, now);
        assert!(matches!(empty, Err(DomainError::NoSteps(_))));

        let dup = Saga::create(
            SagaId::new(),
            "t",
            serde_json::Value::Null,
            vec![definition("a", 0, false), definition("a", 0, false)],
            now,
            now,
        );
        assert!(matches!(dup, Err(DomainError::DuplicateStep(name)) if name == "a"));
    }

    #[test]
    fn test_full_forward_run_completes() {
        let now = Utc::now();
        let mut saga = new_saga(now);

        for index in 0..3 {
            let started = saga.start_step(now).unwrap();
            run(&mut saga, started);
            assert_eq!(saga.step(index).unwrap().status(), StepStatus::Running);
            assert!(saga.step(index).unwrap().timeout_at().is_some());

            let completed = saga
                .complete_step(index, serde_json::json!({ "index": index }), now)
                .unwrap();
            run(&mut saga, completed);
        }

        assert_eq!(saga.status(), SagaStatus::Completed);
        assert_eq!(saga.current_step(), 3);
        assert_eq!(saga.progress_percent(), 100);
        assert_eq!(saga.completed_at(), Some(now));
        assert!(saga.steps().iter().all(|s| s.completed_at().is_some()));
    }

    #[test]
    fn test_prior_results_are_in_order() {
        let now = Utc::now();
        let mut saga = new_saga(now);
        for index in 0..2 {
            let started = saga.start_step(now).unwrap();
            run(&mut saga, started);
            let completed = saga
                .complete_step(index, serde_json::json!(index), now)
                .unwrap();
            run(&mut saga, completed);
        }

        let prior = saga.prior_results(2);
        assert_eq!(
            prior,
            vec![
                ("reserve_inventory".to_string(), serde_json::json!(0)),
                ("charge_payment".to_string(), serde_json::json!(1)),
            ]
        );
        assert!(saga.prior_results(0).is_empty());
    }

    #[test]
    fn test_retryable_failure_schedules_backoff() {
        let now = Utc::now();
        let mut saga = new_saga(now);
        let events = saga.start_step(now).unwrap();
        run(&mut saga, events);

        let events = saga
            .fail_step(
                0,
                &StepFailure::retryable("flaky"),
                |n| Duration::from_secs(2u64.pow(n)),
                now,
            )
            .unwrap();
        run(&mut saga, events);

        let step = saga.step(0).unwrap();
        assert_eq!(step.status(), StepStatus::Pending);
        assert_eq!(step.retry_count(), 1);
        assert_eq!(step.scheduled_at(), Some(now + chrono::Duration::seconds(2)));
        assert_eq!(saga.status(), SagaStatus::Started);

        assert!(matches!(
            saga.start_step(now),
            Err(DomainError::StepNotDue { .. })
        ));
        assert!(saga.start_step(now + chrono::Duration::seconds(2)).is_ok());
    }

    #[test]
    fn test_retries_exhausted_starts_compensation() {
        let now = Utc::now();
        let mut saga = new_saga(now);

        for _ in 0..3 {
            let events = saga.start_step(now).unwrap();
            run(&mut saga, events);
            let events = saga
                .fail_step(0, &StepFailure::retryable("flaky"), no_delay, now)
                .unwrap();
            run(&mut saga, events);
        }
        assert_eq!(saga.step(0).unwrap().retry_count(), 3);

        let events = saga.start_step(now).unwrap();
        run(&mut saga, events);
        let events = saga
            .fail_step(0, &StepFailure::retryable("still flaky"), no_delay, now)
            .unwrap();
        run(&mut saga, events);

        let step = saga.step(0).unwrap();
        assert_eq!(step.status(), StepStatus::Failed);
        assert_eq!(step.retry_count(), 3);
        assert_eq!(step.failed_at(), Some(now));
        assert_eq!(saga.status(), SagaStatus::Compensating);
        assert_eq!(saga.failed_step(), Some("reserve_inventory"));
        assert_eq!(saga.error(), Some("still flaky"));
    }

    #[test]
    fn test_compensation_walks_backwards_and_ends_compensated() {
        let now = Utc::now();
        let mut saga = new_saga(now);
        for index in 0..2 {
            let events = saga.start_step(now).unwrap();
            run(&mut saga, events);
            let done = saga.complete_step(index, serde_json::json!(index), now).unwrap();
            run(&mut saga, done);
        }
        let events = saga.start_step(now).unwrap();
        run(&mut saga, events);
        let failed = saga
            .fail_step(2, &StepFailure::permanent("smtp down"), no_delay, now)
            .unwrap();
        run(&mut saga, failed);

        assert_eq!(saga.next_compensation(), Some(1));
        let events = saga.complete_compensation_step(1, now).unwrap();
        run(&mut saga, events);
        assert_eq!(saga.current_step(), 1);
        assert_eq!(saga.next_compensation(), Some(0));
        let events = saga.complete_compensation_step(0, now).unwrap();
        run(&mut saga, events);
        assert_eq!(saga.next_compensation(), None);

        let events = saga.finish_compensation(now).unwrap();
        run(&mut saga, events);
        assert_eq!(saga.status(), SagaStatus::Compensated);
        assert!(saga.step(0).unwrap().was_compensated());
        assert!(saga.step(1).unwrap().was_compensated());
        assert_eq!(saga.step(2).unwrap().status(), StepStatus::Failed);
        for step in saga.steps() {
            assert_eq!(
                step.completed_at().is_some(),
                step.status() == StepStatus::Completed,
                "completed_at out of sync on {}",
                step.name()
            );
        }
    }

    #[test]
    fn test_ambiguous_failure_ends_failed_after_compensation() {
        let now = Utc::now();
        let mut saga = new_saga(now);
        let events = saga.start_step(now).unwrap();
        run(&mut saga, events);
        let failed = saga
            .fail_step(0, &StepFailure::ambiguous("timed out"), no_delay, now)
            .unwrap();
        run(&mut saga, failed);

        let events = saga.finish_compensation(now).unwrap();
        run(&mut saga, events);
        assert_eq!(saga.status(), SagaStatus::Failed);
        assert!(saga.error().unwrap().contains("unknown outcome"));
    }

    #[test]
    fn test_freeze_marks_failed_with_compensation_reason() {
        let now = Utc::now();
        let mut saga = new_saga(now);
        let events = saga.start_step(now).unwrap();
        run(&mut saga, events);
        let events = saga.complete_step(0, serde_json::json!({}), now).unwrap();
        run(&mut saga, events);
        let events = saga.start_step(now).unwrap();
        run(&mut saga, events);
        let failed = saga
            .fail_step(1, &StepFailure::permanent("declined"), no_delay, now)
            .unwrap();
        run(&mut saga, failed);

        let events = saga
            .freeze(0, "warehouse offline", "compensation exhausted".into(), now)
            .unwrap();
        run(&mut saga, events);

        assert_eq!(saga.status(), SagaStatus::Failed);
        assert_eq!(saga.error(), Some("compensation exhausted"));
        assert_eq!(saga.failed_step(), Some("reserve_inventory"));
        assert_eq!(saga.step(0).unwrap().status(), StepStatus::Completed);
    }

    #[test]
    fn test_failed_compensation_is_scheduled_for_later() {
        let now = Utc::now();
        let mut saga = new_saga(now);
        let events = saga.start_step(now).unwrap();
        run(&mut saga, events);
        let events = saga.complete_step(0, serde_json::json!({}), now).unwrap();
        run(&mut saga, events);
        let events = saga.start_step(now).unwrap();
        run(&mut saga, events);
        let failed = saga
            .fail_step(1, &StepFailure::permanent("declined"), no_delay, now)
            .unwrap();
        run(&mut saga, failed);

        let events = saga
            .fail_compensation_step(0, "warehouse busy", |n| Duration::from_secs(2 * n as u64), now)
            .unwrap();
        run(&mut saga, events);

        let step = saga.step(0).unwrap();
        assert_eq!(step.compensation_retry_count(), 1);
        assert_eq!(step.scheduled_at(), Some(now + chrono::Duration::seconds(2)));
        assert!(!step.is_compensation_due(now));
        assert!(step.is_compensation_due(now + chrono::Duration::seconds(2)));

        let events = saga.complete_compensation_step(0, now).unwrap();
        run(&mut saga, events);
        let step = saga.step(0).unwrap();
        assert!(step.scheduled_at().is_none());
        assert!(!step.is_compensation_due(now + chrono::Duration::seconds(2)));
    }

    #[test]
    fn test_cancel_only_while_started() {
        let now = Utc::now();
        let mut saga = new_saga(now);
        let events = saga.cancel(now, false).unwrap();
        run(&mut saga, events);
        assert_eq!(saga.status(), SagaStatus::Cancelled);
        assert_eq!(saga.cancelled_at(), Some(now));

        let err = saga.cancel(now, false).unwrap_err();
        assert!(matches!(
            err,
            DomainError::InvalidTransition {
                action: "cancel",
                status: SagaStatus::Cancelled
            }
        ));
        assert!(saga.start_step(now).is_err());
    }

    #[test]
    fn test_cancel_with_rollback_compensates() {
        let now = Utc::now();
        let mut saga = new_saga(now);
        let events = saga.start_step(now).unwrap();
        run(&mut saga, events);
        let events = saga.complete_step(0, serde_json::json!({}), now).unwrap();
        run(&mut saga, events);

        let events = saga.cancel(now, true).unwrap();
        run(&mut saga, events);
        assert_eq!(saga.status(), SagaStatus::Compensating);
        assert_eq!(saga.next_compensation(), Some(0));
        assert!(saga.cancelled_at().is_some());
    }

    #[test]
    fn test_running_step_may_finish_after_cancel() {
        let now = Utc::now();
        let mut saga = new_saga(now);
        let events = saga.start_step(now).unwrap();
        run(&mut saga, events);
        let events = saga.cancel(now, false).unwrap();
        run(&mut saga, events);

        let events = saga.complete_step(0, serde_json::json!("late"), now).unwrap();
        assert_eq!(events.len(), 1);
        run(&mut saga, events);
        assert_eq!(saga.status(), SagaStatus::Cancelled);
        assert_eq!(saga.step(0).unwrap().status(), StepStatus::Completed);
    }

    #[test]
    fn test_retry_resets_steps() {
        let now = Utc::now();
        let mut saga = new_saga(now);
        let events = saga.start_step(now).unwrap();
        run(&mut saga, events);
        let failed = saga
            .fail_step(0, &StepFailure::permanent("nope"), no_delay, now)
            .unwrap();
        run(&mut saga, failed);
        let events = saga.finish_compensation(now).unwrap();
        run(&mut saga, events);
        assert_eq!(saga.status(), SagaStatus::Compensated);

        let events = saga.retry(now).unwrap();
        run(&mut saga, events);
        assert_eq!(saga.status(), SagaStatus::Started);
        assert_eq!(saga.current_step(), 0);
        assert!(saga.error().is_none());
        assert!(saga.steps().iter().all(|s| s.status() == StepStatus::Pending
            && s.retry_count() == 0
            && s.error().is_none()));
    }

    #[test]
    fn test_retry_rejected_when_expired_or_not_terminal() {
        let now = Utc::now();
        let mut saga = new_saga(now);
        assert!(matches!(
            saga.retry(now),
            Err(DomainError::InvalidTransition { action: "retry", .. })
        ));

        let events = saga.start_step(now).unwrap();
        run(&mut saga, events);
        let failed = saga
            .fail_step(0, &StepFailure::permanent("nope"), no_delay, now)
            .unwrap();
        run(&mut saga, failed);
        let events = saga.finish_compensation(now).unwrap();
        run(&mut saga, events);

        let later = now + chrono::Duration::hours(2);
        assert!(matches!(saga.retry(later), Err(DomainError::Expired { .. })));
    }

    #[test]
    fn test_expire_starts_compensation_after_deadline() {
        let now = Utc::now();
        let saga = new_saga(now);
        assert!(saga.expire(now).unwrap().is_empty());

        let later = now + chrono::Duration::hours(1);
        let events = saga.expire(later).unwrap();
        assert!(matches!(events[0], SagaEvent::CompensationStarted(_)));
        assert!(matches!(saga.start_step(later), Err(DomainError::Expired { .. })));
    }

    #[test]
    fn test_from_events_replays_to_same_state() {
        let now = Utc::now();
        let created = Saga::create(
            SagaId::new(),
            "create_order",
            serde_json::json!({}),
            order_steps(),
            now,
            now + chrono::Duration::hours(1),
        )
        .unwrap();

        let mut saga = Saga::default();
        saga.apply(created.clone());
        let mut journal = vec![created];
        for index in 0..3 {
            let started = saga.start_step(now).unwrap();
            journal.extend(started.clone());
            run(&mut saga, started);
            let done = saga.complete_step(index, serde_json::json!(index), now).unwrap();
            journal.extend(done.clone());
            run(&mut saga, done);
        }

        let replayed = Saga::from_events(journal.clone()).unwrap();
        assert_eq!(replayed.version(), Version::new(journal.len() as i64));
        saga.set_version(replayed.version());
        assert_eq!(replayed, saga);

        assert!(matches!(
            Saga::from_events(journal.into_iter().skip(1)),
            Err(DomainError::MissingCreation)
        ));
    }
}
