//! Saga orchestrator.
//!
//! Drives each saga through its steps in order, one driver loop per saga.
//! Every change is made through [`Orchestrator::transition`]: load the
//! saga, decide the events with a domain command, apply them, and commit
//! the record and events together against the loaded version. A version
//! conflict (a concurrent `cancel`, say) reloads and decides again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::SagaId;
use common::clock::{Clock, add_duration, until};
use domain::{Aggregate, Saga, SagaEvent, SagaStatus, StepDefinition, StepFailure, StepStatus};
use saga_store::{EventEnvelope, SagaQuery, SagaStore, SagaStoreExt, StoreError};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::action::StepContext;
use crate::config::OrchestratorConfig;
use crate::error::{Result, SagaError};
use crate::registry::{Registry, StepSpec};
use crate::status::SagaDetail;

const MAX_COMMIT_ATTEMPTS: usize = 16;

/// Options for [`Orchestrator::cancel`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelOptions {
    /// Also undo the steps that already completed.
    pub compensate: bool,
}

impl CancelOptions {
    pub fn rollback() -> Self {
        Self { compensate: true }
    }
}

/// What the driver loop does next.
#[derive(Debug)]
pub(crate) enum Progress {
    Continue,
    Wait(Duration),
    Done,
}

/// A committed transition: the saga after it and the events recorded.
#[derive(Debug)]
pub(crate) struct Committed {
    pub saga: Saga,
    pub events: Vec<SagaEvent>,
}

/// Sagas that currently have a driver loop in this process.
///
/// The flag records that another start was requested while the saga was
/// owned; the owning loop takes another pass before letting go.
#[derive(Debug, Clone, Default)]
pub(crate) struct Drivers(Arc<Mutex<HashMap<SagaId, bool>>>);

impl Drivers {
    pub(crate) fn acquire(&self, saga_id: SagaId) -> Option<DriverGuard> {
        let mut driven = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rerun) = driven.get_mut(&saga_id) {
            *rerun = true;
            return None;
        }
        driven.insert(saga_id, false);
        Some(DriverGuard {
            drivers: self.clone(),
            saga_id,
            released: false,
        })
    }

    pub(crate) fn is_driven(&self, saga_id: SagaId) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&saga_id)
    }
}

pub(crate) struct DriverGuard {
    drivers: Drivers,
    saga_id: SagaId,
    released: bool,
}

impl DriverGuard {
    /// Gives up ownership unless a start was requested meanwhile. Returns
    /// true if the caller still owns the saga and must drive it again.
    pub(crate) fn release_or_rerun(&mut self) -> bool {
        let mut driven = self
            .drivers
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match driven.get_mut(&self.saga_id) {
            Some(rerun) if *rerun => {
                *rerun = false;
                true
            }
            _ => {
                driven.remove(&self.saga_id);
                self.released = true;
                false
            }
        }
    }
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        if !self.released {
            self.drivers
                .0
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.saga_id);
        }
    }
}

/// Creates, drives, cancels and retries sagas.
pub struct Orchestrator<S> {
    pub(crate) store: S,
    pub(crate) registry: Arc<Registry>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: OrchestratorConfig,
    pub(crate) drivers: Drivers,
}

impl<S: SagaStore + 'static> Orchestrator<S> {
    pub fn new(
        store: S,
        registry: Arc<Registry>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            config,
            drivers: Drivers::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Returns true while a driver loop in this process owns the saga.
    pub fn is_driven(&self, saga_id: SagaId) -> bool {
        self.drivers.is_driven(saga_id)
    }

    /// Creates and stores a new saga without driving it.
    #[tracing::instrument(skip(self, data))]
    pub async fn create_saga(&self, saga_type: &str, data: Value) -> Result<Saga> {
        let definitions = self
            .registry
            .steps_for(saga_type)?
            .iter()
            .map(StepSpec::definition)
            .collect();

        let now = self.clock.now();
        let created = Saga::create(
            SagaId::new(),
            saga_type,
            data,
            definitions,
            now,
            add_duration(now, self.config.overall_timeout),
        )?;

        let mut saga = Saga::default();
        saga.apply(created.clone());
        let events = vec![created];
        let version = self.store.create(&saga, &events).await?;
        saga.set_version(version);

        self.observe(&saga, &events);
        Ok(saga)
    }

    /// Creates a saga and drives it in the background.
    ///
    /// Returns as soon as the saga is stored; poll [`Self::get_status`] for
    /// progress.
    pub async fn start_saga(self: &Arc<Self>, saga_type: &str, data: Value) -> Result<Saga> {
        let saga = self.create_saga(saga_type, data).await?;
        self.spawn_run(saga.id());
        Ok(saga)
    }

    /// Creates a saga and drives it to a terminal status before returning.
    pub async fn execute_saga(&self, saga_type: &str, data: Value) -> Result<Saga> {
        let saga = self.create_saga(saga_type, data).await?;
        self.run_saga(saga.id()).await
    }

    /// Drives a saga on a background task.
    pub fn spawn_run(self: &Arc<Self>, saga_id: SagaId) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.run_saga(saga_id).await {
                tracing::error!(%saga_id, error = %e, "saga driver stopped");
            }
        })
    }

    /// Drives a saga until it reaches a terminal status.
    ///
    /// If another loop in this process already drives the saga, returns
    /// its current state immediately; that loop re-reads the saga before it
    /// stops, so a `retry` or rollback committed meanwhile is not lost.
    #[tracing::instrument(skip(self))]
    pub async fn run_saga(&self, saga_id: SagaId) -> Result<Saga> {
        let Some(mut guard) = self.drivers.acquire(saga_id) else {
            tracing::debug!(%saga_id, "saga already has a driver");
            return self.get_saga(saga_id).await;
        };

        loop {
            let saga = self.get_saga(saga_id).await?;
            let progress = match saga.status() {
                SagaStatus::Started => self.advance(&saga).await?,
                SagaStatus::Compensating => self.compensate_next(&saga).await?,
                _ => Progress::Done,
            };

            match progress {
                Progress::Continue => {}
                Progress::Wait(delay) => self.clock.sleep(delay).await,
                Progress::Done if guard.release_or_rerun() => {
                    tracing::debug!(%saga_id, "start requested while driving, checking again");
                }
                Progress::Done => return Ok(saga),
            }
        }
    }

    /// One forward iteration: expire, wait for a backoff, or run the step
    /// at the cursor.
    async fn advance(&self, saga: &Saga) -> Result<Progress> {
        let saga_id = saga.id();
        let now = self.clock.now();

        if saga.is_expired(now) {
            tracing::warn!(%saga_id, "saga deadline exceeded");
            self.try_transition(saga_id, |s, now| s.expire(now)).await?;
            return Ok(Progress::Continue);
        }

        let index = saga.current_step();
        let Some(step) = saga.step(index) else {
            self.try_transition(saga_id, |s, now| s.complete(now)).await?;
            return Ok(Progress::Continue);
        };

        match step.status() {
            StepStatus::Pending => {
                if let Some(scheduled_at) = step.scheduled_at()
                    && scheduled_at > now
                {
                    return Ok(Progress::Wait(until(now, scheduled_at)));
                }
                self.execute_step(saga_id).await?;
                Ok(Progress::Continue)
            }
            // Left running by a driver that is gone
            StepStatus::Running => {
                if step.is_timed_out(now) {
                    self.fail_timed_out_step(saga_id, index, step.definition())
                        .await?;
                    return Ok(Progress::Continue);
                }
                Ok(Progress::Wait(
                    step.timeout_at().map_or(Duration::ZERO, |at| until(now, at)),
                ))
            }
            StepStatus::Completed | StepStatus::Failed | StepStatus::Compensated => {
                Ok(Progress::Done)
            }
        }
    }

    /// Starts the step at the cursor, invokes its forward action under the
    /// step timeout, and records the outcome.
    async fn execute_step(&self, saga_id: SagaId) -> Result<()> {
        let Some(Committed { saga, .. }) = self
            .try_transition(saga_id, |s, now| s.start_step(now))
            .await?
        else {
            return Ok(());
        };
        let Some((index, step)) = saga.running_step() else {
            return Ok(());
        };

        let definition = step.definition().clone();
        let ctx = StepContext {
            saga_id,
            step_name: definition.name.clone(),
            data: saga.data().clone(),
            prior_results: saga.prior_results(index),
        };
        tracing::info!(
            %saga_id,
            step = %definition.name,
            attempt = step.retry_count() + 1,
            "executing step"
        );

        let outcome = match self.registry.step(saga.saga_type(), &definition.name) {
            None => Err(StepFailure::permanent(format!(
                "no action registered for step '{}'",
                definition.name
            ))),
            Some(spec) => {
                match tokio::time::timeout(definition.timeout, spec.forward.execute(&ctx)).await {
                    Ok(Ok(result)) => Ok(result),
                    Ok(Err(e)) => {
                        let retryable = e.retryable;
                        let message = SagaError::StepAction {
                            step: definition.name.clone(),
                            message: e.message,
                            retryable,
                        }
                        .to_string();
                        Err(StepFailure {
                            message,
                            retryable,
                            ambiguous: false,
                        })
                    }
                    Err(_) => Err(self.timeout_failure(&definition)),
                }
            }
        };

        match outcome {
            Ok(result) => {
                self.try_transition(saga_id, |s, now| {
                    s.complete_step(index, result.clone(), now)
                })
                .await?;
            }
            Err(failure) => {
                let retry = self.config.retry;
                self.try_transition(saga_id, |s, now| {
                    s.fail_step(index, &failure, |n| retry.delay_for(n), now)
                })
                .await?;
            }
        }
        Ok(())
    }

    /// A timeout is retryable only for idempotent steps; otherwise the
    /// step's effect is unknown.
    fn timeout_failure(&self, definition: &StepDefinition) -> StepFailure {
        metrics::counter!("saga_step_timeouts_total").increment(1);
        let message = SagaError::StepTimeout {
            step: definition.name.clone(),
            timeout: definition.timeout,
        }
        .to_string();

        if definition.idempotent {
            StepFailure::retryable(message)
        } else {
            StepFailure::ambiguous(message)
        }
    }

    /// Records a running step past its deadline as timed out. Returns true
    /// if the failure was committed.
    pub(crate) async fn fail_timed_out_step(
        &self,
        saga_id: SagaId,
        index: usize,
        definition: &StepDefinition,
    ) -> Result<bool> {
        let failure = self.timeout_failure(definition);
        let retry = self.config.retry;
        let committed = self
            .try_transition(saga_id, |s, now| {
                if !s.step(index).is_some_and(|step| step.is_timed_out(now)) {
                    return Ok(vec![]);
                }
                s.fail_step(index, &failure, |n| retry.delay_for(n), now)
            })
            .await?;
        Ok(committed.is_some_and(|c| !c.events.is_empty()))
    }

    /// Loads, decides, applies and commits one transition.
    ///
    /// `decide` runs against the freshly loaded saga and may run more than
    /// once if a concurrent writer commits first.
    pub(crate) async fn transition<F>(&self, saga_id: SagaId, decide: F) -> Result<Committed>
    where
        F: Fn(&Saga, DateTime<Utc>) -> domain::error::Result<Vec<SagaEvent>> + Send + Sync,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut saga = self.get_saga(saga_id).await?;
            let expected = saga.version();

            let events =
                decide(&saga, self.clock.now()).map_err(|e| SagaError::rejected(saga_id, e))?;
            if events.is_empty() {
                return Ok(Committed { saga, events });
            }

            saga.apply_events(events.iter().cloned());
            match self.store.commit(&saga, &events, expected).await {
                Ok(version) => {
                    saga.set_version(version);
                    self.observe(&saga, &events);
                    return Ok(Committed { saga, events });
                }
                Err(StoreError::ConcurrencyConflict { .. }) if attempts < MAX_COMMIT_ATTEMPTS => {
                    tracing::debug!(%saga_id, attempts, "version conflict, reloading saga");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Like [`Self::transition`], but a command the saga's current state
    /// rejects yields `None` instead of an error.
    pub(crate) async fn try_transition<F>(
        &self,
        saga_id: SagaId,
        decide: F,
    ) -> Result<Option<Committed>>
    where
        F: Fn(&Saga, DateTime<Utc>) -> domain::error::Result<Vec<SagaEvent>> + Send + Sync,
    {
        match self.transition(saga_id, decide).await {
            Ok(committed) => Ok(Some(committed)),
            Err(e @ (SagaError::InvalidTransition { .. } | SagaError::Domain(_))) => {
                tracing::debug!(%saga_id, reason = %e, "transition no longer applies");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Logs and counts committed events.
    fn observe(&self, saga: &Saga, events: &[SagaEvent]) {
        let saga_id = saga.id();
        let saga_type = saga.saga_type().to_string();

        for event in events {
            match event {
                SagaEvent::SagaCreated(data) => {
                    metrics::counter!("saga_started_total", "saga_type" => saga_type.clone())
                        .increment(1);
                    tracing::info!(%saga_id, %saga_type, steps = data.steps.len(), "saga started");
                }
                SagaEvent::StepStarted(data) => {
                    tracing::debug!(%saga_id, step = %data.step_name, "step started");
                }
                SagaEvent::StepCompleted(data) => {
                    tracing::info!(%saga_id, step = %data.step_name, "step completed");
                }
                SagaEvent::StepRetryScheduled(data) => {
                    metrics::counter!("saga_step_retries_total", "step" => data.step_name.clone())
                        .increment(1);
                    tracing::warn!(
                        %saga_id,
                        step = %data.step_name,
                        retry_count = data.retry_count,
                        scheduled_at = %data.scheduled_at,
                        error = %data.error,
                        "step failed, retry scheduled"
                    );
                }
                SagaEvent::StepFailed(data) => {
                    tracing::warn!(%saga_id, step = %data.step_name, error = %data.error, "step failed");
                }
                SagaEvent::CompensationStarted(data) => {
                    tracing::warn!(
                        %saga_id,
                        reason = %data.reason,
                        failed_step = ?data.failed_step,
                        ambiguous = data.ambiguous,
                        "compensation started"
                    );
                }
                SagaEvent::CompensationStepFailed(data) => {
                    metrics::counter!("saga_compensation_failures_total", "step" => data.step_name.clone())
                        .increment(1);
                    tracing::warn!(
                        %saga_id,
                        step = %data.step_name,
                        retry_count = data.retry_count,
                        error = %data.error,
                        "compensation failed"
                    );
                }
                SagaEvent::CompensationStepCompleted(data) => {
                    tracing::info!(%saga_id, step = %data.step_name, "step compensated");
                }
                SagaEvent::SagaCompleted(data) => {
                    metrics::counter!("saga_completed_total", "saga_type" => saga_type.clone())
                        .increment(1);
                    record_duration(saga, data.completed_at);
                    tracing::info!(%saga_id, "saga completed");
                }
                SagaEvent::SagaCompensated(data) => {
                    metrics::counter!("saga_compensated_total", "saga_type" => saga_type.clone())
                        .increment(1);
                    record_duration(saga, data.completed_at);
                    tracing::info!(%saga_id, "saga compensated");
                }
                SagaEvent::SagaFailed(data) => {
                    metrics::counter!("saga_failed_total", "saga_type" => saga_type.clone())
                        .increment(1);
                    record_duration(saga, data.failed_at);
                    tracing::error!(
                        %saga_id,
                        reason = %data.reason,
                        failed_step = ?data.failed_step,
                        "saga failed, operator action required"
                    );
                }
                SagaEvent::SagaCancelled(data) => {
                    metrics::counter!("saga_cancelled_total", "saga_type" => saga_type.clone())
                        .increment(1);
                    tracing::info!(%saga_id, compensate = data.compensate, "saga cancelled");
                }
                SagaEvent::SagaRetried(_) => {
                    tracing::info!(%saga_id, "saga retried from the first step");
                }
            }
        }
    }

    /// Loads a saga, failing with `NotFound` if it does not exist.
    pub async fn get_saga(&self, saga_id: SagaId) -> Result<Saga> {
        Ok(self.store.load(saga_id).await?)
    }

    /// Returns a saga's status and per-step detail. Never mutates.
    pub async fn get_status(&self, saga_id: SagaId) -> Result<SagaDetail> {
        let saga = self.get_saga(saga_id).await?;
        Ok(SagaDetail::from(&saga))
    }

    /// Returns a saga's journal in order.
    pub async fn events(&self, saga_id: SagaId) -> Result<Vec<EventEnvelope>> {
        let events = self.store.events(saga_id).await?;
        if events.is_empty() {
            return Err(SagaError::NotFound(saga_id));
        }
        Ok(events)
    }

    pub async fn list(&self, query: SagaQuery) -> Result<Vec<Saga>> {
        Ok(self.store.list(query).await?)
    }

    /// Cancels a started saga.
    ///
    /// A step that is already running is allowed to finish. With
    /// `compensate`, completed steps are undone in the background.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(self: &Arc<Self>, saga_id: SagaId, options: CancelOptions) -> Result<Saga> {
        let Committed { saga, .. } = self
            .transition(saga_id, |s, now| s.cancel(now, options.compensate))
            .await?;

        if saga.status() == SagaStatus::Compensating {
            self.spawn_run(saga_id);
        }
        Ok(saga)
    }

    /// Restarts a failed or compensated saga from its first step.
    #[tracing::instrument(skip(self))]
    pub async fn retry(self: &Arc<Self>, saga_id: SagaId) -> Result<Saga> {
        let Committed { saga, .. } = self.transition(saga_id, |s, now| s.retry(now)).await?;
        self.spawn_run(saga_id);
        Ok(saga)
    }
}

fn record_duration(saga: &Saga, finished_at: DateTime<Utc>) {
    if let Some(started_at) = saga.started_at() {
        let seconds = (finished_at - started_at).num_milliseconds() as f64 / 1000.0;
        metrics::histogram!("saga_duration_seconds").record(seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_owned() {
        let drivers = Drivers::default();
        let saga_id = SagaId::new();

        let guard = drivers.acquire(saga_id).unwrap();
        assert!(drivers.is_driven(saga_id));
        assert!(drivers.acquire(saga_id).is_none());

        drop(guard);
        assert!(!drivers.is_driven(saga_id));
        assert!(drivers.acquire(saga_id).is_some());
    }

    #[test]
    fn start_requested_while_owned_keeps_the_driver() {
        let drivers = Drivers::default();
        let saga_id = SagaId::new();
        let mut guard = drivers.acquire(saga_id).unwrap();

        assert!(drivers.acquire(saga_id).is_none());
        assert!(guard.release_or_rerun());
        assert!(drivers.is_driven(saga_id));

        assert!(!guard.release_or_rerun());
        assert!(!drivers.is_driven(saga_id));

        // A later owner is not released by the old guard
        let _next = drivers.acquire(saga_id).unwrap();
        drop(guard);
        assert!(drivers.is_driven(saga_id));
    }
}
