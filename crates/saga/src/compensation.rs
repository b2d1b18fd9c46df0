//! Compensation runner.
//!
//! Undoes completed steps strictly in reverse order, one at a time. A
//! failing compensation is retried with the forward backoff policy up to
//! the step's `max_retries`; after that the saga is frozen in `failed`
//! instead of moving on to older steps. The time of the next attempt is
//! stored on the step, so a resumed driver keeps the backoff.

use std::time::Duration;

use common::SagaId;
use common::clock::until;
use domain::{Aggregate, Saga};
use saga_store::SagaStore;

use crate::action::{ActionError, CompensationContext};
use crate::error::{Result, SagaError};
use crate::orchestrator::{Orchestrator, Progress};

impl<S: SagaStore + 'static> Orchestrator<S> {
    /// One compensation iteration for a saga in `compensating`.
    pub(crate) async fn compensate_next(&self, saga: &Saga) -> Result<Progress> {
        let saga_id = saga.id();
        let now = self.clock.now();

        // A forward attempt is still outstanding; its outcome must be known
        // before anything older is undone.
        if let Some((index, step)) = saga.running_step() {
            if step.is_timed_out(now) {
                self.fail_timed_out_step(saga_id, index, step.definition())
                    .await?;
                return Ok(Progress::Continue);
            }
            return Ok(Progress::Wait(
                step.timeout_at().map_or(Duration::ZERO, |at| until(now, at)),
            ));
        }

        let Some(index) = saga.next_compensation() else {
            self.try_transition(saga_id, |s, now| s.finish_compensation(now))
                .await?;
            return Ok(Progress::Continue);
        };

        let step = &saga.steps()[index];
        if let Some(scheduled_at) = step.scheduled_at()
            && scheduled_at > now
        {
            return Ok(Progress::Wait(until(now, scheduled_at)));
        }
        let definition = step.definition();
        let previous_failures = step.compensation_retry_count();

        let action = self
            .registry
            .step(saga.saga_type(), &definition.name)
            .and_then(|spec| spec.compensate.clone());
        let Some(action) = action else {
            let message = format!(
                "no compensating action registered for step '{}'",
                definition.name
            );
            self.freeze(saga_id, index, &definition.name, message, previous_failures)
                .await?;
            return Ok(Progress::Continue);
        };

        let ctx = CompensationContext {
            saga_id,
            step_name: definition.name.clone(),
            data: saga.data().clone(),
            result: step.result().cloned().unwrap_or_default(),
        };
        tracing::info!(
            %saga_id,
            step = %definition.name,
            attempt = previous_failures + 1,
            "compensating step"
        );

        let outcome = match tokio::time::timeout(definition.timeout, action.compensate(&ctx)).await
        {
            Ok(result) => result,
            Err(_) => {
                metrics::counter!("saga_step_timeouts_total").increment(1);
                Err(ActionError::retryable(
                    SagaError::StepTimeout {
                        step: definition.name.clone(),
                        timeout: definition.timeout,
                    }
                    .to_string(),
                ))
            }
        };

        match outcome {
            Ok(()) => {
                self.try_transition(saga_id, |s, now| s.complete_compensation_step(index, now))
                    .await?;
                Ok(Progress::Continue)
            }
            Err(e) if e.retryable && previous_failures < definition.max_retries => {
                let retry = self.config.retry;
                self.try_transition(saga_id, |s, now| {
                    s.fail_compensation_step(index, &e.message, |n| retry.delay_for(n), now)
                })
                .await?;
                Ok(Progress::Continue)
            }
            Err(e) => {
                self.freeze(saga_id, index, &definition.name, e.message, previous_failures + 1)
                    .await?;
                Ok(Progress::Continue)
            }
        }
    }

    /// Fails the saga on a compensation it cannot confirm.
    async fn freeze(
        &self,
        saga_id: SagaId,
        index: usize,
        step_name: &str,
        message: String,
        attempts: u32,
    ) -> Result<()> {
        let reason = SagaError::CompensationExhausted {
            step: step_name.to_string(),
            attempts,
            message: message.clone(),
        }
        .to_string();

        self.try_transition(saga_id, |s, now| {
            s.freeze(index, &message, reason.clone(), now)
        })
        .await?;
        Ok(())
    }
}
