//! Recovery of sagas nobody is driving.
//!
//! After a crash, sagas can be left with a step marked `running`, a retry
//! whose backoff has elapsed, or a half-finished compensation whose next
//! attempt is due. A periodic
//! sweep finds them, reclassifies steps stuck past their deadline as timed
//! out, and hands the sagas back to a driver loop.

use std::sync::Arc;
use std::time::Duration;

use common::SagaId;
use domain::{Aggregate, SagaStatus};
use saga_store::{SagaQuery, SagaStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::orchestrator::Orchestrator;

/// What one sweep found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Running steps past their deadline that were marked timed out.
    pub timed_out_steps: usize,
    /// Started sagas past their overall deadline moved to compensation.
    pub expired_sagas: usize,
    /// Active sagas skipped because a loop in this process drives them.
    pub skipped_driven: usize,
    /// Sagas that need a driver loop.
    pub resumable: Vec<SagaId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.timed_out_steps == 0 && self.expired_sagas == 0 && self.resumable.is_empty()
    }
}

impl<S: SagaStore + 'static> Orchestrator<S> {
    /// Finds active sagas without a driver and repairs what a crash left
    /// behind. Does not start any driver loops.
    #[tracing::instrument(skip(self))]
    pub async fn recover_stuck(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for saga in self.store.list(SagaQuery::active()).await? {
            let saga_id = saga.id();
            if self.drivers.is_driven(saga_id) {
                report.skipped_driven += 1;
                continue;
            }

            if let Some((index, step)) = saga.running_step() {
                if !step.is_timed_out(now) {
                    continue;
                }
                tracing::warn!(%saga_id, step = step.name(), "step stuck past its deadline");
                if self
                    .fail_timed_out_step(saga_id, index, step.definition())
                    .await?
                {
                    report.timed_out_steps += 1;
                    metrics::counter!("saga_stuck_steps_recovered_total").increment(1);
                }
                report.resumable.push(saga_id);
                continue;
            }

            match saga.status() {
                SagaStatus::Started if saga.is_expired(now) => {
                    let expired = self
                        .try_transition(saga_id, |s, now| s.expire(now))
                        .await?
                        .is_some_and(|committed| !committed.events.is_empty());
                    if expired {
                        report.expired_sagas += 1;
                    }
                    report.resumable.push(saga_id);
                }
                SagaStatus::Started => {
                    let due = saga
                        .step(saga.current_step())
                        .is_some_and(|step| step.is_due(now));
                    if due {
                        report.resumable.push(saga_id);
                    }
                }
                SagaStatus::Compensating => {
                    let due = saga
                        .next_compensation()
                        .is_none_or(|index| saga.steps()[index].is_compensation_due(now));
                    if due {
                        report.resumable.push(saga_id);
                    }
                }
                _ => {}
            }
        }

        Ok(report)
    }

    /// Runs one recovery pass and starts a driver for every resumable saga.
    pub async fn sweep(self: &Arc<Self>) -> Result<SweepReport> {
        let report = self.recover_stuck().await?;
        for saga_id in &report.resumable {
            self.spawn_run(*saga_id);
        }
        if !report.is_empty() {
            tracing::info!(
                timed_out_steps = report.timed_out_steps,
                expired_sagas = report.expired_sagas,
                resumed = report.resumable.len(),
                "sweep recovered sagas"
            );
        }
        Ok(report)
    }

    /// Sweeps every `interval` until `shutdown` changes.
    ///
    /// The first sweep runs immediately, which resumes whatever a previous
    /// process left unfinished.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            tracing::warn!(error = %e, "sweep failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        tracing::info!("sweeper stopping");
                        break;
                    }
                }
            }
        })
    }
}
