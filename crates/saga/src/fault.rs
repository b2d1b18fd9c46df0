//! Scripted fault injection for actions.
//!
//! Wrap any action in [`Faulty`] and script its behavior through the
//! shared [`FaultInjector`]: fail the next few calls, fail every call, or
//! delay each call.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::action::{
    ActionError, CompensatingAction, CompensationContext, ForwardAction, StepContext,
};

#[derive(Debug, Default)]
struct FaultState {
    /// Failures left to inject; `None` fails forever.
    failures: Option<Option<u32>>,
    retryable: bool,
    message: String,
    delay: Option<Duration>,
    calls: u32,
}

/// Script of faults shared between a test and the actions it wraps.
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    state: Arc<Mutex<FaultState>>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `times` calls.
    pub fn fail_times(&self, times: u32, retryable: bool) -> &Self {
        self.script(Some(times), retryable)
    }

    /// Fails every call until cleared.
    pub fn fail_always(&self, retryable: bool) -> &Self {
        self.script(None, retryable)
    }

    /// Uses `message` for injected failures.
    pub fn with_message(&self, message: impl Into<String>) -> &Self {
        self.lock().message = message.into();
        self
    }

    /// Delays every call by `delay` before it runs.
    pub fn delay(&self, delay: Duration) -> &Self {
        self.lock().delay = Some(delay);
        self
    }

    /// Removes all scripted faults. The call count is kept.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.failures = None;
        state.delay = None;
    }

    /// Number of calls made through the wrapped actions.
    pub fn calls(&self) -> u32 {
        self.lock().calls
    }

    fn script(&self, failures: Option<u32>, retryable: bool) -> &Self {
        let mut state = self.lock();
        state.failures = Some(failures);
        state.retryable = retryable;
        if state.message.is_empty() {
            state.message = "injected failure".to_string();
        }
        drop(state);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts the call, applies the delay, and decides whether it fails.
    async fn before_call(&self) -> Result<(), ActionError> {
        let (delay, failure) = {
            let mut state = self.lock();
            state.calls += 1;
            let failure = match state.failures {
                Some(None) => true,
                Some(Some(left)) if left > 0 => {
                    state.failures = Some(Some(left - 1));
                    true
                }
                _ => false,
            };
            let failure = failure.then(|| ActionError {
                message: state.message.clone(),
                retryable: state.retryable,
            });
            (state.delay, failure)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        failure.map_or(Ok(()), Err)
    }
}

/// An action with scripted faults in front of it.
pub struct Faulty<A> {
    inner: A,
    faults: FaultInjector,
}

impl<A> Faulty<A> {
    pub fn new(inner: A, faults: FaultInjector) -> Self {
        Self { inner, faults }
    }
}

#[async_trait]
impl<A: ForwardAction> ForwardAction for Faulty<A> {
    async fn execute(&self, ctx: &StepContext) -> Result<Value, ActionError> {
        self.faults.before_call().await?;
        self.inner.execute(ctx).await
    }
}

#[async_trait]
impl<A: CompensatingAction> CompensatingAction for Faulty<A> {
    async fn compensate(&self, ctx: &CompensationContext) -> Result<(), ActionError> {
        self.faults.before_call().await?;
        self.inner.compensate(ctx).await
    }
}
