//! The interface business actions implement.
//!
//! A step has a forward action and optionally a compensating action. Both
//! are opaque to the orchestrator: it only sees their JSON results and
//! whether a failure is worth retrying.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use common::SagaId;
use serde_json::Value;
use thiserror::Error;

/// A failure reported by an action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ActionError {
    pub message: String,
    /// Whether another attempt may succeed.
    pub retryable: bool,
}

impl ActionError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// What a forward action sees.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub saga_id: SagaId,
    pub step_name: String,
    /// The saga's input payload.
    pub data: Value,
    /// Results of the steps completed before this one, in order.
    pub prior_results: Vec<(String, Value)>,
}

impl StepContext {
    /// Returns the result of an earlier step by name.
    pub fn prior(&self, step_name: &str) -> Option<&Value> {
        self.prior_results
            .iter()
            .find(|(name, _)| name == step_name)
            .map(|(_, result)| result)
    }
}

/// What a compensating action sees.
#[derive(Debug, Clone)]
pub struct CompensationContext {
    pub saga_id: SagaId,
    pub step_name: String,
    pub data: Value,
    /// The result the forward action returned.
    pub result: Value,
}

/// The forward half of a step.
#[async_trait]
pub trait ForwardAction: Send + Sync {
    async fn execute(&self, ctx: &StepContext) -> Result<Value, ActionError>;
}

/// Undoes a completed step's effect.
#[async_trait]
pub trait CompensatingAction: Send + Sync {
    async fn compensate(&self, ctx: &CompensationContext) -> Result<(), ActionError>;
}

#[async_trait]
impl<T: ForwardAction + ?Sized> ForwardAction for Arc<T> {
    async fn execute(&self, ctx: &StepContext) -> Result<Value, ActionError> {
        (**self).execute(ctx).await
    }
}

#[async_trait]
impl<T: CompensatingAction + ?Sized> CompensatingAction for Arc<T> {
    async fn compensate(&self, ctx: &CompensationContext) -> Result<(), ActionError> {
        (**self).compensate(ctx).await
    }
}

struct ForwardFn<F>(F);

#[async_trait]
impl<F, Fut> ForwardAction for ForwardFn<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ActionError>> + Send,
{
    async fn execute(&self, ctx: &StepContext) -> Result<Value, ActionError> {
        (self.0)(ctx.clone()).await
    }
}

struct CompensateFn<F>(F);

#[async_trait]
impl<F, Fut> CompensatingAction for CompensateFn<F>
where
    F: Fn(CompensationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ActionError>> + Send,
{
    async fn compensate(&self, ctx: &CompensationContext) -> Result<(), ActionError> {
        (self.0)(ctx.clone()).await
    }
}

/// Wraps an async closure as a forward action.
pub fn forward_fn<F, Fut>(f: F) -> Arc<dyn ForwardAction>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ActionError>> + Send + 'static,
{
    Arc::new(ForwardFn(f))
}

/// Wraps an async closure as a compensating action.
pub fn compensate_fn<F, Fut>(f: F) -> Arc<dyn CompensatingAction>
where
    F: Fn(CompensationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
{
    Arc::new(CompensateFn(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closures_adapt_to_actions() {
        let forward = forward_fn(|ctx: StepContext| async move {
            let reservation = ctx
                .prior("reserve_inventory")
                .cloned()
                .ok_or_else(|| ActionError::permanent("missing reservation"))?;
            Ok::<_, ActionError>(serde_json::json!({ "charged_for": reservation }))
        });

        let ctx = StepContext {
            saga_id: SagaId::new(),
            step_name: "charge_payment".into(),
            data: serde_json::json!({}),
            prior_results: vec![("reserve_inventory".into(), serde_json::json!("RES-0001"))],
        };
        let result = forward.execute(&ctx).await.unwrap();
        assert_eq!(result["charged_for"], "RES-0001");

        let empty = StepContext {
            prior_results: vec![],
            ..ctx
        };
        let err = forward.execute(&empty).await.unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.to_string(), "missing reservation");
    }

    #[tokio::test]
    async fn compensate_closure_sees_forward_result() {
        let compensate = compensate_fn(|ctx: CompensationContext| async move {
            if ctx.result["reservation_id"] == "RES-0001" {
                Ok(())
            } else {
                Err(ActionError::retryable("unknown reservation"))
            }
        });

        let ctx = CompensationContext {
            saga_id: SagaId::new(),
            step_name: "reserve_inventory".into(),
            data: serde_json::Value::Null,
            result: serde_json::json!({"reservation_id": "RES-0001"}),
        };
        assert!(compensate.compensate(&ctx).await.is_ok());
    }
}
