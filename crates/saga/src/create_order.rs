//! The `create_order` saga.
//!
//! Reserves inventory, charges the user, then sends a confirmation. The
//! reservation and the charge have compensations; a sent notification is
//! not undone. Every action goes through a [`Faulty`] wrapper so tests can
//! script failures without touching the services.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::action::{
    ActionError, CompensatingAction, CompensationContext, ForwardAction, StepContext,
};
use crate::error::Result;
use crate::fault::{FaultInjector, Faulty};
use crate::registry::{ActionCatalog, Registry, SagaTypeConfig, StepConfig};
use crate::services::{
    InMemoryInventoryService, InMemoryNotificationService, InMemoryPaymentService,
    InMemoryUserService, InventoryService, NotificationService, PaymentService, ReservationItem,
    UserService,
};

pub const SAGA_TYPE: &str = "create_order";

pub const STEP_RESERVE_INVENTORY: &str = "reserve_inventory";
pub const STEP_CHARGE_PAYMENT: &str = "charge_payment";
pub const STEP_SEND_NOTIFICATION: &str = "send_notification";

/// Catalog name of the inventory compensation.
pub const ACTION_RELEASE_INVENTORY: &str = "release_inventory";
/// Catalog name of the payment compensation.
pub const ACTION_REFUND_PAYMENT: &str = "refund_payment";

/// The saga input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub user_id: String,
    pub items: Vec<ReservationItem>,
    pub amount_cents: i64,
}

impl OrderRequest {
    fn from_data(data: &Value) -> std::result::Result<Self, ActionError> {
        serde_json::from_value(data.clone())
            .map_err(|e| ActionError::permanent(format!("invalid order request: {e}")))
    }
}

/// Reads a string field from an earlier step's result.
fn result_field<'a>(
    result: Option<&'a Value>,
    field: &str,
) -> std::result::Result<&'a str, ActionError> {
    result
        .and_then(|value| value.get(field))
        .and_then(Value::as_str)
        .ok_or_else(|| ActionError::permanent(format!("missing {field} in step result")))
}

pub struct ReserveInventory {
    inventory: Arc<dyn InventoryService>,
}

#[async_trait]
impl ForwardAction for ReserveInventory {
    async fn execute(&self, ctx: &StepContext) -> std::result::Result<Value, ActionError> {
        let order = OrderRequest::from_data(&ctx.data)?;
        let reservation_id = self.inventory.reserve(&order.items).await?;
        Ok(json!({ "reservation_id": reservation_id }))
    }
}

pub struct ReleaseInventory {
    inventory: Arc<dyn InventoryService>,
}

#[async_trait]
impl CompensatingAction for ReleaseInventory {
    async fn compensate(&self, ctx: &CompensationContext) -> std::result::Result<(), ActionError> {
        let reservation_id = result_field(Some(&ctx.result), "reservation_id")?;
        self.inventory.release(reservation_id).await?;
        Ok(())
    }
}

/// Validates the user, then charges them.
pub struct ChargePayment {
    users: Arc<dyn UserService>,
    payments: Arc<dyn PaymentService>,
}

#[async_trait]
impl ForwardAction for ChargePayment {
    async fn execute(&self, ctx: &StepContext) -> std::result::Result<Value, ActionError> {
        let order = OrderRequest::from_data(&ctx.data)?;
        let reservation_id = result_field(ctx.prior(STEP_RESERVE_INVENTORY), "reservation_id")?;

        self.users.validate(&order.user_id).await?;
        let payment_id = self
            .payments
            .charge(&order.user_id, order.amount_cents)
            .await?;
        Ok(json!({
            "payment_id": payment_id,
            "reservation_id": reservation_id,
            "amount_cents": order.amount_cents,
        }))
    }
}

pub struct RefundPayment {
    payments: Arc<dyn PaymentService>,
}

#[async_trait]
impl CompensatingAction for RefundPayment {
    async fn compensate(&self, ctx: &CompensationContext) -> std::result::Result<(), ActionError> {
        let payment_id = result_field(Some(&ctx.result), "payment_id")?;
        self.payments.refund(payment_id).await?;
        Ok(())
    }
}

pub struct SendNotification {
    notifications: Arc<dyn NotificationService>,
}

#[async_trait]
impl ForwardAction for SendNotification {
    async fn execute(&self, ctx: &StepContext) -> std::result::Result<Value, ActionError> {
        let order = OrderRequest::from_data(&ctx.data)?;
        let payment_id = result_field(ctx.prior(STEP_CHARGE_PAYMENT), "payment_id")?;

        let message = format!("Order confirmed, payment {payment_id}");
        self.notifications.send(&order.user_id, &message).await?;
        Ok(json!({ "notified": order.user_id }))
    }
}

/// The collaborators behind the order actions.
#[derive(Debug, Clone, Default)]
pub struct OrderServices {
    pub users: InMemoryUserService,
    pub inventory: InMemoryInventoryService,
    pub payments: InMemoryPaymentService,
    pub notifications: InMemoryNotificationService,
}

impl OrderServices {
    pub fn new() -> Self {
        Self::default()
    }
}

/// One fault script per action.
#[derive(Debug, Clone, Default)]
pub struct OrderFaults {
    pub reserve_inventory: FaultInjector,
    pub release_inventory: FaultInjector,
    pub charge_payment: FaultInjector,
    pub refund_payment: FaultInjector,
    pub send_notification: FaultInjector,
}

/// Actions of the order saga, registered under their step names.
pub fn catalog(services: &OrderServices, faults: &OrderFaults) -> ActionCatalog {
    let inventory: Arc<dyn InventoryService> = Arc::new(services.inventory.clone());
    let payments: Arc<dyn PaymentService> = Arc::new(services.payments.clone());
    let users: Arc<dyn UserService> = Arc::new(services.users.clone());
    let notifications: Arc<dyn NotificationService> = Arc::new(services.notifications.clone());

    ActionCatalog::new()
        .with_forward(
            STEP_RESERVE_INVENTORY,
            Arc::new(Faulty::new(
                ReserveInventory {
                    inventory: inventory.clone(),
                },
                faults.reserve_inventory.clone(),
            )),
        )
        .with_compensation(
            ACTION_RELEASE_INVENTORY,
            Arc::new(Faulty::new(
                ReleaseInventory { inventory },
                faults.release_inventory.clone(),
            )),
        )
        .with_forward(
            STEP_CHARGE_PAYMENT,
            Arc::new(Faulty::new(
                ChargePayment {
                    users,
                    payments: payments.clone(),
                },
                faults.charge_payment.clone(),
            )),
        )
        .with_compensation(
            ACTION_REFUND_PAYMENT,
            Arc::new(Faulty::new(
                RefundPayment { payments },
                faults.refund_payment.clone(),
            )),
        )
        .with_forward(
            STEP_SEND_NOTIFICATION,
            Arc::new(Faulty::new(
                SendNotification { notifications },
                faults.send_notification.clone(),
            )),
        )
}

/// The built-in step list. A charge is not repeated after a timeout.
pub fn definition() -> SagaTypeConfig {
    SagaTypeConfig {
        saga_type: SAGA_TYPE.to_string(),
        steps: vec![
            StepConfig {
                name: STEP_RESERVE_INVENTORY.to_string(),
                forward: STEP_RESERVE_INVENTORY.to_string(),
                compensate: Some(ACTION_RELEASE_INVENTORY.to_string()),
                timeout_seconds: 30,
                max_retries: 3,
                idempotent: true,
            },
            StepConfig {
                name: STEP_CHARGE_PAYMENT.to_string(),
                forward: STEP_CHARGE_PAYMENT.to_string(),
                compensate: Some(ACTION_REFUND_PAYMENT.to_string()),
                timeout_seconds: 30,
                max_retries: 3,
                idempotent: false,
            },
            StepConfig {
                name: STEP_SEND_NOTIFICATION.to_string(),
                forward: STEP_SEND_NOTIFICATION.to_string(),
                compensate: None,
                timeout_seconds: 10,
                max_retries: 3,
                idempotent: true,
            },
        ],
    }
}

/// A registry holding only the built-in `create_order` saga.
pub fn registry(services: &OrderServices, faults: &OrderFaults) -> Result<Registry> {
    Registry::from_config(vec![definition()], &catalog(services, faults))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::ManualClock;
    use domain::{SagaStatus, StepStatus};
    use saga_store::InMemorySagaStore;

    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::orchestrator::Orchestrator;

    fn setup() -> (Orchestrator<InMemorySagaStore>, OrderServices, OrderFaults) {
        let services = OrderServices::new();
        services.users.register("u-1");
        services.inventory.add_stock("SKU-001", 10);
        let faults = OrderFaults::default();

        let orchestrator = Orchestrator::new(
            InMemorySagaStore::new(),
            Arc::new(registry(&services, &faults).unwrap()),
            Arc::new(ManualClock::default()),
            OrchestratorConfig::default(),
        );
        (orchestrator, services, faults)
    }

    fn order(user_id: &str) -> Value {
        json!({
            "user_id": user_id,
            "items": [{ "sku": "SKU-001", "quantity": 2 }],
            "amount_cents": 4999,
        })
    }

    #[tokio::test]
    async fn order_completes_and_passes_ids_forward() {
        let (orchestrator, services, _) = setup();

        let saga = orchestrator
            .execute_saga(SAGA_TYPE, order("u-1"))
            .await
            .unwrap();

        assert_eq!(saga.status(), SagaStatus::Completed);
        assert_eq!(saga.current_step(), 3);
        let charge = saga.step(1).unwrap().result().unwrap();
        assert_eq!(charge["reservation_id"], "RES-0001");
        assert_eq!(charge["payment_id"], "PAY-0001");
        assert_eq!(services.inventory.available("SKU-001"), 8);
        assert_eq!(services.payments.active_payments(), 1);
        assert_eq!(services.notifications.sent().len(), 1);
    }

    #[tokio::test]
    async fn blocked_user_releases_inventory() {
        let (orchestrator, services, _) = setup();
        services.users.block("u-1");

        let saga = orchestrator
            .execute_saga(SAGA_TYPE, order("u-1"))
            .await
            .unwrap();

        assert_eq!(saga.status(), SagaStatus::Compensated);
        assert_eq!(saga.failed_step(), Some(STEP_CHARGE_PAYMENT));
        assert!(saga.steps()[0].was_compensated());
        assert_eq!(saga.steps()[2].status(), StepStatus::Pending);
        assert_eq!(services.inventory.available("SKU-001"), 10);
        assert_eq!(services.inventory.reservation_count(), 0);
        assert!(services.notifications.sent().is_empty());
    }

    #[tokio::test]
    async fn failed_notification_refunds_and_releases() {
        let (orchestrator, services, faults) = setup();
        faults.send_notification.fail_always(false);

        let saga = orchestrator
            .execute_saga(SAGA_TYPE, order("u-1"))
            .await
            .unwrap();

        assert_eq!(saga.status(), SagaStatus::Compensated);
        assert!(services.payments.payment("PAY-0001").unwrap().refunded);
        assert_eq!(services.inventory.available("SKU-001"), 10);
        assert_eq!(faults.send_notification.calls(), 1);
    }

    #[tokio::test]
    async fn malformed_order_fails_first_step_without_compensation() {
        let (orchestrator, services, _) = setup();

        let saga = orchestrator
            .execute_saga(SAGA_TYPE, json!({ "user_id": "u-1" }))
            .await
            .unwrap();

        assert_eq!(saga.status(), SagaStatus::Compensated);
        assert!(saga.error().unwrap().contains("invalid order request"));
        assert_eq!(services.inventory.reservation_count(), 0);
    }

    #[test]
    fn definition_marks_charge_non_idempotent() {
        let config = definition();
        let charge = config
            .steps
            .iter()
            .find(|step| step.name == STEP_CHARGE_PAYMENT)
            .unwrap();
        assert!(!charge.idempotent);
        assert_eq!(config.steps.len(), 3);
    }
}
