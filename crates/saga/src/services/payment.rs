//! Payment service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::ServiceError;

/// A charge held by the payment service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: String,
    pub user_id: String,
    pub amount_cents: i64,
    pub refunded: bool,
}

/// Payment processing operations.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Charges a user; returns the payment id.
    async fn charge(&self, user_id: &str, amount_cents: i64) -> Result<String, ServiceError>;

    /// Refunds a payment. Refunding twice succeeds.
    async fn refund(&self, payment_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<String, Payment>,
    next_id: u32,
    decline: Option<String>,
}

/// In-memory payment service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declines every charge with `reason` until cleared with `None`.
    pub fn set_decline(&self, reason: Option<&str>) {
        self.write().decline = reason.map(str::to_string);
    }

    pub fn payment(&self, payment_id: &str) -> Option<Payment> {
        self.read().payments.get(payment_id).cloned()
    }

    /// Payments that have not been refunded.
    pub fn active_payments(&self) -> usize {
        self.read()
            .payments
            .values()
            .filter(|payment| !payment.refunded)
            .count()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryPaymentState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryPaymentState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn charge(&self, user_id: &str, amount_cents: i64) -> Result<String, ServiceError> {
        let mut state = self.write();

        if let Some(reason) = &state.decline {
            return Err(ServiceError::PaymentDeclined(reason.clone()));
        }
        if amount_cents <= 0 {
            return Err(ServiceError::PaymentDeclined(format!(
                "invalid amount {amount_cents}"
            )));
        }

        state.next_id += 1;
        let payment_id = format!("PAY-{:04}", state.next_id);
        state.payments.insert(
            payment_id.clone(),
            Payment {
                payment_id: payment_id.clone(),
                user_id: user_id.to_string(),
                amount_cents,
                refunded: false,
            },
        );
        Ok(payment_id)
    }

    async fn refund(&self, payment_id: &str) -> Result<(), ServiceError> {
        let mut state = self.write();
        let payment = state
            .payments
            .get_mut(payment_id)
            .ok_or_else(|| ServiceError::UnknownPayment(payment_id.to_string()))?;
        payment.refunded = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_charge_and_refund() {
        let service = InMemoryPaymentService::new();

        let payment_id = service.charge("u-1", 5000).await.unwrap();
        assert_eq!(payment_id, "PAY-0001");
        assert_eq!(service.active_payments(), 1);

        service.refund(&payment_id).await.unwrap();
        service.refund(&payment_id).await.unwrap();
        assert_eq!(service.active_payments(), 0);
        assert!(service.payment(&payment_id).unwrap().refunded);
    }

    #[tokio::test]
    async fn test_decline() {
        let service = InMemoryPaymentService::new();
        service.set_decline(Some("card expired"));

        let err = service.charge("u-1", 5000).await.unwrap_err();
        assert_eq!(err, ServiceError::PaymentDeclined("card expired".into()));
        assert_eq!(service.active_payments(), 0);

        service.set_decline(None);
        assert!(service.charge("u-1", 5000).await.is_ok());
    }

    #[tokio::test]
    async fn test_refund_unknown_payment() {
        let service = InMemoryPaymentService::new();
        let err = service.refund("PAY-0042").await.unwrap_err();
        assert_eq!(err, ServiceError::UnknownPayment("PAY-0042".into()));
    }
}
