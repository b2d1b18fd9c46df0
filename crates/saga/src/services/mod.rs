//! In-memory collaborators for the demo `create_order` saga.
//!
//! Each service is a trait plus an in-memory implementation that keeps its
//! state behind an `Arc<RwLock<_>>`, so clones share state and tests can
//! inspect what the saga did.

pub mod inventory;
pub mod notification;
pub mod payment;
pub mod user;

use thiserror::Error;

use crate::action::ActionError;

pub use inventory::{InMemoryInventoryService, InventoryService, ReservationItem};
pub use notification::{InMemoryNotificationService, Notification, NotificationService};
pub use payment::{InMemoryPaymentService, Payment, PaymentService};
pub use user::{InMemoryUserService, UserService};

/// Errors from the demo services.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("User {0} not found")]
    UserNotFound(String),

    #[error("User {0} is blocked")]
    UserBlocked(String),

    #[error("Insufficient stock for {sku}: requested {requested}, available {available}")]
    InsufficientStock {
        sku: String,
        requested: u32,
        available: u32,
    },

    #[error("Payment declined: {0}")]
    PaymentDeclined(String),

    #[error("Unknown payment {0}")]
    UnknownPayment(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl From<ServiceError> for ActionError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(_) => ActionError::retryable(err.to_string()),
            _ => ActionError::permanent(err.to_string()),
        }
    }
}
