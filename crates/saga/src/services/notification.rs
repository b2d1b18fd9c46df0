//! Notification service trait and in-memory implementation.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::ServiceError;

/// A message delivered to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: String,
    pub message: String,
}

#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn send(&self, user_id: &str, message: &str) -> Result<(), ServiceError>;
}

/// In-memory notification service that records what it sent.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationService {
    sent: Arc<RwLock<Vec<Notification>>>,
}

impl InMemoryNotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl NotificationService for InMemoryNotificationService {
    async fn send(&self, user_id: &str, message: &str) -> Result<(), ServiceError> {
        self.sent
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Notification {
                user_id: user_id.to_string(),
                message: message.to_string(),
            });
        Ok(())
    }
}
