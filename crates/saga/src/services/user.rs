//! User service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use super::ServiceError;

/// Looks up whether a user may place orders.
#[async_trait]
pub trait UserService: Send + Sync {
    /// Fails unless the user exists and is not blocked.
    async fn validate(&self, user_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryUserState {
    /// User id to blocked flag.
    users: HashMap<String, bool>,
}

/// In-memory user service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryUserService {
    state: Arc<RwLock<InMemoryUserState>>,
}

impl InMemoryUserService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user_id: impl Into<String>) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .users
            .insert(user_id.into(), false);
    }

    pub fn block(&self, user_id: &str) {
        if let Some(blocked) = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .users
            .get_mut(user_id)
        {
            *blocked = true;
        }
    }
}

#[async_trait]
impl UserService for InMemoryUserService {
    async fn validate(&self, user_id: &str) -> Result<(), ServiceError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match state.users.get(user_id) {
            None => Err(ServiceError::UserNotFound(user_id.to_string())),
            Some(true) => Err(ServiceError::UserBlocked(user_id.to_string())),
            Some(false) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn validates_registered_users() {
        let service = InMemoryUserService::new();
        service.register("u-1");

        assert!(service.validate("u-1").await.is_ok());
        assert_eq!(
            service.validate("u-2").await,
            Err(ServiceError::UserNotFound("u-2".into()))
        );

        service.block("u-1");
        assert_eq!(
            service.validate("u-1").await,
            Err(ServiceError::UserBlocked("u-1".into()))
        );
    }
}
