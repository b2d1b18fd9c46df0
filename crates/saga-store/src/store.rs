use async_trait::async_trait;
use domain::{Saga, SagaEvent};

use crate::{EventEnvelope, Result, SagaId, SagaQuery, StoreError, Version};

/// Storage for saga records and their journals.
///
/// Implementations must write the record and its events atomically: a
/// reader sees either the state before a transition or the state after it,
/// never a mix.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Stores a new saga together with its creation events.
    ///
    /// Fails with `AlreadyExists` if the ID is taken. Returns the version of
    /// the stored record.
    async fn create(&self, saga: &Saga, events: &[SagaEvent]) -> Result<Version>;

    /// Replaces a saga's record and appends the events that produced it.
    ///
    /// Fails with `ConcurrencyConflict` unless the stored version equals
    /// `expected`. Returns the new version.
    async fn commit(&self, saga: &Saga, events: &[SagaEvent], expected: Version)
    -> Result<Version>;

    /// Returns the current record for a saga.
    async fn get(&self, saga_id: SagaId) -> Result<Option<Saga>>;

    /// Returns a saga's journal in version order.
    async fn events(&self, saga_id: SagaId) -> Result<Vec<EventEnvelope>>;

    /// Lists sagas matching a query, oldest first.
    async fn list(&self, query: SagaQuery) -> Result<Vec<Saga>>;
}

/// Convenience methods on top of [`SagaStore`].
#[async_trait]
pub trait SagaStoreExt: SagaStore {
    /// Loads a saga, failing with `NotFound` if it does not exist.
    async fn load(&self, saga_id: SagaId) -> Result<Saga> {
        self.get(saga_id)
            .await?
            .ok_or(StoreError::NotFound(saga_id))
    }

    /// Rebuilds a saga from its journal instead of its stored record.
    async fn replay(&self, saga_id: SagaId) -> Result<Saga> {
        let envelopes = self.events(saga_id).await?;
        if envelopes.is_empty() {
            return Err(StoreError::NotFound(saga_id));
        }
        let events = envelopes
            .iter()
            .map(EventEnvelope::decode)
            .collect::<Result<Vec<_>>>()?;
        Ok(Saga::from_events(events)?)
    }
}

impl<T: SagaStore + ?Sized> SagaStoreExt for T {}
