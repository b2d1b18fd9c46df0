use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use domain::{Aggregate, Saga, SagaEvent};
use tokio::sync::RwLock;

use crate::{
    EventEnvelope, Result, SagaId, SagaQuery, StoreError, Version, store::SagaStore,
};

#[derive(Default)]
struct State {
    records: HashMap<SagaId, Saga>,
    journals: HashMap<SagaId, Vec<EventEnvelope>>,
    /// Creation order, for listing.
    order: Vec<SagaId>,
}

/// In-memory saga store for tests and single-process deployments.
///
/// One write lock covers the record and the journal, which gives the same
/// all-or-nothing commit the PostgreSQL store gets from a transaction.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    state: Arc<RwLock<State>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored sagas.
    pub async fn saga_count(&self) -> usize {
        self.state.read().await.records.len()
    }

    /// Returns the total number of journal entries across all sagas.
    pub async fn event_count(&self) -> usize {
        self.state.read().await.journals.values().map(Vec::len).sum()
    }

    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.records.clear();
        state.journals.clear();
        state.order.clear();
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn create(&self, saga: &Saga, events: &[SagaEvent]) -> Result<Version> {
        let saga_id = saga.id();
        if events.is_empty() {
            return Err(StoreError::EmptyCommit(saga_id));
        }

        let mut state = self.state.write().await;
        if state.records.contains_key(&saga_id) {
            return Err(StoreError::AlreadyExists(saga_id));
        }

        let envelopes = EventEnvelope::record_all(saga_id, Version::initial(), events, Utc::now())?;
        let version = Version::initial().advance(events.len());
        let mut record = saga.clone();
        record.set_version(version);

        state.records.insert(saga_id, record);
        state.journals.insert(saga_id, envelopes);
        state.order.push(saga_id);
        Ok(version)
    }

    async fn commit(
        &self,
        saga: &Saga,
        events: &[SagaEvent],
        expected: Version,
    ) -> Result<Version> {
        let saga_id = saga.id();
        if events.is_empty() {
            return Err(StoreError::EmptyCommit(saga_id));
        }

        let mut state = self.state.write().await;
        let actual = state
            .records
            .get(&saga_id)
            .map(|record| record.version())
            .ok_or(StoreError::NotFound(saga_id))?;
        if actual != expected {
            return Err(StoreError::ConcurrencyConflict {
                saga_id,
                expected,
                actual,
            });
        }

        let envelopes = EventEnvelope::record_all(saga_id, expected, events, Utc::now())?;
        let version = expected.advance(events.len());
        let mut record = saga.clone();
        record.set_version(version);

        state.records.insert(saga_id, record);
        state.journals.entry(saga_id).or_default().extend(envelopes);
        Ok(version)
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<Saga>> {
        Ok(self.state.read().await.records.get(&saga_id).cloned())
    }

    async fn events(&self, saga_id: SagaId) -> Result<Vec<EventEnvelope>> {
        Ok(self
            .state
            .read()
            .await
            .journals
            .get(&saga_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list(&self, query: SagaQuery) -> Result<Vec<Saga>> {
        let state = self.state.read().await;
        let matching = state
            .order
            .iter()
            .filter_map(|id| state.records.get(id))
            .filter(|saga| query.matches(saga))
            .skip(query.offset.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(matching)
    }
}
