use domain::{Saga, SagaStatus};

/// Filter for listing sagas.
#[derive(Debug, Clone, Default)]
pub struct SagaQuery {
    /// Only sagas in one of these statuses. Empty means any status.
    pub statuses: Vec<SagaStatus>,
    pub saga_type: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl SagaQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sagas a driver loop still has work for.
    pub fn active() -> Self {
        Self::new().statuses([SagaStatus::Started, SagaStatus::Compensating])
    }

    pub fn status(mut self, status: SagaStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn statuses(mut self, statuses: impl IntoIterator<Item = SagaStatus>) -> Self {
        self.statuses.extend(statuses);
        self
    }

    pub fn saga_type(mut self, saga_type: impl Into<String>) -> Self {
        self.saga_type = Some(saga_type.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Returns true if the saga passes the status and type filters.
    pub fn matches(&self, saga: &Saga) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&saga.status()) {
            return false;
        }
        if let Some(saga_type) = &self.saga_type
            && saga.saga_type() != saga_type
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_covers_started_and_compensating() {
        let query = SagaQuery::active();
        assert_eq!(
            query.statuses,
            vec![SagaStatus::Started, SagaStatus::Compensating]
        );
    }

    #[test]
    fn empty_query_matches_everything() {
        let saga = Saga::default();
        assert!(SagaQuery::new().matches(&saga));
        assert!(!SagaQuery::new().status(SagaStatus::Failed).matches(&saga));
        assert!(!SagaQuery::new().saga_type("create_order").matches(&saga));
    }
}
