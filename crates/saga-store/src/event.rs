use chrono::{DateTime, Utc};
use domain::{DomainEvent, SagaEvent};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, SagaId, Version};

/// Unique identifier for a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A journal entry: one saga event with its storage metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: EventId,
    pub saga_id: SagaId,
    /// The event variant name, e.g. "StepCompleted".
    pub event_type: String,
    /// Saga version after this entry was applied.
    pub version: Version,
    pub timestamp: DateTime<Utc>,
    /// The serialized [`SagaEvent`].
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Wraps a saga event for storage.
    pub fn record(
        saga_id: SagaId,
        version: Version,
        event: &SagaEvent,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            event_id: EventId::new(),
            saga_id,
            event_type: event.event_type().to_string(),
            version,
            timestamp,
            payload: serde_json::to_value(event)?,
        })
    }

    /// Wraps consecutive events, numbering them after `base`.
    pub fn record_all(
        saga_id: SagaId,
        base: Version,
        events: &[SagaEvent],
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<Self>> {
        events
            .iter()
            .enumerate()
            .map(|(offset, event)| {
                Self::record(saga_id, base.advance(offset + 1), event, timestamp)
            })
            .collect()
    }

    /// Decodes the payload back into a saga event.
    pub fn decode(&self) -> Result<SagaEvent> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use domain::saga::events::SagaRetriedData;

    use super::*;

    #[test]
    fn record_all_numbers_versions_after_base() {
        let saga_id = SagaId::new();
        let now = Utc::now();
        let events = vec![
            SagaEvent::SagaRetried(SagaRetriedData { retried_at: now }),
            SagaEvent::SagaRetried(SagaRetriedData { retried_at: now }),
        ];

        let envelopes = EventEnvelope::record_all(saga_id, Version::new(4), &events, now).unwrap();
        assert_eq!(envelopes[0].version, Version::new(5));
        assert_eq!(envelopes[1].version, Version::new(6));
        assert_eq!(envelopes[0].event_type, "SagaRetried");
        assert_ne!(envelopes[0].event_id, envelopes[1].event_id);
        assert_eq!(envelopes[1].decode().unwrap(), events[1]);
    }
}
