//! Event contract for running a saga by choreography.
//!
//! Instead of a central driver, each participant publishes a forward event
//! when its step succeeds and reacts to the others' events. A participant
//! that fails publishes the compensation request for every forward event
//! already emitted, and the original publisher undoes its step when it
//! sees the request. Delivery is at-least-once, so consumers deduplicate
//! by event id.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Choreography event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    OrderCreated,
    InventoryReserved,
    PaymentProcessed,
    NotificationSent,
    OrderCancellationRequested,
    InventoryReleaseRequested,
    PaymentRefundRequested,
    NotificationRetractionRequested,
}

impl EventKind {
    /// The event that asks the publisher of this one to undo it.
    ///
    /// Every forward event has one; compensation requests return `None`.
    pub fn compensation(&self) -> Option<EventKind> {
        match self {
            EventKind::OrderCreated => Some(EventKind::OrderCancellationRequested),
            EventKind::InventoryReserved => Some(EventKind::InventoryReleaseRequested),
            EventKind::PaymentProcessed => Some(EventKind::PaymentRefundRequested),
            EventKind::NotificationSent => Some(EventKind::NotificationRetractionRequested),
            EventKind::OrderCancellationRequested
            | EventKind::InventoryReleaseRequested
            | EventKind::PaymentRefundRequested
            | EventKind::NotificationRetractionRequested => None,
        }
    }

    /// For a compensation request, the forward event it undoes.
    pub fn compensates(&self) -> Option<EventKind> {
        match self {
            EventKind::OrderCancellationRequested => Some(EventKind::OrderCreated),
            EventKind::InventoryReleaseRequested => Some(EventKind::InventoryReserved),
            EventKind::PaymentRefundRequested => Some(EventKind::PaymentProcessed),
            EventKind::NotificationRetractionRequested => Some(EventKind::NotificationSent),
            _ => None,
        }
    }

    pub fn is_compensation(&self) -> bool {
        self.compensates().is_some()
    }
}

/// An event on the choreography bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoreographyEvent {
    /// Consumers deduplicate on this.
    pub event_id: Uuid,
    pub saga_id: SagaId,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl ChoreographyEvent {
    pub fn new(
        saga_id: SagaId,
        kind: EventKind,
        payload: serde_json::Value,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            saga_id,
            kind,
            payload,
            occurred_at,
        }
    }

    /// Builds the request to undo this event; `None` for a compensation request.
    pub fn compensation_request(&self, occurred_at: DateTime<Utc>) -> Option<ChoreographyEvent> {
        self.kind.compensation().map(|kind| {
            ChoreographyEvent::new(self.saga_id, kind, self.payload.clone(), occurred_at)
        })
    }
}

#[derive(Debug, Default)]
struct SeenEvents {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

/// Remembers recently handled event ids.
///
/// Holds at most `capacity` ids; the oldest are forgotten first.
#[derive(Debug, Clone)]
pub struct EventDeduplicator {
    seen: Arc<Mutex<SeenEvents>>,
    capacity: usize,
}

impl EventDeduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: Arc::new(Mutex::new(SeenEvents::default())),
            capacity: capacity.max(1),
        }
    }

    /// Returns true the first time an event id is seen.
    pub fn first_delivery(&self, event: &ChoreographyEvent) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if !seen.ids.insert(event.event_id) {
            return false;
        }
        seen.order.push_back(event.event_id);
        while seen.order.len() > self.capacity {
            if let Some(oldest) = seen.order.pop_front() {
                seen.ids.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventDeduplicator {
    fn default() -> Self {
        Self::new(10_000)
    }
}
