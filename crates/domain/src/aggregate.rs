//! Core aggregate and domain event traits.

use common::{SagaId, Version};
use serde::{Serialize, de::DeserializeOwned};

/// Trait for domain events.
///
/// Domain events are facts that have happened. They are immutable and
/// named in past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Returns the event type name used in the journal.
    fn event_type(&self) -> &'static str;
}

/// Trait for aggregates whose state only changes by applying events.
///
/// Command methods validate against the current state and return the
/// events to record; `apply` folds an event into the state and must be
/// pure and infallible.
pub trait Aggregate: Default + Send + Sync + Sized {
    /// The type of events this aggregate produces and consumes.
    type Event: DomainEvent;

    /// The type of errors command methods can produce.
    type Error: std::error::Error + Send + Sync;

    /// Returns the aggregate type name.
    fn aggregate_type() -> &'static str;

    /// Returns the aggregate's identifier.
    fn id(&self) -> SagaId;

    /// Returns the persisted version of the aggregate.
    fn version(&self) -> Version;

    /// Sets the aggregate version. Called by the store after a commit.
    fn set_version(&mut self, version: Version);

    /// Applies an event to the aggregate, updating its state.
    fn apply(&mut self, event: Self::Event);

    /// Applies multiple events in sequence.
    fn apply_events(&mut self, events: impl IntoIterator<Item = Self::Event>) {
        for event in events {
            self.apply(event);
        }
    }
}
