//! Persistence for saga records and their journals.
//!
//! Every saga transition is stored as one atomic write: the new record
//! together with the events that produced it, guarded by the version the
//! writer last observed.

pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod store;

pub use common::{SagaId, Version};
pub use error::{Result, StoreError};
pub use event::{EventEnvelope, EventId};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use query::SagaQuery;
pub use store::{SagaStore, SagaStoreExt};
