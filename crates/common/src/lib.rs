//! Shared types for the saga orchestrator workspace.

pub mod clock;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use types::{SagaId, Version};
